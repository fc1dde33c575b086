use crate::{format_fourcc, read_u32_be, read_u64_be, read_version_and_flags, BoxError};

use super::generic::{BoxHeader, Mp4Box};

// The `TfhdBox` struct represents a Track Fragment Header Box in the MP4 file
// format. It identifies the track a fragment belongs to and supplies
// per-fragment defaults (duration, size, flags) for samples whose `trun`
// entries omit those fields.
//
// Fields:
// - `track_id`: ID of the track this fragment belongs to.
// - `base_data_offset`: optional explicit anchor for sample data offsets.
//   When absent, offsets are relative to the enclosing `moof` box start
//   (the default-base-is-moof convention used by DASH content).
#[derive(Clone)]
pub struct TfhdBox {
    pub version: u8,
    pub flags: u32,
    pub track_id: u32,

    // Optional fields based on flags
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
}

impl Default for TfhdBox {
    fn default() -> Self {
        TfhdBox {
            version: 0,
            flags: 0,
            track_id: 1,
            base_data_offset: None,
            sample_description_index: None,
            default_sample_duration: None,
            default_sample_size: None,
            default_sample_flags: None,
        }
    }
}

impl std::fmt::Debug for TfhdBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfhdBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("flags", &format!("0x{:06X}", self.flags))
            .field("track_id", &self.track_id)
            .field("base_data_offset", &self.base_data_offset)
            .field("default_sample_duration", &self.default_sample_duration)
            .field("default_sample_size", &self.default_sample_size)
            .finish()
    }
}

impl Mp4Box for TfhdBox {
    fn box_type(&self) -> [u8; 4] {
        *b"tfhd"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"tfhd" {
            return Err(BoxError::Malformed("not a TFHD box".into()));
        }
        if data.len() < header.size as usize {
            return Err(BoxError::Truncated("incomplete TFHD box"));
        }

        let (version, flags) = read_version_and_flags(&data[8..])?;
        let mut offset = 12;

        let track_id = read_u32_be(data, offset)?;
        offset += 4;

        let base_data_offset = if flags & 0x000001 != 0 {
            let val = read_u64_be(data, offset)?;
            offset += 8;
            Some(val)
        } else {
            None
        };

        let sample_description_index = if flags & 0x000002 != 0 {
            let val = read_u32_be(data, offset)?;
            offset += 4;
            Some(val)
        } else {
            None
        };

        let default_sample_duration = if flags & 0x000008 != 0 {
            let val = read_u32_be(data, offset)?;
            offset += 4;
            Some(val)
        } else {
            None
        };

        let default_sample_size = if flags & 0x000010 != 0 {
            let val = read_u32_be(data, offset)?;
            offset += 4;
            Some(val)
        } else {
            None
        };

        let default_sample_flags = if flags & 0x000020 != 0 {
            Some(read_u32_be(data, offset)?)
        } else {
            None
        };

        Ok((
            TfhdBox {
                version,
                flags,
                track_id,
                base_data_offset,
                sample_description_index,
                default_sample_duration,
                default_sample_size,
                default_sample_flags,
            },
            header.size as usize,
        ))
    }
}
