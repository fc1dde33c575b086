use crate::{format_fourcc, read_u32_be, read_u64_be, read_version_and_flags, BoxError};

use super::generic::{BoxHeader, Mp4Box};

// The `TkhdBox` struct represents a Track Header Box in the MP4 file format.
// It contains metadata about one track: its ID, duration, and presentation
// geometry.
//
// The raw bytes of the box are kept alongside the parsed fields: subtitle
// decoding downstream needs the verbatim track header prepended to sample
// payloads, because plain sample bytes carry no track or timing context.
#[derive(Clone)]
pub struct TkhdBox {
    pub version: u8,
    pub flags: u32,
    pub track_id: u32,
    pub duration: u64,
    pub width: u32,  // 16.16 fixed-point
    pub height: u32, // 16.16 fixed-point
    /// The complete box as it appeared on the wire, header included.
    pub raw: Vec<u8>,
}

impl std::fmt::Debug for TkhdBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TkhdBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("track_id", &self.track_id)
            .field("duration", &self.duration)
            .field("width", &format!("{} px", self.width >> 16))
            .field("height", &format!("{} px", self.height >> 16))
            .finish()
    }
}

impl Mp4Box for TkhdBox {
    fn box_type(&self) -> [u8; 4] {
        *b"tkhd"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"tkhd" {
            return Err(BoxError::Malformed("not a TKHD box".into()));
        }
        let size = header.size as usize;
        if data.len() < size {
            return Err(BoxError::Truncated("incomplete TKHD box"));
        }

        let (version, flags) = read_version_and_flags(&data[8..])?;
        let mut offset = 12;

        let (track_id, duration) = if version == 1 {
            let tid = read_u32_be(data, offset + 16)?;
            let dur = read_u64_be(data, offset + 24)?;
            offset += 32;
            (tid, dur)
        } else {
            let tid = read_u32_be(data, offset + 8)?;
            let dur = read_u32_be(data, offset + 16)? as u64;
            offset += 20;
            (tid, dur)
        };

        offset += 8; // reserved[2]
        offset += 8; // layer, alternate_group, volume, reserved
        offset += 36; // unity matrix

        let width = read_u32_be(data, offset)?;
        let height = read_u32_be(data, offset + 4)?;

        Ok((
            TkhdBox {
                version,
                flags,
                track_id,
                duration,
                width,
                height,
                raw: data[..size].to_vec(),
            },
            size,
        ))
    }
}
