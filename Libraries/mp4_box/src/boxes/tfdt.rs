use crate::{format_fourcc, read_u32_be, read_u64_be, read_version_and_flags, BoxError};

use super::generic::{BoxHeader, Mp4Box};

// The `TfdtBox` struct represents a Track Fragment Decode Time Box in the MP4
// file format. It specifies the decode time of the first sample in a track
// fragment, expressed in the track's timescale.
//
// Fields:
// - `base_decode_time`: timeline position of the first sample in timescale
//   units. 32-bit in version 0, 64-bit in version 1.
#[derive(Default, Clone)]
pub struct TfdtBox {
    pub version: u8,
    pub flags: u32,
    pub base_decode_time: u64,
}

impl std::fmt::Debug for TfdtBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TfdtBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("version", &self.version)
            .field("base_decode_time", &self.base_decode_time)
            .finish()
    }
}

impl Mp4Box for TfdtBox {
    fn box_type(&self) -> [u8; 4] {
        *b"tfdt"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"tfdt" {
            return Err(BoxError::Malformed("not a TFDT box".into()));
        }
        if data.len() < header.size as usize {
            return Err(BoxError::Truncated("incomplete TFDT box"));
        }

        let (version, flags) = read_version_and_flags(&data[8..])?;

        let base_decode_time = match version {
            0 => read_u32_be(data, 12)? as u64,
            1 => read_u64_be(data, 12)?,
            v => {
                return Err(BoxError::Unsupported(format!("TFDT version {}", v)));
            }
        };

        Ok((
            TfdtBox {
                version,
                flags,
                base_decode_time,
            },
            header.size as usize,
        ))
    }
}
