use crate::{format_fourcc, read_u32_be, read_version_and_flags, BoxError};

use super::generic::{BoxHeader, Mp4Box};

// The `MfhdBox` struct represents a Movie Fragment Header Box in the MP4 file
// format. It carries the sequence number of the fragment, which increases by
// one for each movie fragment in the stream.
//
// Fields:
// - `sequence_number`: ordinal of this fragment within the stream.
#[derive(Default, Clone)]
pub struct MfhdBox {
    pub version: u8,
    pub flags: u32,
    pub sequence_number: u32,
}

impl std::fmt::Debug for MfhdBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfhdBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

impl Mp4Box for MfhdBox {
    fn box_type(&self) -> [u8; 4] {
        *b"mfhd"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"mfhd" {
            return Err(BoxError::Malformed("not a MFHD box".into()));
        }
        if data.len() < header.size as usize {
            return Err(BoxError::Truncated("incomplete MFHD box"));
        }

        let (version, flags) = read_version_and_flags(&data[8..])?;
        let sequence_number = read_u32_be(data, 12)?;

        Ok((
            MfhdBox {
                version,
                flags,
                sequence_number,
            },
            header.size as usize,
        ))
    }
}
