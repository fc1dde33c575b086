use crate::{format_fourcc, read_u32_be, read_version_and_flags, BoxError};

use super::generic::{BoxHeader, Mp4Box};

// The `SubsBox` struct represents a Sub-Sample Information Box in the MP4
// file format. Subtitle tracks use it to describe how a sample is split into
// sub-samples (e.g. text payload and styling records).
//
// The client does not interpret the table itself; the raw box bytes are kept
// so they can be prepended to subtitle sample payloads, which is what the
// downstream subtitle decoder expects.
#[derive(Default, Clone)]
pub struct SubsBox {
    pub version: u8,
    pub flags: u32,
    pub entry_count: u32,
    /// The complete box as it appeared on the wire, header included.
    pub raw: Vec<u8>,
}

impl std::fmt::Debug for SubsBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("entry_count", &self.entry_count)
            .field("raw_len", &self.raw.len())
            .finish()
    }
}

impl Mp4Box for SubsBox {
    fn box_type(&self) -> [u8; 4] {
        *b"subs"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"subs" {
            return Err(BoxError::Malformed("not a SUBS box".into()));
        }
        let size = header.size as usize;
        if data.len() < size {
            return Err(BoxError::Truncated("incomplete SUBS box"));
        }

        let (version, flags) = read_version_and_flags(&data[8..])?;
        let entry_count = read_u32_be(data, 12)?;

        Ok((
            SubsBox {
                version,
                flags,
                entry_count,
                raw: data[..size].to_vec(),
            },
            size,
        ))
    }
}
