use crate::{format_fourcc, read_version_and_flags, BoxError};

use super::generic::{BoxHeader, Mp4Box};

// The `PsshBox` struct represents a Protection System Specific Header Box.
// It identifies a DRM system by UUID and carries that system's opaque
// initialization data.
//
// The raw bytes are kept alongside the parsed system ID: DRM modules consume
// the verbatim box, not a re-serialization.
#[derive(Clone)]
pub struct PsshBox {
    pub version: u8,
    pub system_id: [u8; 16],
    /// The complete box as it appeared on the wire, header included.
    pub raw: Vec<u8>,
}

impl PsshBox {
    /// The system ID in the canonical hyphenated UUID form, lowercase.
    pub fn system_id_hyphenated(&self) -> String {
        let id = &self.system_id;
        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7],
            id[8], id[9], id[10], id[11], id[12], id[13], id[14], id[15],
        )
    }
}

impl std::fmt::Debug for PsshBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PsshBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("version", &self.version)
            .field("system_id", &self.system_id_hyphenated())
            .field("size", &self.raw.len())
            .finish()
    }
}

impl Mp4Box for PsshBox {
    fn box_type(&self) -> [u8; 4] {
        *b"pssh"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"pssh" {
            return Err(BoxError::Malformed("not a PSSH box".into()));
        }
        let size = header.size as usize;
        if data.len() < size {
            return Err(BoxError::Truncated("incomplete PSSH box"));
        }
        if size < 28 {
            return Err(BoxError::Malformed("PSSH box too small".into()));
        }

        let (version, _flags) = read_version_and_flags(&data[8..])?;
        let mut system_id = [0u8; 16];
        system_id.copy_from_slice(&data[12..28]);

        Ok((
            PsshBox {
                version,
                system_id,
                raw: data[..size].to_vec(),
            },
            size,
        ))
    }
}
