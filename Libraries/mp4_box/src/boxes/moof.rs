use crate::{format_fourcc, BoxError};

use super::generic::{BoxHeader, Mp4Box};
use super::mfhd::MfhdBox;
use super::traf::TrafBox;

// The `MoofBox` struct represents a Movie Fragment Box in the MP4 file
// format. It groups a movie fragment header and one or more track fragments;
// the sample payloads it describes live in the `mdat` box that follows.
//
// Fields:
// - `mfhd`: the Movie Fragment Header Box with the fragment sequence number.
// - `trafs`: one Track Fragment Box per track present in this fragment.
#[derive(Default, Clone)]
pub struct MoofBox {
    pub mfhd: MfhdBox,
    pub trafs: Vec<TrafBox>,
}

impl std::fmt::Debug for MoofBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoofBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("mfhd", &self.mfhd)
            .field("trafs", &self.trafs)
            .finish()
    }
}

impl Mp4Box for MoofBox {
    fn box_type(&self) -> [u8; 4] {
        *b"moof"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"moof" {
            return Err(BoxError::Malformed("not a MOOF box".into()));
        }
        let size = header.size as usize;
        if data.len() < size {
            return Err(BoxError::Truncated("incomplete MOOF box"));
        }

        let mut offset = 8;
        let mut mfhd = None;
        let mut trafs = Vec::new();

        while offset + 8 <= size {
            let sub = BoxHeader::read(data, offset)?;
            let sub_size = sub.size as usize;
            if offset + sub_size > size || sub_size < 8 {
                return Err(BoxError::Malformed("invalid sub-box size inside MOOF".into()));
            }
            let sub_data = &data[offset..offset + sub_size];

            match &sub.box_type {
                b"mfhd" => {
                    let (parsed, _) = MfhdBox::read_box(sub_data)?;
                    mfhd = Some(parsed);
                }
                b"traf" => {
                    let (parsed, _) = TrafBox::read_box(sub_data)?;
                    trafs.push(parsed);
                }
                _ => {
                    // Skip unknown boxes
                }
            }

            offset += sub_size;
        }

        if trafs.is_empty() {
            return Err(BoxError::Malformed(
                "MOOF box must contain at least one TRAF box".into(),
            ));
        }

        Ok((
            MoofBox {
                mfhd: mfhd.unwrap_or_default(),
                trafs,
            },
            size,
        ))
    }
}
