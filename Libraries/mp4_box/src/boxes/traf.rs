use crate::{format_fourcc, BoxError};

use super::generic::{BoxHeader, Mp4Box};
use super::subs::SubsBox;
use super::tfdt::TfdtBox;
use super::tfhd::TfhdBox;
use super::trun::TrunBox;

// The `TrafBox` struct represents a Track Fragment Box in the MP4 file
// format. It groups everything describing one track's samples within a movie
// fragment:
// - `tfhd`: the track fragment header with per-fragment sample defaults.
// - `tfdt`: optional decode time of the first sample.
// - `truns`: one or more sample run tables.
// - `subs`: optional sub-sample information, preserved raw for subtitles.
#[derive(Default, Clone)]
pub struct TrafBox {
    pub tfhd: TfhdBox,
    pub tfdt: Option<TfdtBox>,
    pub truns: Vec<TrunBox>,
    pub subs: Option<SubsBox>,
}

impl std::fmt::Debug for TrafBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("tfhd", &self.tfhd)
            .field("tfdt", &self.tfdt)
            .field("truns", &self.truns)
            .field("subs", &self.subs)
            .finish()
    }
}

impl Mp4Box for TrafBox {
    fn box_type(&self) -> [u8; 4] {
        *b"traf"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"traf" {
            return Err(BoxError::Malformed("not a TRAF box".into()));
        }
        let size = header.size as usize;
        if data.len() < size {
            return Err(BoxError::Truncated("incomplete TRAF box"));
        }

        let mut offset = 8;
        let mut tfhd = None;
        let mut tfdt = None;
        let mut truns = Vec::new();
        let mut subs = None;

        while offset + 8 <= size {
            let sub = BoxHeader::read(data, offset)?;
            let sub_size = sub.size as usize;
            if offset + sub_size > size || sub_size < 8 {
                return Err(BoxError::Malformed("invalid sub-box size inside TRAF".into()));
            }
            let sub_data = &data[offset..offset + sub_size];

            match &sub.box_type {
                b"tfhd" => {
                    if tfhd.is_some() {
                        return Err(BoxError::Malformed("duplicate TFHD inside TRAF".into()));
                    }
                    let (parsed, _) = TfhdBox::read_box(sub_data)?;
                    tfhd = Some(parsed);
                }
                b"tfdt" => {
                    if tfdt.is_some() {
                        return Err(BoxError::Malformed("duplicate TFDT inside TRAF".into()));
                    }
                    let (parsed, _) = TfdtBox::read_box(sub_data)?;
                    tfdt = Some(parsed);
                }
                b"trun" => {
                    let (parsed, _) = TrunBox::read_box(sub_data)?;
                    truns.push(parsed);
                }
                b"subs" => {
                    let (parsed, _) = SubsBox::read_box(sub_data)?;
                    subs = Some(parsed);
                }
                _ => {
                    // Skip unknown boxes
                }
            }

            offset += sub_size;
        }

        let tfhd = tfhd.ok_or_else(|| BoxError::Malformed("missing TFHD inside TRAF".into()))?;

        Ok((
            TrafBox {
                tfhd,
                tfdt,
                truns,
                subs,
            },
            size,
        ))
    }
}
