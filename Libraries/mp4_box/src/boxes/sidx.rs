use crate::{
    format_fourcc, read_u16_be, read_u32_be, read_u64_be, read_version_and_flags, BoxError,
};

use super::generic::{BoxHeader, Mp4Box};

/// One reference row of a segment index.
#[derive(Debug, Clone, Copy)]
pub struct SidxReference {
    /// True when the reference points at a nested `sidx` box rather than at
    /// media; the nested index must be resolved and its entries spliced in.
    pub is_index: bool,
    /// Byte size of the referenced material.
    pub referenced_size: u32,
    /// Duration of the referenced material in `timescale` units.
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
}

/// The `SidxBox` struct represents a Segment Index Box (`sidx`) in the MP4
/// file format. It maps byte ranges of the file to time ranges of one track,
/// which is how a DASH client addresses individual fragments inside a single
/// byte-range-addressed representation.
///
/// Versions 0 and 1 differ only in the width of `earliest_presentation_time`
/// and `first_offset` (32 vs 64 bits).
#[derive(Default, Clone)]
pub struct SidxBox {
    pub version: u8,
    pub flags: u32,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    /// Distance from the first byte after this box to the first referenced
    /// byte.
    pub first_offset: u64,
    pub references: Vec<SidxReference>,
}

impl std::fmt::Debug for SidxBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidxBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("version", &self.version)
            .field("timescale", &self.timescale)
            .field(
                "earliest_presentation_time",
                &self.earliest_presentation_time,
            )
            .field("first_offset", &self.first_offset)
            .field("reference_count", &self.references.len())
            .finish()
    }
}

impl Mp4Box for SidxBox {
    fn box_type(&self) -> [u8; 4] {
        *b"sidx"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"sidx" {
            return Err(BoxError::Malformed("not a SIDX box".into()));
        }
        let size = header.size as usize;
        if data.len() < size {
            // A sidx is routinely fetched with a guessed byte range; report
            // the exact requirement so the fetcher can widen it.
            return Err(BoxError::BufferTooSmall { needed: size as u64 });
        }

        let (version, flags) = read_version_and_flags(&data[8..])?;
        let reference_id = read_u32_be(data, 12)?;
        let timescale = read_u32_be(data, 16)?;
        if timescale == 0 {
            return Err(BoxError::Malformed("SIDX timescale is zero".into()));
        }

        let mut offset = 20;
        let (earliest_presentation_time, first_offset) = match version {
            0 => {
                let ept = read_u32_be(data, offset)? as u64;
                let fo = read_u32_be(data, offset + 4)? as u64;
                offset += 8;
                (ept, fo)
            }
            1 => {
                let ept = read_u64_be(data, offset)?;
                let fo = read_u64_be(data, offset + 8)?;
                offset += 16;
                (ept, fo)
            }
            v => {
                return Err(BoxError::Unsupported(format!("SIDX version {}", v)));
            }
        };

        offset += 2; // reserved
        let reference_count = read_u16_be(data, offset)? as usize;
        offset += 2;

        if offset + reference_count * 12 > size {
            return Err(BoxError::Malformed(format!(
                "SIDX reference table ({} entries) exceeds box size {}",
                reference_count, size
            )));
        }

        let mut references = Vec::with_capacity(reference_count);
        for _ in 0..reference_count {
            let word = read_u32_be(data, offset)?;
            let subsegment_duration = read_u32_be(data, offset + 4)?;
            let sap = read_u32_be(data, offset + 8)?;
            offset += 12;

            references.push(SidxReference {
                is_index: word & 0x8000_0000 != 0,
                referenced_size: word & 0x7FFF_FFFF,
                subsegment_duration,
                starts_with_sap: sap & 0x8000_0000 != 0,
            });
        }

        Ok((
            SidxBox {
                version,
                flags,
                reference_id,
                timescale,
                earliest_presentation_time,
                first_offset,
                references,
            },
            size,
        ))
    }
}

/// Test-only builder for synthesizing `sidx` bytes; also used by the reader
/// tests for nested-index fixtures.
#[cfg(test)]
pub(crate) fn build_sidx(
    version: u8,
    timescale: u32,
    ept: u64,
    first_offset: u64,
    refs: &[(bool, u32, u32)],
) -> Vec<u8> {
    let mut payload = vec![];
    payload.push(version);
    payload.extend_from_slice(&[0, 0, 0]); // flags
    payload.extend_from_slice(&1u32.to_be_bytes()); // reference_ID
    payload.extend_from_slice(&timescale.to_be_bytes());
    if version == 1 {
        payload.extend_from_slice(&ept.to_be_bytes());
        payload.extend_from_slice(&first_offset.to_be_bytes());
    } else {
        payload.extend_from_slice(&(ept as u32).to_be_bytes());
        payload.extend_from_slice(&(first_offset as u32).to_be_bytes());
    }
    payload.extend_from_slice(&0u16.to_be_bytes()); // reserved
    payload.extend_from_slice(&(refs.len() as u16).to_be_bytes());
    for &(is_index, size, duration) in refs {
        let word = if is_index { 0x8000_0000 | size } else { size };
        payload.extend_from_slice(&word.to_be_bytes());
        payload.extend_from_slice(&duration.to_be_bytes());
        payload.extend_from_slice(&0x9000_0000u32.to_be_bytes()); // SAP
    }

    let mut data = vec![];
    data.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    data.extend_from_slice(b"sidx");
    data.extend_from_slice(&payload);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_zero_fields() {
        let data = build_sidx(0, 1000, 500, 0, &[(false, 100, 1000), (false, 200, 1000)]);
        let (sidx, consumed) = SidxBox::read_box(&data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(sidx.timescale, 1000);
        assert_eq!(sidx.earliest_presentation_time, 500);
        assert_eq!(sidx.references.len(), 2);
        assert!(!sidx.references[0].is_index);
        assert_eq!(sidx.references[1].referenced_size, 200);
    }

    #[test]
    fn version_one_wide_fields() {
        let ept = u64::from(u32::MAX) + 17;
        let data = build_sidx(1, 90_000, ept, 44, &[(true, 64, 90_000)]);
        let (sidx, _) = SidxBox::read_box(&data).unwrap();
        assert_eq!(sidx.earliest_presentation_time, ept);
        assert_eq!(sidx.first_offset, 44);
        assert!(sidx.references[0].is_index);
    }

    #[test]
    fn partial_buffer_requests_full_box() {
        let data = build_sidx(0, 1000, 0, 0, &[(false, 100, 1000)]);
        let full = data.len() as u64;
        match SidxBox::read_box(&data[..data.len() - 4]) {
            Err(BoxError::BufferTooSmall { needed }) => assert_eq!(needed, full),
            other => panic!("expected BufferTooSmall, got {:?}", other.map(|_| ())),
        }
    }
}
