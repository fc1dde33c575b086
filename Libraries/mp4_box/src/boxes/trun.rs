use crate::{format_fourcc, read_i32_be, read_u32_be, read_version_and_flags, BoxError};

use super::generic::{BoxHeader, Mp4Box};

// Trun flag bits. Which per-sample fields are present is driven entirely by
// these flags; absent fields fall back to the `tfhd` defaults.
const FLAG_DATA_OFFSET: u32 = 0x000001;
const FLAG_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const FLAG_SAMPLE_DURATION: u32 = 0x000100;
const FLAG_SAMPLE_SIZE: u32 = 0x000200;
const FLAG_SAMPLE_FLAGS: u32 = 0x000400;
const FLAG_SAMPLE_CTS: u32 = 0x000800;

/// One row of the track run table. Fields left `None` on the wire are filled
/// in by the caller from the `tfhd` defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrunEntry {
    pub sample_duration: Option<u32>,
    pub sample_size: Option<u32>,
    pub sample_flags: Option<u32>,
    /// Composition time offset; signed in trun version 1.
    pub sample_cts_offset: Option<i32>,
}

/// The `TrunBox` struct represents a Track Fragment Run Box (`trun`) in the
/// MP4 file format. It is the per-sample table of a track fragment: sample
/// count, an optional offset of the first sample's payload, and per-sample
/// duration/size/flags rows.
#[derive(Default, Clone)]
pub struct TrunBox {
    pub version: u8,
    pub flags: u32,
    /// Offset of the first sample payload, relative to the fragment's base
    /// data offset (usually the `moof` start).
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub entries: Vec<TrunEntry>,
}

impl std::fmt::Debug for TrunBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrunBox")
            .field("box_type", &format_fourcc(&self.box_type()))
            .field("version", &self.version)
            .field("flags", &format!("0x{:06X}", self.flags))
            .field("data_offset", &self.data_offset)
            .field("sample_count", &self.entries.len())
            .finish()
    }
}

impl Mp4Box for TrunBox {
    fn box_type(&self) -> [u8; 4] {
        *b"trun"
    }

    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError> {
        let header = BoxHeader::read(data, 0)?;
        if &header.box_type != b"trun" {
            return Err(BoxError::Malformed("not a TRUN box".into()));
        }
        if data.len() < header.size as usize {
            return Err(BoxError::Truncated("incomplete TRUN box"));
        }

        let (version, flags) = read_version_and_flags(&data[8..])?;
        let sample_count = read_u32_be(data, 12)? as usize;
        let mut offset = 16;

        let data_offset = if flags & FLAG_DATA_OFFSET != 0 {
            let val = read_i32_be(data, offset)?;
            offset += 4;
            Some(val)
        } else {
            None
        };

        let first_sample_flags = if flags & FLAG_FIRST_SAMPLE_FLAGS != 0 {
            let val = read_u32_be(data, offset)?;
            offset += 4;
            Some(val)
        } else {
            None
        };

        // Row width is fixed by the flags, so the whole table can be
        // validated before decoding any entry.
        let mut row_len = 0usize;
        for bit in [
            FLAG_SAMPLE_DURATION,
            FLAG_SAMPLE_SIZE,
            FLAG_SAMPLE_FLAGS,
            FLAG_SAMPLE_CTS,
        ] {
            if flags & bit != 0 {
                row_len += 4;
            }
        }
        let table_end = offset + row_len * sample_count;
        if table_end > header.size as usize {
            return Err(BoxError::Malformed(format!(
                "TRUN table ({} samples) exceeds box size {}",
                sample_count, header.size
            )));
        }

        let mut entries = Vec::with_capacity(sample_count);
        for _ in 0..sample_count {
            let mut entry = TrunEntry::default();
            if flags & FLAG_SAMPLE_DURATION != 0 {
                entry.sample_duration = Some(read_u32_be(data, offset)?);
                offset += 4;
            }
            if flags & FLAG_SAMPLE_SIZE != 0 {
                entry.sample_size = Some(read_u32_be(data, offset)?);
                offset += 4;
            }
            if flags & FLAG_SAMPLE_FLAGS != 0 {
                entry.sample_flags = Some(read_u32_be(data, offset)?);
                offset += 4;
            }
            if flags & FLAG_SAMPLE_CTS != 0 {
                // Version 0 carries an unsigned offset; reinterpreting keeps
                // the arithmetic uniform downstream.
                entry.sample_cts_offset = Some(read_i32_be(data, offset)?);
                offset += 4;
            }
            entries.push(entry);
        }

        Ok((
            TrunBox {
                version,
                flags,
                data_offset,
                first_sample_flags,
                entries,
            },
            header.size as usize,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_trun(flags: u32, rows: &[[u32; 2]]) -> Vec<u8> {
        let mut payload = vec![];
        payload.push(0u8); // version
        payload.extend_from_slice(&flags.to_be_bytes()[1..]);
        payload.extend_from_slice(&(rows.len() as u32).to_be_bytes());
        payload.extend_from_slice(&64i32.to_be_bytes()); // data_offset
        for row in rows {
            payload.extend_from_slice(&row[0].to_be_bytes()); // duration
            payload.extend_from_slice(&row[1].to_be_bytes()); // size
        }

        let mut data = vec![];
        data.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        data.extend_from_slice(b"trun");
        data.extend_from_slice(&payload);
        data
    }

    #[test]
    fn multi_sample_table() {
        let flags = FLAG_DATA_OFFSET | FLAG_SAMPLE_DURATION | FLAG_SAMPLE_SIZE;
        let data = build_trun(flags, &[[1000, 100], [1000, 200], [500, 300]]);

        let (trun, consumed) = TrunBox::read_box(&data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(trun.data_offset, Some(64));
        assert_eq!(trun.entries.len(), 3);
        assert_eq!(trun.entries[1].sample_size, Some(200));
        assert_eq!(trun.entries[2].sample_duration, Some(500));
        assert!(trun.entries[0].sample_flags.is_none());
    }

    #[test]
    fn oversized_sample_count_rejected() {
        let flags = FLAG_DATA_OFFSET | FLAG_SAMPLE_DURATION | FLAG_SAMPLE_SIZE;
        let mut data = build_trun(flags, &[[1000, 100]]);
        // Claim more rows than the box holds.
        data[12..16].copy_from_slice(&1_000u32.to_be_bytes());

        assert!(matches!(
            TrunBox::read_box(&data),
            Err(BoxError::Malformed(_))
        ));
    }
}
