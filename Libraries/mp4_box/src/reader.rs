//! Segment-level entry points used by the DASH segment fetcher.
//!
//! All three functions consume a byte slice holding a (possibly partial)
//! download of a segment. When the requested structure extends past the
//! buffered bytes, `BoxError::BufferTooSmall { needed }` tells the caller the
//! byte-range size to retry with.

use crate::boxes::generic::{BoxHeader, Mp4Box};
use crate::boxes::moof::MoofBox;
use crate::boxes::pssh::PsshBox;
use crate::boxes::sidx::SidxBox;
use crate::boxes::tkhd::TkhdBox;
use crate::BoxError;

/// One track found in an initialization segment.
#[derive(Debug, Clone, Default)]
pub struct InitTrack {
    pub track_id: u32,
    /// Raw `tkhd` box bytes, prepended to subtitle sample payloads.
    pub tkhd_raw: Vec<u8>,
    /// Raw sample-entry records from the track's `stsd` box, emitted as
    /// codec-configuration access units before the first media sample.
    pub codec_configs: Vec<Vec<u8>>,
}

/// Result of scanning an initialization segment.
#[derive(Debug, Clone, Default)]
pub struct InitInfo {
    /// End offset of the `moov` box, i.e. the initialization segment size.
    pub init_segment_size: u64,
    /// Offset and size of a `sidx` box following the `moov`, when the file is
    /// self-indexed (SegmentBase addressing).
    pub sidx_range: Option<(u64, u64)>,
    pub tracks: Vec<InitTrack>,
    /// In-band DRM signaling found under the `moov`.
    pub pssh: Vec<PsshBox>,
}

/// One flattened segment-index entry: a byte range and the time range it
/// covers, in `SegmentIndex::timescale` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSegment {
    /// Absolute byte offset within the representation's file.
    pub offset: u64,
    pub size: u32,
    pub time_ticks: u64,
    pub duration_ticks: u64,
}

/// A fully resolved segment index: nested `sidx` references have been
/// recursively expanded and spliced in place.
#[derive(Debug, Clone, Default)]
pub struct SegmentIndex {
    pub timescale: u32,
    pub subsegments: Vec<SubSegment>,
}

/// One decoded media sample from a fragment.
#[derive(Debug, Clone)]
pub struct Sample {
    pub time_ticks: u64,
    pub duration_ticks: u32,
    pub sync: bool,
    pub data: Vec<u8>,
}

/// Result of decoding one movie fragment (`moof` + `mdat`).
#[derive(Debug, Clone, Default)]
pub struct FragmentData {
    pub track_id: u32,
    pub base_decode_time: Option<u64>,
    pub samples: Vec<Sample>,
    /// Raw `subs` box bytes seen in this fragment, preserved for subtitle
    /// payload reconstruction.
    pub subs_raw: Option<Vec<u8>>,
}

// Container boxes that hold the boxes we are after inside `moov`.
const MOOV_CONTAINERS: [&[u8; 4]; 4] = [b"trak", b"mdia", b"minf", b"stbl"];

/// Scans the top-level boxes of an initialization segment.
///
/// Finds the `moov` box and records its end offset as the initialization
/// segment size, preserving each track's `tkhd` bytes and `stsd` sample
/// entries. A `sidx` box directly after the `moov` is reported by range; if
/// either box extends past the buffered bytes the scan fails with
/// `BufferTooSmall` so the caller can widen its byte range.
pub fn parse_init(data: &[u8]) -> Result<InitInfo, BoxError> {
    let mut offset = 0usize;
    let mut info: Option<InitInfo> = None;

    loop {
        let header = match BoxHeader::read(data, offset) {
            Ok(h) => h,
            Err(BoxError::BufferTooSmall { needed }) => {
                match info {
                    // The moov was already found and no sidx header is
                    // visible yet; a trailing partial header is fine.
                    Some(info) => return Ok(info),
                    None => return Err(BoxError::BufferTooSmall { needed }),
                }
            }
            Err(e) => return Err(e),
        };
        let end = header.end(offset);

        match &header.box_type {
            b"moov" => {
                if end > data.len() as u64 {
                    return Err(BoxError::BufferTooSmall { needed: end });
                }
                let (tracks, pssh) = scan_moov(&data[offset..end as usize], header.payload_offset())?;
                info = Some(InitInfo {
                    init_segment_size: end,
                    sidx_range: None,
                    tracks,
                    pssh,
                });
            }
            b"sidx" => {
                if end > data.len() as u64 {
                    return Err(BoxError::BufferTooSmall { needed: end });
                }
                if let Some(info) = info.as_mut() {
                    info.sidx_range = Some((offset as u64, header.size));
                    return Ok(info.clone());
                }
            }
            _ => {
                // ftyp, free, styp and friends are skipped by size.
            }
        }

        if end as usize >= data.len() {
            return match info {
                Some(info) => Ok(info),
                // No moov within the buffer; the caller must fetch more.
                None => Err(BoxError::BufferTooSmall {
                    needed: end.max(data.len() as u64 + 1),
                }),
            };
        }
        offset = end as usize;
    }
}

fn scan_moov(
    moov: &[u8],
    payload_offset: usize,
) -> Result<(Vec<InitTrack>, Vec<PsshBox>), BoxError> {
    let mut tracks = Vec::new();
    let mut pssh = Vec::new();
    scan_container(moov, payload_offset, moov.len(), &mut |box_data, header| {
        match &header.box_type {
            b"trak" => {
                let mut track = InitTrack::default();
                collect_trak(box_data, header.payload_offset(), &mut track)?;
                tracks.push(track);
            }
            b"pssh" => {
                let (parsed, _) = PsshBox::read_box(box_data)?;
                pssh.push(parsed);
            }
            _ => {}
        }
        Ok(())
    })?;
    Ok((tracks, pssh))
}

fn collect_trak(trak: &[u8], payload_offset: usize, track: &mut InitTrack) -> Result<(), BoxError> {
    scan_container(trak, payload_offset, trak.len(), &mut |box_data, header| {
        match &header.box_type {
            b"tkhd" => {
                let (tkhd, _) = TkhdBox::read_box(box_data)?;
                track.track_id = tkhd.track_id;
                track.tkhd_raw = tkhd.raw;
            }
            b"stsd" => {
                track.codec_configs = stsd_entries(box_data)?;
            }
            t if MOOV_CONTAINERS.contains(&t) => {
                collect_trak(box_data, header.payload_offset(), track)?;
            }
            _ => {}
        }
        Ok(())
    })
}

/// Walks the direct children of a container box, invoking `visit` with each
/// child's bytes and header.
fn scan_container(
    data: &[u8],
    start: usize,
    end: usize,
    visit: &mut dyn FnMut(&[u8], &BoxHeader) -> Result<(), BoxError>,
) -> Result<(), BoxError> {
    let mut offset = start;
    while offset + 8 <= end {
        let header = BoxHeader::read(data, offset)?;
        let child_end = header.end(offset);
        if child_end as usize > end || header.size < 8 {
            return Err(BoxError::Malformed("invalid child box size".into()));
        }
        visit(&data[offset..child_end as usize], &header)?;
        offset = child_end as usize;
    }
    Ok(())
}

/// Extracts the raw sample-entry records of an `stsd` box.
fn stsd_entries(stsd: &[u8]) -> Result<Vec<Vec<u8>>, BoxError> {
    let header = BoxHeader::read(stsd, 0)?;
    let size = header.size as usize;
    if stsd.len() < size {
        return Err(BoxError::Truncated("incomplete STSD box"));
    }
    let entry_count = crate::read_u32_be(stsd, 12)? as usize;

    let mut entries = Vec::with_capacity(entry_count);
    let mut offset = 16;
    for _ in 0..entry_count {
        if offset + 8 > size {
            return Err(BoxError::Malformed("STSD entry table truncated".into()));
        }
        let entry = BoxHeader::read(stsd, offset)?;
        let entry_end = entry.end(offset) as usize;
        if entry_end > size || entry.size < 8 {
            return Err(BoxError::Malformed("invalid STSD sample entry size".into()));
        }
        entries.push(stsd[offset..entry_end].to_vec());
        offset = entry_end;
    }
    Ok(entries)
}

/// Recursively resolves a segment index into a flat list of sub-segments.
///
/// `box_offset` locates the `sidx` box within `data`; `abs_base` is the
/// absolute file offset of `data[0]`, so the returned byte offsets are
/// absolute. References flagged as nested indexes are parsed from the same
/// buffer and their entries spliced in place, in order.
pub fn parse_sidx(data: &[u8], box_offset: usize, abs_base: u64) -> Result<SegmentIndex, BoxError> {
    let (sidx, consumed) = SidxBox::read_box(
        data.get(box_offset..)
            .ok_or(BoxError::Truncated("SIDX offset out of bounds"))?,
    )?;

    let mut index = SegmentIndex {
        timescale: sidx.timescale,
        subsegments: Vec::with_capacity(sidx.references.len()),
    };

    // Byte offsets accumulate from the end of the box, adjusted by
    // first_offset; times accumulate from the earliest presentation time.
    let mut cursor = abs_base + (box_offset + consumed) as u64 + sidx.first_offset;
    let mut time = sidx.earliest_presentation_time;

    for reference in &sidx.references {
        if reference.is_index {
            let child_offset = cursor
                .checked_sub(abs_base)
                .ok_or_else(|| BoxError::Malformed("nested SIDX before buffer start".into()))?
                as usize;
            let child_end = child_offset as u64 + reference.referenced_size as u64;
            if child_end > data.len() as u64 {
                return Err(BoxError::BufferTooSmall { needed: child_end });
            }
            let child = parse_sidx(data, child_offset, abs_base)?;
            if child.timescale != sidx.timescale {
                return Err(BoxError::Unsupported(
                    "nested SIDX with different timescale".into(),
                ));
            }
            index.subsegments.extend(child.subsegments);
        } else {
            index.subsegments.push(SubSegment {
                offset: cursor,
                size: reference.referenced_size,
                time_ticks: time,
                duration_ticks: reference.subsegment_duration as u64,
            });
        }
        cursor += reference.referenced_size as u64;
        time += reference.subsegment_duration as u64;
    }

    Ok(index)
}

/// Decodes one movie fragment: the `moof` sample tables plus the payload
/// bytes of the `mdat` that follows. Sample payload positions are resolved
/// through the track fragment's base data offset (defaulting to the `moof`
/// start) plus each run's data offset.
pub fn parse_fragment(data: &[u8]) -> Result<FragmentData, BoxError> {
    let mut offset = 0usize;
    let mut moof: Option<(MoofBox, usize)> = None;

    while offset + 8 <= data.len() {
        let header = BoxHeader::read(data, offset)?;
        let end = header.end(offset);
        if end > data.len() as u64 {
            return Err(BoxError::BufferTooSmall { needed: end });
        }

        if &header.box_type == b"moof" {
            let (parsed, _) = MoofBox::read_box(&data[offset..end as usize])?;
            moof = Some((parsed, offset));
            // Samples are addressed relative to this moof; the mdat that
            // carries them is reached through those offsets, not scanned.
            break;
        }
        offset = end as usize;
    }

    let (moof, moof_offset) =
        moof.ok_or_else(|| BoxError::Malformed("fragment contains no MOOF box".into()))?;

    let mut fragment = FragmentData {
        track_id: moof.trafs[0].tfhd.track_id,
        ..FragmentData::default()
    };

    for traf in &moof.trafs {
        let base = traf
            .tfhd
            .base_data_offset
            .unwrap_or(moof_offset as u64);
        let base_time = traf.tfdt.as_ref().map(|t| t.base_decode_time).unwrap_or(0);
        if fragment.base_decode_time.is_none() && traf.tfdt.is_some() {
            fragment.base_decode_time = Some(base_time);
        }
        if let Some(subs) = &traf.subs {
            fragment.subs_raw = Some(subs.raw.clone());
        }

        let mut cursor = base;
        let mut time = base_time;
        for trun in &traf.truns {
            if let Some(data_offset) = trun.data_offset {
                cursor = base.wrapping_add_signed(data_offset as i64);
            }
            for (i, entry) in trun.entries.iter().enumerate() {
                let size = entry
                    .sample_size
                    .or(traf.tfhd.default_sample_size)
                    .ok_or_else(|| BoxError::Malformed("sample without size".into()))?;
                let duration = entry
                    .sample_duration
                    .or(traf.tfhd.default_sample_duration)
                    .unwrap_or(0);
                let flags = if i == 0 {
                    entry
                        .sample_flags
                        .or(trun.first_sample_flags)
                        .or(traf.tfhd.default_sample_flags)
                } else {
                    entry.sample_flags.or(traf.tfhd.default_sample_flags)
                }
                .unwrap_or(0);

                let start = cursor as usize;
                let end = start
                    .checked_add(size as usize)
                    .ok_or_else(|| BoxError::Malformed("sample range overflow".into()))?;
                if end > data.len() {
                    return Err(BoxError::Truncated("sample payload outside buffer"));
                }

                fragment.samples.push(Sample {
                    time_ticks: time,
                    duration_ticks: duration,
                    // Bit 16 is sample_is_non_sync_sample.
                    sync: flags & 0x0001_0000 == 0,
                    data: data[start..end].to_vec(),
                });

                cursor += size as u64;
                time += duration as u64;
            }
        }
    }

    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::sidx::build_sidx;

    fn boxed(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut data = vec![];
        data.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        data.extend_from_slice(fourcc);
        data.extend_from_slice(payload);
        data
    }

    fn full_boxed(fourcc: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
        let mut payload = vec![version, 0, 0, 0];
        payload.extend_from_slice(body);
        boxed(fourcc, &payload)
    }

    fn tkhd_v0(track_id: u32) -> Vec<u8> {
        let mut body = vec![];
        body.extend_from_slice(&[0u8; 8]); // creation/modification
        body.extend_from_slice(&track_id.to_be_bytes());
        body.extend_from_slice(&[0u8; 4]); // reserved
        body.extend_from_slice(&[0u8; 4]); // duration
        body.extend_from_slice(&[0u8; 8]); // reserved
        body.extend_from_slice(&[0u8; 8]); // layer/group/volume/reserved
        body.extend_from_slice(&[0u8; 36]); // matrix
        body.extend_from_slice(&(640u32 << 16).to_be_bytes());
        body.extend_from_slice(&(480u32 << 16).to_be_bytes());
        full_boxed(b"tkhd", 0, &body)
    }

    fn minimal_moov(track_id: u32) -> Vec<u8> {
        let avc1 = boxed(b"avc1", &[0xAA; 20]);
        let mut stsd_body = vec![];
        stsd_body.extend_from_slice(&1u32.to_be_bytes());
        stsd_body.extend_from_slice(&avc1);
        let stsd = full_boxed(b"stsd", 0, &stsd_body);
        let stbl = boxed(b"stbl", &stsd);
        let minf = boxed(b"minf", &stbl);
        let mdia = boxed(b"mdia", &minf);

        let mut trak_payload = tkhd_v0(track_id);
        trak_payload.extend_from_slice(&mdia);
        let trak = boxed(b"trak", &trak_payload);
        boxed(b"moov", &trak)
    }

    #[test]
    fn init_scan_finds_moov_and_tracks() {
        let mut file = boxed(b"ftyp", &[0u8; 16]);
        let moov = minimal_moov(3);
        file.extend_from_slice(&moov);

        let info = parse_init(&file).unwrap();
        assert_eq!(info.init_segment_size, file.len() as u64);
        assert_eq!(info.tracks.len(), 1);
        assert_eq!(info.tracks[0].track_id, 3);
        assert!(!info.tracks[0].tkhd_raw.is_empty());
        assert_eq!(info.tracks[0].codec_configs.len(), 1);
        assert_eq!(&info.tracks[0].codec_configs[0][4..8], b"avc1");
    }

    #[test]
    fn init_scan_collects_pssh_under_moov() {
        let system_id: [u8; 16] = [
            0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d,
            0x21, 0xed,
        ];
        let mut pssh_body = system_id.to_vec();
        pssh_body.extend_from_slice(&4u32.to_be_bytes());
        pssh_body.extend_from_slice(&[1, 2, 3, 4]);
        let pssh = full_boxed(b"pssh", 0, &pssh_body);

        let moov = minimal_moov(1);
        let mut moov_payload = moov[8..].to_vec();
        moov_payload.extend_from_slice(&pssh);
        let mut file = boxed(b"ftyp", &[0u8; 16]);
        file.extend_from_slice(&boxed(b"moov", &moov_payload));

        let info = parse_init(&file).unwrap();
        assert_eq!(info.pssh.len(), 1);
        assert_eq!(
            info.pssh[0].system_id_hyphenated(),
            "edef8ba9-79d6-4ace-a3c8-27dcd51d21ed"
        );
        assert_eq!(info.pssh[0].raw, pssh);
    }

    #[test]
    fn init_scan_reports_trailing_sidx() {
        let mut file = boxed(b"ftyp", &[0u8; 16]);
        let moov = minimal_moov(1);
        file.extend_from_slice(&moov);
        let sidx_offset = file.len() as u64;
        let sidx = build_sidx(0, 1000, 0, 0, &[(false, 100, 1000)]);
        file.extend_from_slice(&sidx);

        let info = parse_init(&file).unwrap();
        assert_eq!(info.sidx_range, Some((sidx_offset, sidx.len() as u64)));
    }

    #[test]
    fn init_scan_partial_moov_requests_more() {
        let mut file = boxed(b"ftyp", &[0u8; 16]);
        let moov = minimal_moov(1);
        let full_len = (file.len() + moov.len()) as u64;
        file.extend_from_slice(&moov[..moov.len() / 2]);

        match parse_init(&file) {
            Err(BoxError::BufferTooSmall { needed }) => assert_eq!(needed, full_len),
            other => panic!("expected BufferTooSmall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn nested_sidx_matches_inlined_entries() {
        // Parent references one nested index followed by one media range;
        // flattening must equal the nested entries inlined in order.
        let child = build_sidx(0, 1000, 0, 0, &[(false, 50, 500), (false, 60, 500)]);
        let child_len = child.len() as u32;

        let parent = build_sidx(
            0,
            1000,
            0,
            0,
            &[(true, child_len, 1000), (false, 70, 700)],
        );
        let mut data = parent.clone();
        data.extend_from_slice(&child);

        let index = parse_sidx(&data, 0, 0).unwrap();
        assert_eq!(index.subsegments.len(), 3);

        // The nested entries start right after the child box, mirroring the
        // inlined layout.
        let child_end = (parent.len() + child.len()) as u64;
        assert_eq!(index.subsegments[0].offset, child_end);
        assert_eq!(index.subsegments[0].size, 50);
        assert_eq!(index.subsegments[0].time_ticks, 0);
        assert_eq!(index.subsegments[1].offset, child_end + 50);
        assert_eq!(index.subsegments[1].time_ticks, 500);

        // The trailing media reference continues after the nested index's
        // referenced bytes.
        assert_eq!(index.subsegments[2].size, 70);
        assert_eq!(index.subsegments[2].time_ticks, 1000);

        // Start times non-decreasing, durations positive.
        for pair in index.subsegments.windows(2) {
            assert!(pair[0].time_ticks <= pair[1].time_ticks);
        }
        assert!(index.subsegments.iter().all(|s| s.duration_ticks > 0));
    }

    fn minimal_fragment(samples: &[(u32, u32)], base_decode_time: u64) -> Vec<u8> {
        // tfhd: flags 0 (no optional fields), track 1
        let tfhd = full_boxed(b"tfhd", 0, &1u32.to_be_bytes());
        let tfdt = full_boxed(b"tfdt", 0, &(base_decode_time as u32).to_be_bytes());

        // trun flags 0x000301: data-offset + per-sample duration and size.
        // The moof length is known up front, so the data offset (first mdat
        // payload byte, relative to the moof start) can be computed directly.
        let trun_len = 8 + 4 + 4 + 4 + samples.len() * 8;
        let traf_len = 8 + tfhd.len() + tfdt.len() + trun_len;
        let mfhd = full_boxed(b"mfhd", 0, &1u32.to_be_bytes());
        let moof_len = 8 + mfhd.len() + traf_len;
        let data_offset = (moof_len + 8) as i32;

        let mut trun_body = vec![0u8, 0x00, 0x03, 0x01];
        trun_body.extend_from_slice(&(samples.len() as u32).to_be_bytes());
        trun_body.extend_from_slice(&data_offset.to_be_bytes());
        for &(duration, size) in samples {
            trun_body.extend_from_slice(&duration.to_be_bytes());
            trun_body.extend_from_slice(&size.to_be_bytes());
        }
        let trun = boxed(b"trun", &trun_body);
        assert_eq!(trun.len(), trun_len);

        let mut traf_payload = tfhd;
        traf_payload.extend_from_slice(&tfdt);
        traf_payload.extend_from_slice(&trun);
        let traf = boxed(b"traf", &traf_payload);

        let mut moof_payload = mfhd;
        moof_payload.extend_from_slice(&traf);
        let mut fragment = boxed(b"moof", &moof_payload);
        assert_eq!(fragment.len(), moof_len);

        let total: usize = samples.iter().map(|&(_, s)| s as usize).sum();
        let payload: Vec<u8> = (0..total).map(|i| i as u8).collect();
        fragment.extend_from_slice(&boxed(b"mdat", &payload));
        fragment
    }

    #[test]
    fn fragment_samples_decoded_in_order() {
        let data = minimal_fragment(&[(1000, 4), (1000, 6), (500, 2)], 9000);

        let fragment = parse_fragment(&data).unwrap();
        assert_eq!(fragment.track_id, 1);
        assert_eq!(fragment.base_decode_time, Some(9000));
        assert_eq!(fragment.samples.len(), 3);

        assert_eq!(fragment.samples[0].time_ticks, 9000);
        assert_eq!(fragment.samples[0].data.len(), 4);
        assert_eq!(fragment.samples[1].time_ticks, 10_000);
        assert_eq!(fragment.samples[1].data.len(), 6);
        assert_eq!(fragment.samples[2].time_ticks, 11_000);
        assert_eq!(fragment.samples[2].duration_ticks, 500);

        // Payload bytes are contiguous across samples.
        assert_eq!(fragment.samples[0].data, vec![0, 1, 2, 3]);
        assert_eq!(fragment.samples[1].data, vec![4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn fragment_without_moof_is_malformed() {
        let data = boxed(b"mdat", &[0u8; 16]);
        assert!(matches!(
            parse_fragment(&data),
            Err(BoxError::Malformed(_))
        ));
    }
}
