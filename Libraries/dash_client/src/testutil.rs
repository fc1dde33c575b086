//! Shared ISO-BMFF fixture builders for unit tests.

use std::sync::Once;

/// Routes tracing output through the test harness.
pub(crate) fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub(crate) fn boxed(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut data = vec![];
    data.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
    data.extend_from_slice(fourcc);
    data.extend_from_slice(payload);
    data
}

pub(crate) fn full_boxed(fourcc: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = vec![version, 0, 0, 0];
    payload.extend_from_slice(body);
    boxed(fourcc, &payload)
}

pub(crate) fn tkhd_v0(track_id: u32) -> Vec<u8> {
    let mut body = vec![];
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&track_id.to_be_bytes());
    body.extend_from_slice(&[0u8; 60]);
    body.extend_from_slice(&(640u32 << 16).to_be_bytes());
    body.extend_from_slice(&(480u32 << 16).to_be_bytes());
    full_boxed(b"tkhd", 0, &body)
}

pub(crate) fn minimal_moov(track_id: u32) -> Vec<u8> {
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

/// `ftyp` + single-track `moov`, the shape of a template-addressed
/// initialization segment.
pub(crate) fn init_segment() -> Vec<u8> {
    let mut file = boxed(b"ftyp", &[0u8; 16]);
    file.extend_from_slice(&minimal_moov(1));
    file
}

pub(crate) fn pssh_v0(system_id: &[u8; 16]) -> Vec<u8> {
    let mut body = system_id.to_vec();
    body.extend_from_slice(&0u32.to_be_bytes());
    full_boxed(b"pssh", 0, &body)
}

/// Like [`init_segment`], with a DRM `pssh` box inside the `moov`.
pub(crate) fn init_segment_with_pssh(system_id: &[u8; 16]) -> Vec<u8> {
    let moov = minimal_moov(1);
    let mut payload = moov[8..].to_vec();
    payload.extend_from_slice(&pssh_v0(system_id));
    let mut file = boxed(b"ftyp", &[0u8; 16]);
    file.extend_from_slice(&boxed(b"moov", &payload));
    file
}

/// One `moof`+`mdat` fragment for track 1 with the given
/// (duration, size) sample table and decode start time.
pub(crate) fn minimal_fragment(samples: &[(u32, u32)], base_decode_time: u32) -> Vec<u8> {
    let tfhd = full_boxed(b"tfhd", 0, &1u32.to_be_bytes());
    let tfdt = full_boxed(b"tfdt", 0, &base_decode_time.to_be_bytes());

    let trun_len = 8 + 4 + 4 + 4 + samples.len() * 8;
    let traf_len = 8 + tfhd.len() + tfdt.len() + trun_len;
    let mfhd = full_boxed(b"mfhd", 0, &1u32.to_be_bytes());
    let moof_len = 8 + mfhd.len() + traf_len;
    let data_offset = (moof_len + 8) as i32;

    // trun flags 0x000301: data-offset plus per-sample duration and size.
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
    fragment.extend_from_slice(&boxed(b"mdat", &vec![0x42u8; total]));
    fragment
}
