//! # Fragmented MP4 Box Parsing
//!
//! The MP4 (ISO-BMFF) container is a hierarchical structure of **boxes**. Each
//! box begins with a header specifying its size and a 4-character type code
//! (e.g. `moov`, `sidx`, `moof`), followed by a payload which can include
//! nested boxes or raw data.
//!
//! This library parses the subset of boxes needed by a DASH streaming client:
//!
//! 1. **Movie Box (`moov`)**: metadata for the whole presentation; its end
//!    offset marks the size of an initialization segment. Track headers
//!    (`tkhd`) and sample descriptions (`stsd`) found inside are preserved.
//!
//! 2. **Segment Index Box (`sidx`)**: maps byte ranges to time ranges within a
//!    representation. A segment index entry may point at media or at a nested
//!    segment index, which is resolved transparently.
//!
//! 3. **Movie Fragment Box (`moof`)**: per-fragment sample table
//!    (`traf`/`tfhd`/`tfdt`/`trun`) referencing payload bytes inside the
//!    following `mdat` box.
//!
//! The `boxes` module defines the individual box structures, each with a
//! bounds-checked `read_box` constructor; the `reader` module provides the
//! three segment-level entry points (`parse_init`, `parse_sidx`,
//! `parse_fragment`) used by the segment fetcher.

pub mod boxes;
pub mod error;
pub mod reader;

pub use error::BoxError;

pub fn format_fourcc(fourcc: &[u8; 4]) -> String {
    std::str::from_utf8(fourcc).unwrap_or("????").to_string()
}

pub fn format_capped_bytes(data: &[u8]) -> String {
    let capped = &data[..data.len().min(8)];
    if data.len() > 8 {
        format!("{:?} ...", capped)
    } else {
        format!("{:?}", capped)
    }
}

pub fn read_u16_be(data: &[u8], offset: usize) -> Result<u16, BoxError> {
    data.get(offset..offset + 2)
        .ok_or(BoxError::Truncated("u16 read out of bounds"))
        .map(|bytes| u16::from_be_bytes(bytes.try_into().unwrap()))
}

pub fn read_u32_be(data: &[u8], offset: usize) -> Result<u32, BoxError> {
    data.get(offset..offset + 4)
        .ok_or(BoxError::Truncated("u32 read out of bounds"))
        .map(|bytes| u32::from_be_bytes(bytes.try_into().unwrap()))
}

pub fn read_u64_be(data: &[u8], offset: usize) -> Result<u64, BoxError> {
    data.get(offset..offset + 8)
        .ok_or(BoxError::Truncated("u64 read out of bounds"))
        .map(|bytes| u64::from_be_bytes(bytes.try_into().unwrap()))
}

pub fn read_i32_be(data: &[u8], offset: usize) -> Result<i32, BoxError> {
    read_u32_be(data, offset).map(|v| v as i32)
}

/// Reads the version byte and 24-bit flags of a full box payload.
pub fn read_version_and_flags(data: &[u8]) -> Result<(u8, u32), BoxError> {
    if data.len() < 4 {
        return Err(BoxError::Truncated("full box version/flags"));
    }
    let version = data[0];
    let flags = ((data[1] as u32) << 16) | ((data[2] as u32) << 8) | data[3] as u32;
    Ok((version, flags))
}
