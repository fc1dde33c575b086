// This module contains definitions for the MP4 box types consumed by the DASH
// streaming client. Each box serves a specific purpose:
//
// - `generic`: the `Mp4Box` trait shared by all parsed boxes, plus the box
//   header reader used for scanning and skipping.
// - `mfhd`: Movie Fragment Header Box, carries the fragment sequence number.
// - `moof`: Movie Fragment Box, groups the fragment header and track fragments.
// - `pssh`: Protection System Specific Header Box, DRM system ID plus
//   opaque initialization data, preserved raw.
// - `sidx`: Segment Index Box, maps byte ranges to time ranges; entries may
//   reference nested segment indexes.
// - `subs`: Sub-Sample Information Box, preserved raw for subtitle tracks.
// - `tfdt`: Track Fragment Decode Time Box, decode time of the first sample.
// - `tfhd`: Track Fragment Header Box, per-fragment sample defaults.
// - `tkhd`: Track Header Box, parsed and preserved raw for subtitle tracks.
// - `traf`: Track Fragment Box, groups tfhd/tfdt/trun for one track.
// - `trun`: Track Run Box, the per-sample size/duration/flags table.

pub mod generic;
pub mod mfhd;
pub mod moof;
pub mod pssh;
pub mod sidx;
pub mod subs;
pub mod tfdt;
pub mod tfhd;
pub mod tkhd;
pub mod traf;
pub mod trun;
