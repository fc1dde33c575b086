use crate::{read_u32_be, read_u64_be, BoxError};

// The `Mp4Box` trait defines a generic interface for parsed MP4 boxes.
// Each box has a specific type, size, and content; implementing this trait
// allows a struct to represent one box type and be identified correctly.
pub trait Mp4Box {
    // Returns the 4-byte type identifier of the box.
    fn box_type(&self) -> [u8; 4];

    /// Reads a box from the given byte slice, which must start at the box
    /// header. Returns a tuple of (BoxInstance, bytes_consumed).
    fn read_box(data: &[u8]) -> Result<(Self, usize), BoxError>
    where
        Self: Sized;
}

/// A box header as it appears on the wire: 4-byte big-endian size followed by
/// a 4-byte ASCII type. A size of 1 switches to a 64-bit "largesize" field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    /// Total box size including the header itself.
    pub size: u64,
    /// Number of header bytes (8, or 16 for largesize boxes).
    pub header_len: usize,
}

impl BoxHeader {
    /// Reads a box header at `offset`. Fails with `BufferTooSmall` when fewer
    /// than the header bytes are buffered, so callers scanning a partial
    /// download can widen their byte range.
    pub fn read(data: &[u8], offset: usize) -> Result<BoxHeader, BoxError> {
        if data.len() < offset + 8 {
            return Err(BoxError::BufferTooSmall {
                needed: (offset + 8) as u64,
            });
        }
        let size32 = read_u32_be(data, offset)?;
        let box_type: [u8; 4] = data[offset + 4..offset + 8].try_into().unwrap();

        if size32 == 1 {
            if data.len() < offset + 16 {
                return Err(BoxError::BufferTooSmall {
                    needed: (offset + 16) as u64,
                });
            }
            let size = read_u64_be(data, offset + 8)?;
            if size < 16 {
                return Err(BoxError::Malformed(format!(
                    "largesize box {} reports size {}",
                    crate::format_fourcc(&box_type),
                    size
                )));
            }
            Ok(BoxHeader {
                box_type,
                size,
                header_len: 16,
            })
        } else {
            // size 0 ("extends to end of file") is not usable when scanning
            // partial byte ranges
            if size32 < 8 {
                return Err(BoxError::Malformed(format!(
                    "box {} reports size {}",
                    crate::format_fourcc(&box_type),
                    size32
                )));
            }
            Ok(BoxHeader {
                box_type,
                size: size32 as u64,
                header_len: 8,
            })
        }
    }

    /// Offset of the first payload byte relative to the box start.
    pub fn payload_offset(&self) -> usize {
        self.header_len
    }

    pub fn end(&self, box_offset: usize) -> u64 {
        box_offset as u64 + self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_sizes() {
        let mut data = vec![];
        data.extend_from_slice(&24u32.to_be_bytes());
        data.extend_from_slice(b"moov");
        data.extend_from_slice(&[0u8; 16]);

        let header = BoxHeader::read(&data, 0).unwrap();
        assert_eq!(&header.box_type, b"moov");
        assert_eq!(header.size, 24);
        assert_eq!(header.header_len, 8);
    }

    #[test]
    fn header_largesize() {
        let mut data = vec![];
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&32u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 16]);

        let header = BoxHeader::read(&data, 0).unwrap();
        assert_eq!(header.size, 32);
        assert_eq!(header.header_len, 16);
    }

    #[test]
    fn header_incomplete_reports_needed_bytes() {
        let data = [0u8; 4];
        match BoxHeader::read(&data, 0) {
            Err(BoxError::BufferTooSmall { needed }) => assert_eq!(needed, 8),
            other => panic!("expected BufferTooSmall, got {:?}", other.map(|_| ())),
        }
    }
}
