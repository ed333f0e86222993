// Byte-order aware binary reading for capture container parsers
//
// Classic and next-generation captures declare their byte order in the
// file itself, so every multi-byte read goes through an `Endian`.

use std::io::{self, Read};

use serde::Serialize;

/// Byte order of a capture section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Decode a u16 from two bytes
    #[inline]
    pub fn u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        }
    }

    /// Decode a u32 from four bytes
    #[inline]
    pub fn u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        }
    }

    /// Decode a u32 at `offset` within `buf`; caller guarantees bounds
    #[inline]
    pub fn u32_at(self, buf: &[u8], offset: usize) -> u32 {
        self.u32(array4(&buf[offset..offset + 4]))
    }

    /// Decode a u16 at `offset` within `buf`; caller guarantees bounds
    #[inline]
    pub fn u16_at(self, buf: &[u8], offset: usize) -> u16 {
        self.u16([buf[offset], buf[offset + 1]])
    }

    /// Encode a u32 in this byte order (used by fixture builders)
    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }

    /// Encode a u16 in this byte order
    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }
}

/// Copy the first four bytes of a slice into an array
#[inline]
pub fn array4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Fill `buf` completely, or report how many bytes were available before EOF.
///
/// Returns `Ok(n)` with `n == buf.len()` on success and `n < buf.len()` when
/// the reader ran dry. Truncated trailing records are not an error.
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_endian_decoding() {
        let bytes = [0x78, 0x56, 0x34, 0x12];
        assert_eq!(Endian::Little.u32(bytes), 0x12345678);
        assert_eq!(Endian::Big.u32(bytes), 0x78563412);
        assert_eq!(Endian::Little.u16([0x34, 0x12]), 0x1234);
        assert_eq!(Endian::Big.u16([0x34, 0x12]), 0x3412);
    }

    #[test]
    fn test_u32_at_offset() {
        let buf = [0u8, 0, 0, 0, 0x42, 0, 0, 0];
        assert_eq!(Endian::Little.u32_at(&buf, 4), 0x42);
        assert_eq!(Endian::Big.u32_at(&buf, 4), 0x4200_0000);
    }

    #[test]
    fn test_read_full_reports_short_reads() {
        let mut reader = Cursor::new(vec![1u8, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(read_full(&mut reader, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_encode_roundtrip() {
        for endian in [Endian::Little, Endian::Big] {
            assert_eq!(endian.u32(endian.u32_bytes(0xA1B2C3D4)), 0xA1B2C3D4);
            assert_eq!(endian.u16(endian.u16_bytes(0x0A0B)), 0x0A0B);
        }
    }
}
