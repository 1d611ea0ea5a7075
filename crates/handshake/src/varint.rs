//! Bitcoin-style compact integer codec.
//!
//! A leading byte selects the width: values below `0xfd` are stored inline,
//! `0xfd`/`0xfe`/`0xff` announce a little-endian u16/u32/u64 follow-up.
//! Encoding always picks the shortest form.

use crate::codec::{ByteReader, DecodeError};

pub fn read_varint(reader: &mut ByteReader) -> Result<u64, DecodeError> {
    if reader.is_empty() {
        return Err(DecodeError::EmptyInput);
    }

    let prefix = reader.read_u8()?;

    match prefix {
        0xfd => Ok(reader.read_u16_le()? as u64),
        0xfe => Ok(reader.read_u32_le()? as u64),
        0xff => reader.read_u64_le(),
        value => Ok(value as u64),
    }
}

pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Number of bytes `write_varint` emits for the given value.
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u64) -> Vec<u8> {
        let mut encoded = Vec::new();
        write_varint(&mut encoded, value);

        let mut reader = ByteReader::new(&encoded);
        assert_eq!(read_varint(&mut reader).unwrap(), value);
        assert!(reader.is_empty());

        encoded
    }

    #[test]
    fn round_trips_boundaries() {
        assert_eq!(round_trip(0).len(), 1);
        assert_eq!(round_trip(0xfc).len(), 1);
        assert_eq!(round_trip(0xfd).len(), 3);
        assert_eq!(round_trip(0xffff).len(), 3);
        assert_eq!(round_trip(0x10000).len(), 5);
        assert_eq!(round_trip(0xffff_ffff).len(), 5);
        assert_eq!(round_trip(0x1_0000_0000).len(), 9);
        assert_eq!(round_trip(u64::MAX).len(), 9);
    }

    #[test]
    fn shortest_form_matches_size_hint() {
        for value in [0u64, 1, 0xfc, 0xfd, 0x1234, 0xffff, 0x10000, u64::MAX] {
            let mut encoded = Vec::new();
            write_varint(&mut encoded, value);
            assert_eq!(encoded.len(), varint_size(value));
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        let mut reader = ByteReader::new(&[]);
        assert_eq!(read_varint(&mut reader), Err(DecodeError::EmptyInput));
    }

    #[test]
    fn truncated_follow_up_is_an_error() {
        let mut reader = ByteReader::new(&[0xfd, 0x01]);
        assert!(matches!(
            read_varint(&mut reader),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }
}
