//! Domain resource data carried by Register/Update covenants.
//!
//! A resource is a version byte followed by records until end of input.
//! Names use a DNS-wire-style label encoding with 14-bit back-pointers into
//! the containing buffer (label compression). Pointer resolution seeks in
//! the saved buffer instead of recursing, so chained pointers cannot loop.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::codec::{ByteReader, DecodeError};

const MAX_LABEL: usize = 63;
const MAX_NAME: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRecord {
    Ds {
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: Vec<u8>,
    },
    Ns {
        name: String,
    },
    Glue4 {
        name: String,
        address: Ipv4Addr,
    },
    Glue6 {
        name: String,
        address: Ipv6Addr,
    },
    Synth4 {
        address: Ipv4Addr,
    },
    Synth6 {
        address: Ipv6Addr,
    },
    Text {
        items: Vec<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub records: Vec<ResourceRecord>,
}

impl Resource {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);

        let version = reader.read_u8()?;
        if version != 0 {
            return Err(DecodeError::UnsupportedResourceVersion(version));
        }

        let mut records = Vec::new();
        while !reader.is_empty() {
            records.push(read_record(&mut reader)?);
        }

        Ok(Self { records })
    }
}

fn read_record(reader: &mut ByteReader) -> Result<ResourceRecord, DecodeError> {
    let tag = reader.read_u8()?;

    match tag {
        0 => {
            let key_tag = reader.read_u16_be()?;
            let algorithm = reader.read_u8()?;
            let digest_type = reader.read_u8()?;
            let size = reader.read_u8()? as usize;
            let digest = reader.read_bytes(size)?.to_vec();

            Ok(ResourceRecord::Ds {
                key_tag,
                algorithm,
                digest_type,
                digest,
            })
        }
        1 => Ok(ResourceRecord::Ns {
            name: read_name(reader)?,
        }),
        2 => Ok(ResourceRecord::Glue4 {
            name: read_name(reader)?,
            address: Ipv4Addr::from(reader.read_array::<4>()?),
        }),
        3 => Ok(ResourceRecord::Glue6 {
            name: read_name(reader)?,
            address: Ipv6Addr::from(reader.read_array::<16>()?),
        }),
        4 => Ok(ResourceRecord::Synth4 {
            address: Ipv4Addr::from(reader.read_array::<4>()?),
        }),
        5 => Ok(ResourceRecord::Synth6 {
            address: Ipv6Addr::from(reader.read_array::<16>()?),
        }),
        6 => {
            let count = reader.read_u8()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                let len = reader.read_u8()? as usize;
                items.push(reader.read_bytes(len)?.to_vec());
            }

            Ok(ResourceRecord::Text { items })
        }
        other => Err(DecodeError::UnknownRecordType(other)),
    }
}

/// Read a (possibly compressed) domain name, leaving the reader positioned
/// after the name's in-place bytes.
///
/// Label bytes are copied with NUL mapped to `ÿ` (0xff) and `.` mapped to
/// `þ` (0xfe), so the dots emitted here are unambiguous separators.
fn read_name(reader: &mut ByteReader) -> Result<String, DecodeError> {
    let buf = reader.buffer();
    let mut pos = reader.position();

    let mut name = String::new();
    // wire length of the decoded name, counted like an uncompressed encoding
    let mut decoded_len = 0usize;
    // where the cursor resumes once the first pointer has been followed
    let mut resume: Option<usize> = None;

    loop {
        if pos >= buf.len() {
            return Err(DecodeError::InvalidName("truncated label"));
        }

        let len = buf[pos] as usize;

        match len & 0xc0 {
            0x00 => {
                pos += 1;

                if len == 0 {
                    break;
                }

                if len > MAX_LABEL {
                    return Err(DecodeError::InvalidName("label too long"));
                }

                if pos + len > buf.len() {
                    return Err(DecodeError::InvalidName("truncated label"));
                }

                decoded_len += len + 1;
                if decoded_len > MAX_NAME {
                    return Err(DecodeError::InvalidName("name too long"));
                }

                for &byte in &buf[pos..pos + len] {
                    match byte {
                        0x00 => name.push('\u{ff}'),
                        b'.' => name.push('\u{fe}'),
                        other => name.push(other as char),
                    }
                }
                name.push('.');

                pos += len;
            }
            0xc0 => {
                if pos + 1 >= buf.len() {
                    return Err(DecodeError::InvalidName("truncated pointer"));
                }

                let offset = ((len & 0x3f) << 8) | buf[pos + 1] as usize;

                if offset >= buf.len() {
                    return Err(DecodeError::InvalidName("pointer out of bounds"));
                }

                // pointers must reference earlier data; this also rules out
                // pointer chains that never terminate
                if offset >= pos {
                    return Err(DecodeError::InvalidName("forward pointer"));
                }

                if resume.is_none() {
                    resume = Some(pos + 2);
                }

                pos = offset;
            }
            _ => return Err(DecodeError::InvalidName("reserved label type")),
        }
    }

    reader.seek(resume.unwrap_or(pos))?;

    if name.is_empty() {
        name.push('.');
    }

    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> ResourceRecord {
        let resource = Resource::decode(bytes).unwrap();
        assert_eq!(resource.records.len(), 1);
        resource.records.into_iter().next().unwrap()
    }

    #[test]
    fn version_gate() {
        assert_eq!(
            Resource::decode(&[1]),
            Err(DecodeError::UnsupportedResourceVersion(1))
        );
        assert!(Resource::decode(&[0]).unwrap().records.is_empty());
    }

    #[test]
    fn ns_record_with_literal_labels() {
        let mut raw = vec![0u8, 1];
        raw.push(3);
        raw.extend_from_slice(b"ns1");
        raw.push(10);
        raw.extend_from_slice(b"irvwilliam");
        raw.push(0);

        match decode_one(&raw) {
            ResourceRecord::Ns { name } => assert_eq!(name, "ns1.irvwilliam."),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn glue4_with_back_pointer() {
        // GLUE4 ns1.example. 10.0.0.1 followed by GLUE4 ns2.<ptr> 10.0.0.2
        let mut raw = vec![0u8];

        raw.push(2);
        raw.push(3);
        raw.extend_from_slice(b"ns1");
        let suffix = raw.len();
        raw.push(7);
        raw.extend_from_slice(b"example");
        raw.push(0);
        raw.extend_from_slice(&[10, 0, 0, 1]);

        raw.push(2);
        raw.push(3);
        raw.extend_from_slice(b"ns2");
        raw.push(0xc0 | ((suffix >> 8) as u8));
        raw.push(suffix as u8);
        raw.extend_from_slice(&[10, 0, 0, 2]);

        let resource = Resource::decode(&raw).unwrap();
        assert_eq!(resource.records.len(), 2);

        match &resource.records[0] {
            ResourceRecord::Glue4 { name, address } => {
                assert_eq!(name, "ns1.example.");
                assert_eq!(*address, Ipv4Addr::new(10, 0, 0, 1));
            }
            other => panic!("unexpected record: {other:?}"),
        }

        match &resource.records[1] {
            ResourceRecord::Glue4 { name, address } => {
                assert_eq!(name, "ns2.example.");
                assert_eq!(*address, Ipv4Addr::new(10, 0, 0, 2));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn forward_pointer_is_rejected() {
        let raw = vec![0u8, 1, 0xc0, 0x10];
        assert_eq!(
            Resource::decode(&raw),
            Err(DecodeError::InvalidName("pointer out of bounds"))
        );
    }

    #[test]
    fn ds_record_fields() {
        let mut raw = vec![0u8, 0];
        raw.extend_from_slice(&54_616u16.to_be_bytes());
        raw.push(13);
        raw.push(2);
        raw.push(4);
        raw.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        match decode_one(&raw) {
            ResourceRecord::Ds {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => {
                assert_eq!(key_tag, 54_616);
                assert_eq!(algorithm, 13);
                assert_eq!(digest_type, 2);
                assert_eq!(digest, vec![0xde, 0xad, 0xbe, 0xef]);
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn text_record_items() {
        let raw = vec![0u8, 6, 2, 2, b'h', b'i', 3, b'y', b'o', b'u'];

        match decode_one(&raw) {
            ResourceRecord::Text { items } => {
                assert_eq!(items, vec![b"hi".to_vec(), b"you".to_vec()]);
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn label_bytes_are_sanitized() {
        let mut raw = vec![0u8, 1];
        raw.push(3);
        raw.extend_from_slice(&[b'a', 0x00, b'.']);
        raw.push(0);

        match decode_one(&raw) {
            ResourceRecord::Ns { name } => assert_eq!(name, "a\u{ff}\u{fe}."),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn synth_records_carry_bare_addresses() {
        let raw = vec![0u8, 4, 127, 0, 0, 1];
        match decode_one(&raw) {
            ResourceRecord::Synth4 { address } => {
                assert_eq!(address, Ipv4Addr::new(127, 0, 0, 1));
            }
            other => panic!("unexpected record: {other:?}"),
        }

        let mut raw = vec![0u8, 5];
        raw.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        match decode_one(&raw) {
            ResourceRecord::Synth6 { address } => assert_eq!(address, Ipv6Addr::LOCALHOST),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn unknown_record_type_is_an_error() {
        assert_eq!(
            Resource::decode(&[0, 9]),
            Err(DecodeError::UnknownRecordType(9))
        );
    }
}
