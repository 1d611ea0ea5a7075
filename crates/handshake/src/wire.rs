//! P2P framing and the message registry.
//!
//! Every frame on the wire is a 9-byte header (`magic u32 LE ‖ type u8 ‖
//! payload_len u32 LE`) followed by the payload. The magic must match the
//! configured network and payloads are capped at 8 MB. Unknown message
//! types are not an error: the frame is consumed and discarded so higher
//! layers simply never observe them.

use std::net::{IpAddr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::block::{Block, Header, HEADER_SIZE};
use crate::codec::{ByteReader, DecodeError};
use crate::hash::Hash;
use crate::proof::{Proof, ProofError};
use crate::varint::{read_varint, write_varint};

pub const FRAME_HEADER_LEN: usize = 9;
pub const MAX_PAYLOAD: usize = 8_000_000;
pub const MAX_HEADERS_PER_BATCH: usize = 2000;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad network magic: got {got:#010x}, want {want:#010x}")]
    BadMagic { got: u32, want: u32 },

    #[error("oversized payload: {0} bytes")]
    OversizedPayload(u32),

    #[error("message decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("proof decode error: {0}")]
    Proof(#[from] ProofError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Version = 0,
    Verack = 1,
    Ping = 2,
    Pong = 3,
    GetAddr = 4,
    Addr = 5,
    GetData = 7,
    GetHeaders = 10,
    Headers = 11,
    SendHeaders = 12,
    Block = 13,
    GetProof = 26,
    Proof = 27,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Version),
            1 => Some(Self::Verack),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::GetAddr),
            5 => Some(Self::Addr),
            7 => Some(Self::GetData),
            10 => Some(Self::GetHeaders),
            11 => Some(Self::Headers),
            12 => Some(Self::SendHeaders),
            13 => Some(Self::Block),
            26 => Some(Self::GetProof),
            27 => Some(Self::Proof),
            _ => None,
        }
    }
}

/// Inventory item types used by `GetData`.
pub const INV_BLOCK: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvItem {
    pub inv_type: u32,
    pub hash: Hash<32>,
}

/// An 88-byte network address record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    pub time: u64,
    pub services: u64,
    pub host: IpAddr,
    pub port: u16,
    pub key: [u8; 33],
}

impl NetAddr {
    fn decode(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        let time = reader.read_u64_le()?;
        let services = reader.read_u64_le()?;
        let _addr_type = reader.read_u8()?;

        let raw: [u8; 16] = reader.read_array()?;
        let host = decode_host(&raw);

        let _reserved = reader.read_bytes(20)?;
        let port = reader.read_u16_be()?;
        let key = reader.read_array()?;

        Ok(Self {
            time,
            services,
            host,
            port,
            key,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.services.to_le_bytes());
        out.push(0);
        out.extend_from_slice(&encode_host(&self.host));
        out.extend_from_slice(&[0u8; 20]);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.key);
    }
}

fn encode_host(host: &IpAddr) -> [u8; 16] {
    match host {
        IpAddr::V4(v4) => {
            let mut out = [0u8; 16];
            out[10] = 0xff;
            out[11] = 0xff;
            out[12..16].copy_from_slice(&v4.octets());
            out
        }
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn decode_host(raw: &[u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(*raw);

    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub time: u64,
    pub remote: NetAddr,
    pub nonce: [u8; 8],
    pub agent: String,
    pub height: u32,
    pub no_relay: bool,
}

impl VersionMessage {
    fn decode(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        let version = reader.read_u32_le()?;
        let services = reader.read_u64_le()?;
        let time = reader.read_u64_le()?;
        let remote = NetAddr::decode(reader)?;
        let nonce = reader.read_array()?;

        let agent_len = reader.read_u8()? as usize;
        let agent = String::from_utf8_lossy(reader.read_bytes(agent_len)?).into_owned();

        let height = reader.read_u32_le()?;
        let no_relay = reader.read_u8()? != 0;

        Ok(Self {
            version,
            services,
            time,
            remote,
            nonce,
            agent,
            height,
            no_relay,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        self.remote.encode(out);
        out.extend_from_slice(&self.nonce);
        out.push(self.agent.len() as u8);
        out.extend_from_slice(self.agent.as_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.push(self.no_relay as u8);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddr>),
    GetData(Vec<InvItem>),
    GetHeaders {
        locator: Vec<Hash<32>>,
        stop: Hash<32>,
    },
    Headers(Vec<Header>),
    SendHeaders,
    Block(Box<Block>),
    GetProof {
        root: Hash<32>,
        key: Hash<32>,
    },
    Proof {
        root: Hash<32>,
        key: Hash<32>,
        proof: Box<Proof>,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Version(_) => MessageType::Version,
            Self::Verack => MessageType::Verack,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::GetAddr => MessageType::GetAddr,
            Self::Addr(_) => MessageType::Addr,
            Self::GetData(_) => MessageType::GetData,
            Self::GetHeaders { .. } => MessageType::GetHeaders,
            Self::Headers(_) => MessageType::Headers,
            Self::SendHeaders => MessageType::SendHeaders,
            Self::Block(_) => MessageType::Block,
            Self::GetProof { .. } => MessageType::GetProof,
            Self::Proof { .. } => MessageType::Proof,
        }
    }

    /// Decode a frame payload. Returns `None` for message types this client
    /// does not know about.
    pub fn decode(type_byte: u8, payload: &[u8]) -> Result<Option<Self>, WireError> {
        let Some(message_type) = MessageType::from_byte(type_byte) else {
            return Ok(None);
        };

        let mut reader = ByteReader::new(payload);

        let message = match message_type {
            MessageType::Version => Self::Version(VersionMessage::decode(&mut reader)?),
            MessageType::Verack => Self::Verack,
            MessageType::Ping => Self::Ping(reader.read_u64_le()?),
            MessageType::Pong => Self::Pong(reader.read_u64_le()?),
            MessageType::GetAddr => Self::GetAddr,
            MessageType::Addr => {
                let count = read_varint(&mut reader)? as usize;
                let mut addrs = Vec::with_capacity(count.min(1000));
                for _ in 0..count {
                    addrs.push(NetAddr::decode(&mut reader)?);
                }
                Self::Addr(addrs)
            }
            MessageType::GetData => {
                let count = read_varint(&mut reader)? as usize;
                let mut items = Vec::with_capacity(count.min(1000));
                for _ in 0..count {
                    items.push(InvItem {
                        inv_type: reader.read_u32_le()?,
                        hash: Hash::new(reader.read_array()?),
                    });
                }
                Self::GetData(items)
            }
            MessageType::GetHeaders => {
                let count = read_varint(&mut reader)? as usize;
                let mut locator = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    locator.push(Hash::new(reader.read_array()?));
                }
                Self::GetHeaders {
                    locator,
                    stop: Hash::new(reader.read_array()?),
                }
            }
            MessageType::Headers => {
                let count = read_varint(&mut reader)? as usize;
                if count > MAX_HEADERS_PER_BATCH {
                    return Err(DecodeError::OutOfRange("headers batch too large").into());
                }
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(Header::decode(&mut reader)?);
                }
                Self::Headers(headers)
            }
            MessageType::SendHeaders => Self::SendHeaders,
            MessageType::Block => Self::Block(Box::new(Block::decode(payload)?)),
            MessageType::GetProof => Self::GetProof {
                root: Hash::new(reader.read_array()?),
                key: Hash::new(reader.read_array()?),
            },
            MessageType::Proof => Self::Proof {
                root: Hash::new(reader.read_array()?),
                key: Hash::new(reader.read_array()?),
                proof: Box::new(Proof::decode(&mut reader)?),
            },
        };

        Ok(Some(message))
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();

        match self {
            Self::Version(version) => version.encode(&mut out),
            Self::Verack | Self::GetAddr | Self::SendHeaders => {}
            Self::Ping(nonce) | Self::Pong(nonce) => {
                out.extend_from_slice(&nonce.to_le_bytes());
            }
            Self::Addr(addrs) => {
                write_varint(&mut out, addrs.len() as u64);
                for addr in addrs {
                    addr.encode(&mut out);
                }
            }
            Self::GetData(items) => {
                write_varint(&mut out, items.len() as u64);
                for item in items {
                    out.extend_from_slice(&item.inv_type.to_le_bytes());
                    out.extend_from_slice(item.hash.as_slice());
                }
            }
            Self::GetHeaders { locator, stop } => {
                write_varint(&mut out, locator.len() as u64);
                for hash in locator {
                    out.extend_from_slice(hash.as_slice());
                }
                out.extend_from_slice(stop.as_slice());
            }
            Self::Headers(headers) => {
                write_varint(&mut out, headers.len() as u64);
                for header in headers {
                    out.extend_from_slice(&header.encode());
                }
            }
            Self::Block(_) => {
                // this client never relays blocks
                unreachable!("block encoding is not supported")
            }
            Self::GetProof { root, key } => {
                out.extend_from_slice(root.as_slice());
                out.extend_from_slice(key.as_slice());
            }
            Self::Proof { .. } => {
                unreachable!("proof encoding is not supported")
            }
        }

        out
    }
}

/// Read one frame. Returns the raw type byte and payload; unknown types are
/// the caller's concern.
pub async fn read_frame<R>(io: &mut R, magic: u32) -> Result<(u8, Vec<u8>), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    io.read_exact(&mut header).await?;

    let got_magic = u32::from_le_bytes(header[0..4].try_into().expect("fixed slice"));
    if got_magic != magic {
        return Err(WireError::BadMagic {
            got: got_magic,
            want: magic,
        });
    }

    let type_byte = header[4];
    let payload_len = u32::from_le_bytes(header[5..9].try_into().expect("fixed slice"));

    if payload_len as usize > MAX_PAYLOAD {
        return Err(WireError::OversizedPayload(payload_len));
    }

    let mut payload = vec![0u8; payload_len as usize];
    io.read_exact(&mut payload).await?;

    Ok((type_byte, payload))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(
    io: &mut W,
    magic: u32,
    message_type: MessageType,
    payload: &[u8],
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0..4].copy_from_slice(&magic.to_le_bytes());
    header[4] = message_type as u8;
    header[5..9].copy_from_slice(&(payload.len() as u32).to_le_bytes());

    io.write_all(&header).await?;
    io.write_all(payload).await?;
    io.flush().await?;

    Ok(())
}

/// Write a full message in one call.
pub async fn write_message<W>(io: &mut W, magic: u32, message: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(io, magic, message.message_type(), &message.encode_payload()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const MAGIC: u32 = 0x5b6e_f2d3;

    fn sample_addr() -> NetAddr {
        NetAddr {
            time: 1_700_000_000,
            services: 0,
            host: IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)),
            port: 12_038,
            key: [0x42; 33],
        }
    }

    #[test]
    fn netaddr_is_88_bytes_and_round_trips() {
        let addr = sample_addr();
        let mut raw = Vec::new();
        addr.encode(&mut raw);

        assert_eq!(raw.len(), 88);

        let decoded = NetAddr::decode(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn ipv6_hosts_survive() {
        let mut addr = sample_addr();
        addr.host = IpAddr::V6("2001:db8::1".parse().unwrap());

        let mut raw = Vec::new();
        addr.encode(&mut raw);

        let decoded = NetAddr::decode(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(decoded.host, addr.host);
    }

    #[test]
    fn version_round_trips() {
        let version = VersionMessage {
            version: 1,
            services: 0,
            time: 1_700_000_000,
            remote: sample_addr(),
            nonce: [7u8; 8],
            agent: "/cdnsd/".into(),
            height: 0,
            no_relay: true,
        };

        let encoded = Message::Version(version.clone()).encode_payload();
        let decoded = Message::decode(MessageType::Version as u8, &encoded)
            .unwrap()
            .unwrap();

        assert_eq!(decoded, Message::Version(version));
    }

    #[test]
    fn get_headers_layout() {
        let locator = vec![Hash::new([0xaa; 32]), Hash::new([0xbb; 32])];
        let stop = Hash::new([0u8; 32]);

        let encoded = Message::GetHeaders {
            locator: locator.clone(),
            stop,
        }
        .encode_payload();

        assert_eq!(encoded.len(), 1 + 2 * 32 + 32);
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[1..33], &[0xaa; 32]);

        let decoded = Message::decode(MessageType::GetHeaders as u8, &encoded)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, Message::GetHeaders { locator, stop });
    }

    #[test]
    fn unknown_types_decode_to_none() {
        assert!(Message::decode(99, &[1, 2, 3]).unwrap().is_none());
    }

    #[test]
    fn oversized_headers_batch_is_rejected() {
        let mut raw = Vec::new();
        write_varint(&mut raw, (MAX_HEADERS_PER_BATCH + 1) as u64);

        assert!(Message::decode(MessageType::Headers as u8, &raw).is_err());
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let mut wire = Vec::new();
        write_message(&mut wire, MAGIC, &Message::Ping(77)).await.unwrap();

        assert_eq!(wire.len(), FRAME_HEADER_LEN + 8);

        let mut reader = &wire[..];
        let (type_byte, payload) = read_frame(&mut reader, MAGIC).await.unwrap();

        assert_eq!(type_byte, MessageType::Ping as u8);
        assert_eq!(
            Message::decode(type_byte, &payload).unwrap().unwrap(),
            Message::Ping(77)
        );
    }

    #[tokio::test]
    async fn wrong_magic_is_fatal() {
        let mut wire = Vec::new();
        write_message(&mut wire, MAGIC, &Message::Verack).await.unwrap();

        let mut reader = &wire[..];
        let result = read_frame(&mut reader, MAGIC + 1).await;

        assert!(matches!(result, Err(WireError::BadMagic { .. })));
    }

    #[tokio::test]
    async fn oversized_payload_is_fatal() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&MAGIC.to_le_bytes());
        wire.push(MessageType::Block as u8);
        wire.extend_from_slice(&(MAX_PAYLOAD as u32 + 1).to_le_bytes());

        let mut reader = &wire[..];
        let result = read_frame(&mut reader, MAGIC).await;

        assert!(matches!(result, Err(WireError::OversizedPayload(_))));
    }
}
