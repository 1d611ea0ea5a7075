//! Urkel SPV proof decoding and verification.
//!
//! Peers answer `GetProof` with a compressed Merkle proof for a key in the
//! name tree. Four proof shapes exist: `exists` (the key is present and the
//! proof carries its value), `collision` (a different key occupies the
//! path), `short` (the path stops early at a skip node), and `deadend` (the
//! path leads to a null leaf). Verification recomputes the root from the
//! leaf upward and compares it against a trusted tree root.

use thiserror::Error;

use crate::codec::{ByteReader, DecodeError};
use crate::hash::{Hash, Hasher};

const MAX_DEPTH: usize = 256;

const PREFIX_LEAF: u8 = 0x00;
const PREFIX_INTERNAL: u8 = 0x01;
const PREFIX_SKIP: u8 = 0x02;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("same path")]
    SamePath,

    #[error("same key")]
    SameKey,

    #[error("path mismatch")]
    PathMismatch,

    #[error("too deep")]
    TooDeep,

    #[error("hash mismatch")]
    HashMismatch,

    #[error("negative depth")]
    NegativeDepth,

    #[error("unknown proof type {0}")]
    UnknownProofType(u8),

    #[error("invalid size")]
    InvalidSize,

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofType {
    Deadend,
    Short,
    Collision,
    Exists,
}

impl TryFrom<u8> for ProofType {
    type Error = ProofError;

    fn try_from(value: u8) -> Result<Self, ProofError> {
        match value {
            0 => Ok(Self::Deadend),
            1 => Ok(Self::Short),
            2 => Ok(Self::Collision),
            3 => Ok(Self::Exists),
            other => Err(ProofError::UnknownProofType(other)),
        }
    }
}

/// A compressed prefix: an explicit bit count plus the packed bits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrefixBits {
    pub size: usize,
    pub bits: Vec<u8>,
}

impl PrefixBits {
    fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofNode {
    pub prefix: PrefixBits,
    pub sibling: Hash<32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofData {
    Deadend,
    Short {
        prefix: PrefixBits,
        left: Hash<32>,
        right: Hash<32>,
    },
    Collision {
        key: Hash<32>,
        hash: Hash<32>,
    },
    Exists {
        value: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub depth: usize,
    pub nodes: Vec<ProofNode>,
    pub data: ProofData,
}

impl Proof {
    pub fn proof_type(&self) -> ProofType {
        match self.data {
            ProofData::Deadend => ProofType::Deadend,
            ProofData::Short { .. } => ProofType::Short,
            ProofData::Collision { .. } => ProofType::Collision,
            ProofData::Exists { .. } => ProofType::Exists,
        }
    }

    pub fn decode(reader: &mut ByteReader) -> Result<Self, ProofError> {
        let type_and_depth = reader.read_u16_le()?;
        let proof_type = ProofType::try_from((type_and_depth >> 14) as u8)?;
        let depth = (type_and_depth & 0x3fff) as usize;

        if depth > MAX_DEPTH {
            return Err(ProofError::TooDeep);
        }

        let node_count = reader.read_u16_le()? as usize;
        if node_count > MAX_DEPTH {
            return Err(ProofError::TooDeep);
        }

        let bitmap = reader.read_bytes(node_count.div_ceil(8))?.to_vec();

        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let prefix = if bitmap[i >> 3] & (1 << (i & 7)) != 0 {
                read_prefix(reader)?
            } else {
                PrefixBits::default()
            };

            nodes.push(ProofNode {
                prefix,
                sibling: Hash::new(reader.read_array()?),
            });
        }

        let data = match proof_type {
            ProofType::Deadend => ProofData::Deadend,
            ProofType::Short => ProofData::Short {
                prefix: read_prefix(reader)?,
                left: Hash::new(reader.read_array()?),
                right: Hash::new(reader.read_array()?),
            },
            ProofType::Collision => ProofData::Collision {
                key: Hash::new(reader.read_array()?),
                hash: Hash::new(reader.read_array()?),
            },
            ProofType::Exists => {
                let size = reader.read_u16_le()? as usize;
                ProofData::Exists {
                    value: reader.read_bytes(size)?.to_vec(),
                }
            }
        };

        Ok(Self { depth, nodes, data })
    }

    /// Verify the proof against a trusted root for the given key.
    ///
    /// On success returns the resource-data bytes embedded in the name
    /// state for `exists` proofs, and an empty vector for every other
    /// proof shape. Verification is deterministic: the same inputs always
    /// produce the same result.
    pub fn verify(&self, root: &Hash<32>, key: &Hash<32>) -> Result<Vec<u8>, ProofError> {
        let leaf = match &self.data {
            ProofData::Deadend => Hash::zero(),
            ProofData::Short {
                prefix,
                left,
                right,
            } => {
                if prefix_matches(key, prefix, self.depth) {
                    return Err(ProofError::SamePath);
                }

                hash_internal(prefix, left, right)
            }
            ProofData::Collision {
                key: other_key,
                hash,
            } => {
                if other_key == key {
                    return Err(ProofError::SameKey);
                }

                hash_leaf(other_key, hash)
            }
            ProofData::Exists { value } => hash_leaf(key, &Hasher::<256>::hash(value)),
        };

        let mut next = leaf;
        let mut depth = self.depth;

        for node in self.nodes.iter().rev() {
            if depth < 1 + node.prefix.size {
                return Err(ProofError::NegativeDepth);
            }

            depth -= 1;

            if get_bit(key.as_slice(), depth) {
                next = hash_internal(&node.prefix, &node.sibling, &next);
            } else {
                next = hash_internal(&node.prefix, &next, &node.sibling);
            }

            depth -= node.prefix.size;

            if !prefix_matches(key, &node.prefix, depth) {
                return Err(ProofError::PathMismatch);
            }
        }

        if depth != 0 {
            return Err(ProofError::PathMismatch);
        }

        if next != *root {
            return Err(ProofError::HashMismatch);
        }

        match &self.data {
            ProofData::Exists { value } => read_resource_bytes(value).map_err(ProofError::from),
            _ => Ok(Vec::new()),
        }
    }
}

/// The value of an `exists` proof is a name-state record; extract its
/// resource-data bytes.
fn read_resource_bytes(value: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut reader = ByteReader::new(value);

    let name_len = reader.read_u8()? as usize;
    let _name = reader.read_bytes(name_len)?;

    let res_len = reader.read_u16_le()? as usize;
    Ok(reader.read_bytes(res_len)?.to_vec())
}

fn read_prefix(reader: &mut ByteReader) -> Result<PrefixBits, ProofError> {
    let first = reader.read_u8()?;

    let size = if first & 0x80 != 0 {
        (((first & 0x7f) as usize) << 8) | reader.read_u8()? as usize
    } else {
        first as usize
    };

    if !(1..=MAX_DEPTH).contains(&size) {
        return Err(ProofError::InvalidSize);
    }

    let bits = reader.read_bytes(size.div_ceil(8))?.to_vec();

    Ok(PrefixBits { size, bits })
}

/// Test bit `index` of a digest, big-endian bit order (bit 0 is the most
/// significant bit of the first byte).
fn get_bit(bytes: &[u8], index: usize) -> bool {
    (bytes[index >> 3] >> (7 - (index & 7))) & 1 == 1
}

/// Whether `key` carries `prefix` at bit offset `at_depth`.
fn prefix_matches(key: &Hash<32>, prefix: &PrefixBits, at_depth: usize) -> bool {
    if at_depth + prefix.size > MAX_DEPTH {
        return false;
    }

    for i in 0..prefix.size {
        if get_bit(&prefix.bits, i) != get_bit(key.as_slice(), at_depth + i) {
            return false;
        }
    }

    true
}

fn hash_leaf(key: &Hash<32>, value_hash: &Hash<32>) -> Hash<32> {
    let mut hasher = Hasher::<256>::new();
    hasher.input(&[PREFIX_LEAF]);
    hasher.input(key.as_slice());
    hasher.input(value_hash.as_slice());
    hasher.finalize()
}

fn hash_internal(prefix: &PrefixBits, left: &Hash<32>, right: &Hash<32>) -> Hash<32> {
    let mut hasher = Hasher::<256>::new();

    if prefix.is_empty() {
        hasher.input(&[PREFIX_INTERNAL]);
    } else {
        hasher.input(&[PREFIX_SKIP]);
        hasher.input(&(prefix.size as u16).to_le_bytes());
        hasher.input(&prefix.bits);
    }

    hasher.input(left.as_slice());
    hasher.input(right.as_slice());
    hasher.finalize()
}
