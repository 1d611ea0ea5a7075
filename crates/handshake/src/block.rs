//! Handshake block, header and transaction codecs.
//!
//! All decoders consume a [`ByteReader`] over the raw network bytes. The
//! transaction decoder is two-phase: the body (inputs, outputs, lock time)
//! first, then one witness stack per input in input order. The exact byte
//! ranges of the body and of the witness section are retained during decode
//! because both transaction ids are computed over them.

use crate::codec::{ByteReader, DecodeError};
use crate::covenant::Covenant;
use crate::hash::{Hash, Hasher, Sha3Hasher};
use crate::varint::read_varint;

/// Serialized size of a block header.
pub const HEADER_SIZE: usize = 236;

/// A 236-byte Handshake block header, little-endian fixed layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub nonce: u32,
    pub time: u64,
    pub prev_block: Hash<32>,
    pub name_root: Hash<32>,
    pub extra_nonce: [u8; 24],
    pub reserved_root: Hash<32>,
    pub witness_root: Hash<32>,
    pub merkle_root: Hash<32>,
    pub version: u32,
    pub bits: u32,
    pub mask: [u8; 32],
}

impl Header {
    pub fn decode(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        Ok(Self {
            nonce: reader.read_u32_le()?,
            time: reader.read_u64_le()?,
            prev_block: Hash::new(reader.read_array()?),
            name_root: Hash::new(reader.read_array()?),
            extra_nonce: reader.read_array()?,
            reserved_root: Hash::new(reader.read_array()?),
            witness_root: Hash::new(reader.read_array()?),
            merkle_root: Hash::new(reader.read_array()?),
            version: reader.read_u32_le()?,
            bits: reader.read_u32_le()?,
            mask: reader.read_array()?,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut pos = 0;

        let mut put = |bytes: &[u8], pos: &mut usize| {
            out[*pos..*pos + bytes.len()].copy_from_slice(bytes);
            *pos += bytes.len();
        };

        put(&self.nonce.to_le_bytes(), &mut pos);
        put(&self.time.to_le_bytes(), &mut pos);
        put(self.prev_block.as_slice(), &mut pos);
        put(self.name_root.as_slice(), &mut pos);
        put(&self.extra_nonce, &mut pos);
        put(self.reserved_root.as_slice(), &mut pos);
        put(self.witness_root.as_slice(), &mut pos);
        put(self.merkle_root.as_slice(), &mut pos);
        put(&self.version.to_le_bytes(), &mut pos);
        put(&self.bits.to_le_bytes(), &mut pos);
        put(&self.mask, &mut pos);

        debug_assert_eq!(pos, HEADER_SIZE);

        out
    }

    /// Padding bytes derived from `prev_block ⊕ name_root`, repeated to the
    /// requested size.
    fn padding(&self, size: usize) -> Vec<u8> {
        (0..size)
            .map(|i| self.prev_block[i % 32] ^ self.name_root[i % 32])
            .collect()
    }

    fn sub_hash(&self) -> Hash<32> {
        let mut hasher = Hasher::<256>::new();
        hasher.input(&self.extra_nonce);
        hasher.input(self.reserved_root.as_slice());
        hasher.input(self.witness_root.as_slice());
        hasher.input(self.merkle_root.as_slice());
        hasher.input(&self.version.to_le_bytes());
        hasher.input(&self.bits.to_le_bytes());
        hasher.finalize()
    }

    fn mask_hash(&self) -> Hash<32> {
        let mut hasher = Hasher::<256>::new();
        hasher.input(self.prev_block.as_slice());
        hasher.input(&self.mask);
        hasher.finalize()
    }

    fn commit_hash(&self) -> Hash<32> {
        let mut hasher = Hasher::<256>::new();
        hasher.input(self.sub_hash().as_slice());
        hasher.input(self.mask_hash().as_slice());
        hasher.finalize()
    }

    /// The 128-byte miner preimage: nonce, time, 20 bytes of padding, the
    /// two chain roots and the commitment over everything else.
    fn prehead(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.padding(20));
        out.extend_from_slice(self.prev_block.as_slice());
        out.extend_from_slice(self.name_root.as_slice());
        out.extend_from_slice(self.commit_hash().as_slice());
        out
    }

    /// The share hash: `blake2b256(blake2b512(prehead) ‖ pad32 ‖
    /// sha3_256(prehead ‖ pad8))`.
    fn share_hash(&self) -> Hash<32> {
        let prehead = self.prehead();

        let left = {
            let mut hasher = Hasher::<512>::new();
            hasher.input(&prehead);
            hasher.finalize()
        };

        let right = {
            let mut hasher = Sha3Hasher::new();
            hasher.input(&prehead);
            hasher.input(&self.padding(8));
            hasher.finalize()
        };

        let mut hasher = Hasher::<256>::new();
        hasher.input(left.as_slice());
        hasher.input(&self.padding(32));
        hasher.input(right.as_slice());
        hasher.finalize()
    }

    /// The consensus header hash: share hash XOR'd byte-by-byte with the
    /// mask.
    pub fn hash(&self) -> Hash<32> {
        let share = self.share_hash();
        let mut out = [0u8; 32];

        for (i, byte) in out.iter_mut().enumerate() {
            *byte = share[i] ^ self.mask[i];
        }

        Hash::new(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outpoint {
    pub hash: Hash<32>,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub prevout: Outpoint,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl Input {
    fn decode_body(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        Ok(Self {
            prevout: Outpoint {
                hash: Hash::new(reader.read_array()?),
                index: reader.read_u32_le()?,
            },
            sequence: reader.read_u32_le()?,
            witness: Vec::new(),
        })
    }
}

/// A versioned witness-program address.
///
/// Version 0 hashes are 20 or 32 bytes; any version is limited to 2..=40
/// bytes and versions above 31 are invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub version: u8,
    pub hash: Vec<u8>,
}

impl Address {
    pub fn decode(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        let version = reader.read_u8()?;

        if version > 31 {
            return Err(DecodeError::InvalidAddressVersion(version));
        }

        let len = reader.read_u8()? as usize;

        if !(2..=40).contains(&len) {
            return Err(DecodeError::InvalidAddressLength(len));
        }

        if version == 0 && len != 20 && len != 32 {
            return Err(DecodeError::InvalidAddressLength(len));
        }

        Ok(Self {
            version,
            hash: reader.read_bytes(len)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub value: u64,
    pub address: Address,
    pub covenant: Covenant,
}

impl Output {
    pub fn decode(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        Ok(Self {
            value: reader.read_u64_le()?,
            address: Address::decode(reader)?,
            covenant: Covenant::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub lock_time: u32,
    id: Hash<32>,
    wid: Hash<32>,
}

impl Transaction {
    pub fn decode(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        let body_start = reader.position();

        let version = reader.read_u32_le()?;

        let input_count = read_varint(reader)? as usize;
        let mut inputs = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            inputs.push(Input::decode_body(reader)?);
        }

        let output_count = read_varint(reader)? as usize;
        let mut outputs = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            outputs.push(Output::decode(reader)?);
        }

        let lock_time = reader.read_u32_le()?;
        let body_end = reader.position();

        let witness_start = reader.position();
        for input in inputs.iter_mut() {
            let item_count = read_varint(reader)? as usize;
            let mut witness = Vec::with_capacity(item_count.min(1024));
            for _ in 0..item_count {
                let len = read_varint(reader)? as usize;
                witness.push(reader.read_bytes(len)?.to_vec());
            }
            input.witness = witness;
        }
        let witness_end = reader.position();

        // Both ids are computed over the exact byte ranges we just walked.
        let body = &reader.buffer()[body_start..body_end];
        let witness = &reader.buffer()[witness_start..witness_end];

        let id = Hasher::<256>::hash(body);

        let wid = {
            let mut hasher = Hasher::<256>::new();
            hasher.input(id.as_slice());
            hasher.input(Hasher::<256>::hash(witness).as_slice());
            hasher.finalize()
        };

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
            id,
            wid,
        })
    }

    /// `blake2b256` of the serialized body without witnesses.
    pub fn id(&self) -> Hash<32> {
        self.id
    }

    /// `blake2b256(id ‖ blake2b256(witness-bytes))`.
    pub fn witness_id(&self) -> Hash<32> {
        self.wid
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);

        let header = Header::decode(&mut reader)?;

        let tx_count = read_varint(&mut reader)? as usize;
        let mut transactions = Vec::with_capacity(tx_count.min(4096));
        for _ in 0..tx_count {
            transactions.push(Transaction::decode(&mut reader)?);
        }

        if !reader.is_empty() {
            return Err(DecodeError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn hash(&self) -> Hash<32> {
        self.header.hash()
    }
}
