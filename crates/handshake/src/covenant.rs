//! Covenant decoding.
//!
//! On the wire a covenant is a type byte plus a varint-counted list of byte
//! string items. The generic form is decoded eagerly; conversion into a
//! typed covenant validates item counts and per-item lengths at access time.

use crate::codec::{ByteReader, DecodeError};
use crate::hash::Hash;
use crate::varint::read_varint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CovenantType {
    None = 0,
    Claim = 1,
    Open = 2,
    Bid = 3,
    Reveal = 4,
    Redeem = 5,
    Register = 6,
    Update = 7,
    Renew = 8,
    Transfer = 9,
    Finalize = 10,
    Revoke = 11,
}

/// The generic on-wire covenant form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Covenant {
    pub type_byte: u8,
    pub items: Vec<Vec<u8>>,
}

/// A covenant with its item shape validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedCovenant {
    None,
    Claim {
        name_hash: Hash<32>,
        height: u32,
        name: Vec<u8>,
        flags: u8,
        commit_hash: Hash<32>,
        commit_height: u32,
    },
    Open {
        name_hash: Hash<32>,
        height: u32,
        name: Vec<u8>,
    },
    Bid {
        name_hash: Hash<32>,
        height: u32,
        name: Vec<u8>,
        blind: Hash<32>,
    },
    Reveal {
        name_hash: Hash<32>,
        height: u32,
        nonce: Hash<32>,
    },
    Redeem {
        name_hash: Hash<32>,
        height: u32,
    },
    Register {
        name_hash: Hash<32>,
        height: u32,
        resource: Vec<u8>,
        block_hash: Hash<32>,
    },
    Update {
        name_hash: Hash<32>,
        height: u32,
        resource: Vec<u8>,
    },
    Renew {
        name_hash: Hash<32>,
        height: u32,
        block_hash: Hash<32>,
    },
    Transfer {
        name_hash: Hash<32>,
        height: u32,
        address_version: u8,
        address_hash: Vec<u8>,
    },
    Finalize {
        name_hash: Hash<32>,
        height: u32,
        name: Vec<u8>,
        flags: u8,
        claim_height: u32,
        renewal_count: u32,
        block_hash: Hash<32>,
    },
    Revoke {
        name_hash: Hash<32>,
        height: u32,
    },
}

impl Covenant {
    pub fn decode(reader: &mut ByteReader) -> Result<Self, DecodeError> {
        let type_byte = reader.read_u8()?;

        let item_count = read_varint(reader)? as usize;
        let mut items = Vec::with_capacity(item_count.min(16));
        for _ in 0..item_count {
            let len = read_varint(reader)? as usize;
            items.push(reader.read_bytes(len)?.to_vec());
        }

        Ok(Self { type_byte, items })
    }

    pub fn is_name_covenant(&self) -> bool {
        self.type_byte != CovenantType::None as u8
    }

    fn expect_items(&self, expected: usize) -> Result<(), DecodeError> {
        if self.items.len() != expected {
            return Err(DecodeError::CovenantItemCount {
                expected,
                got: self.items.len(),
            });
        }

        Ok(())
    }

    fn item_hash(&self, index: usize) -> Result<Hash<32>, DecodeError> {
        let item = &self.items[index];
        let bytes: [u8; 32] =
            item.as_slice()
                .try_into()
                .map_err(|_| DecodeError::CovenantItemLength {
                    index,
                    len: item.len(),
                })?;

        Ok(Hash::new(bytes))
    }

    fn item_u32(&self, index: usize) -> Result<u32, DecodeError> {
        let item = &self.items[index];
        let bytes: [u8; 4] =
            item.as_slice()
                .try_into()
                .map_err(|_| DecodeError::CovenantItemLength {
                    index,
                    len: item.len(),
                })?;

        Ok(u32::from_le_bytes(bytes))
    }

    fn item_u8(&self, index: usize) -> Result<u8, DecodeError> {
        let item = &self.items[index];
        if item.len() != 1 {
            return Err(DecodeError::CovenantItemLength {
                index,
                len: item.len(),
            });
        }

        Ok(item[0])
    }

    /// Convert the generic form into its typed subtype.
    ///
    /// Total over all known covenant types; an unknown type byte or an item
    /// shape mismatch is a hard error.
    pub fn typed(&self) -> Result<TypedCovenant, DecodeError> {
        match self.type_byte {
            0 => {
                // a NONE covenant carries no items
                Ok(TypedCovenant::None)
            }
            1 => {
                self.expect_items(6)?;
                Ok(TypedCovenant::Claim {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    name: self.items[2].clone(),
                    flags: self.item_u8(3)?,
                    commit_hash: self.item_hash(4)?,
                    commit_height: self.item_u32(5)?,
                })
            }
            2 => {
                self.expect_items(3)?;
                Ok(TypedCovenant::Open {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    name: self.items[2].clone(),
                })
            }
            3 => {
                self.expect_items(4)?;
                Ok(TypedCovenant::Bid {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    name: self.items[2].clone(),
                    blind: self.item_hash(3)?,
                })
            }
            4 => {
                self.expect_items(3)?;
                Ok(TypedCovenant::Reveal {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    nonce: self.item_hash(2)?,
                })
            }
            5 => {
                self.expect_items(2)?;
                Ok(TypedCovenant::Redeem {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                })
            }
            6 => {
                self.expect_items(4)?;
                Ok(TypedCovenant::Register {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    resource: self.items[2].clone(),
                    block_hash: self.item_hash(3)?,
                })
            }
            7 => {
                self.expect_items(3)?;
                Ok(TypedCovenant::Update {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    resource: self.items[2].clone(),
                })
            }
            8 => {
                self.expect_items(3)?;
                Ok(TypedCovenant::Renew {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    block_hash: self.item_hash(2)?,
                })
            }
            9 => {
                self.expect_items(4)?;
                let address_hash = self.items[3].clone();
                if !(2..=40).contains(&address_hash.len()) {
                    return Err(DecodeError::CovenantItemLength {
                        index: 3,
                        len: address_hash.len(),
                    });
                }
                Ok(TypedCovenant::Transfer {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    address_version: self.item_u8(2)?,
                    address_hash,
                })
            }
            10 => {
                self.expect_items(7)?;
                Ok(TypedCovenant::Finalize {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                    name: self.items[2].clone(),
                    flags: self.item_u8(3)?,
                    claim_height: self.item_u32(4)?,
                    renewal_count: self.item_u32(5)?,
                    block_hash: self.item_hash(6)?,
                })
            }
            11 => {
                self.expect_items(2)?;
                Ok(TypedCovenant::Revoke {
                    name_hash: self.item_hash(0)?,
                    height: self.item_u32(1)?,
                })
            }
            other => Err(DecodeError::UnknownCovenantType(other)),
        }
    }
}
