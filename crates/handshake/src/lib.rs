//! Wire-level client for the Handshake P2P protocol.
//!
//! This crate covers the pieces of Handshake that a DNS indexer needs to be a
//! read-only consumer of the chain: the binary codecs for headers, blocks,
//! transactions and covenants, proof-of-work validation, Urkel SPV proof
//! verification, and a peer session speaking the framed P2P protocol.

pub mod block;
pub mod codec;
pub mod covenant;
pub mod hash;
pub mod network;
pub mod peer;
pub mod pow;
pub mod proof;
pub mod resource;
pub mod varint;
pub mod wire;
