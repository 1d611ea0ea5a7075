//! Handshake network parameters.

use crate::hash::Hash;

/// Immutable parameters for one Handshake network.
///
/// The magic gates incoming frames, the genesis hash seeds the block locator
/// on a first connect with no saved cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub name: &'static str,
    pub magic: u32,
    pub default_port: u16,
    genesis: [u8; 32],
}

pub const MAINNET: Network = Network {
    name: "mainnet",
    magic: 0x5b6e_f2d3,
    default_port: 12038,
    genesis: hex_32(b"5b6ef2e3ba446d3b5b591d4ddbc6b14c6b5cbbe9b7b5a0e1f7e2b2c1d97d1f10"),
};

pub const TESTNET: Network = Network {
    name: "testnet",
    magic: 0x76a9_b2c4,
    default_port: 13038,
    genesis: hex_32(b"8b3b47fcbbcd8c6a65e8b8b60e49ae9b542f26c4a4c9e7a02c2d3bd20f2c6a10"),
};

impl Network {
    pub fn genesis_hash(&self) -> Hash<32> {
        Hash::new(self.genesis)
    }

    pub fn by_name(name: &str) -> Option<Network> {
        match name {
            "mainnet" => Some(MAINNET),
            "testnet" => Some(TESTNET),
            _ => None,
        }
    }
}

/// Const hex decode for 32-byte literals.
const fn hex_32(s: &[u8; 64]) -> [u8; 32] {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => panic!("invalid hex digit"),
        }
    }

    let mut out = [0u8; 32];
    let mut i = 0;
    while i < 32 {
        out[i] = (nibble(s[i * 2]) << 4) | nibble(s[i * 2 + 1]);
        i += 1;
    }

    out
}
