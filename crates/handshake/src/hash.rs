//! Hashing primitives used by the Handshake consensus objects.
//!
//! Everything consensus-critical in Handshake is addressed by BLAKE2b or
//! SHA3 digests. The [`Hash`] type is a thin fixed-size wrapper so that
//! 32-byte identifiers don't degrade into anonymous `Vec<u8>` values.

use cryptoxide::blake2b::Blake2b;
use cryptoxide::digest::Digest as _;
use cryptoxide::sha3::Sha3_256;

/// A fixed-size digest value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash<const N: usize>([u8; N]);

impl<const N: usize> Hash<N> {
    pub const fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; N])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl<const N: usize> From<[u8; N]> for Hash<N> {
    fn from(value: [u8; N]) -> Self {
        Self(value)
    }
}

impl<const N: usize> AsRef<[u8]> for Hash<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> std::ops::Deref for Hash<N> {
    type Target = [u8; N];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> std::fmt::Debug for Hash<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl<const N: usize> std::fmt::Display for Hash<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl<const N: usize> std::str::FromStr for Hash<N> {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; N];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Incremental BLAKE2b hasher with a const-generic digest size in bits.
pub struct Hasher<const BITS: usize>(Blake2b);

impl<const BITS: usize> Hasher<BITS> {
    #[inline]
    pub fn input(&mut self, bytes: &[u8]) {
        self.0.input(bytes);
    }
}

macro_rules! common_hasher {
    ($size:literal) => {
        impl Hasher<$size> {
            #[inline]
            pub fn new() -> Self {
                Self(Blake2b::new($size / 8))
            }

            /// Hash the given bytes in one call.
            #[inline]
            pub fn hash(bytes: &[u8]) -> Hash<{ $size / 8 }> {
                let mut hasher = Self::new();
                hasher.input(bytes);
                hasher.finalize()
            }

            pub fn finalize(mut self) -> Hash<{ $size / 8 }> {
                let mut out = [0; $size / 8];
                self.0.result(&mut out);
                Hash::new(out)
            }
        }

        impl Default for Hasher<$size> {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

common_hasher!(256);
common_hasher!(512);

/// SHA3-256 digest of the given bytes.
pub fn sha3_256(bytes: &[u8]) -> Hash<32> {
    let mut hasher = Sha3_256::new();
    hasher.input(bytes);
    let mut out = [0u8; 32];
    hasher.result(&mut out);
    Hash::new(out)
}

/// Incremental SHA3-256, for callers that feed multiple segments.
pub struct Sha3Hasher(Sha3_256);

impl Sha3Hasher {
    pub fn new() -> Self {
        Self(Sha3_256::new())
    }

    #[inline]
    pub fn input(&mut self, bytes: &[u8]) {
        self.0.input(bytes);
    }

    pub fn finalize(mut self) -> Hash<32> {
        let mut out = [0u8; 32];
        self.0.result(&mut out);
        Hash::new(out)
    }
}

impl Default for Sha3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake2b_256_known_vector() {
        // blake2b-256 of the empty string
        let digest = Hasher::<256>::hash(b"");

        assert_eq!(
            digest.to_string(),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
    }

    #[test]
    fn sha3_256_known_vector() {
        // sha3-256 of the empty string
        let digest = sha3_256(b"");

        assert_eq!(
            digest.to_string(),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn hash_parses_hex() {
        let parsed: Hash<32> = "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
            .parse()
            .unwrap();

        assert_eq!(parsed, Hasher::<256>::hash(b""));
        assert!(!parsed.is_zero());
        assert!(Hash::<32>::zero().is_zero());
    }
}
