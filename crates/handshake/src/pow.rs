//! Proof-of-work validation.
//!
//! The compact `bits` field expands to a 256-bit big-endian target; a header
//! is valid iff its hash, read as a big-endian integer, is at most the
//! target.

use thiserror::Error;

use crate::block::Header;
use crate::hash::Hash;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowError {
    #[error("compact target is negative")]
    NegativeTarget,

    #[error("compact target overflows 256 bits")]
    TargetOverflow,

    #[error("header hash is above target")]
    HighHash,
}

/// A 256-bit big-endian proof-of-work target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target([u8; 32]);

impl Target {
    /// Whether the given hash, as a big-endian integer, is `<=` the target.
    pub fn is_met_by(&self, hash: &Hash<32>) -> bool {
        hash.as_slice() <= &self.0[..]
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Expand a compact-bits value into the full target.
///
/// `exp = bits >> 24`, `mantissa = bits & 0x007fffff`; the mantissa is
/// shifted left by `8·(exp−3)` bytes, or right by `8·(3−exp)` when the
/// exponent is 3 or less.
pub fn compact_to_target(bits: u32) -> Result<Target, PowError> {
    if bits & 0x0080_0000 != 0 {
        return Err(PowError::NegativeTarget);
    }

    let exp = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;

    let mut out = [0u8; 32];

    if exp <= 3 {
        let value = mantissa >> (8 * (3 - exp));
        out[29..32].copy_from_slice(&value.to_be_bytes()[1..4]);
        return Ok(Target(out));
    }

    let shift = exp - 3;
    let bytes = mantissa.to_be_bytes();

    // place the three mantissa bytes, low byte at index 31 - shift
    for (i, byte) in bytes[1..4].iter().enumerate() {
        if *byte == 0 {
            continue;
        }

        let magnitude = 2 - i + shift;
        if magnitude > 31 {
            return Err(PowError::TargetOverflow);
        }

        out[31 - magnitude] = *byte;
    }

    Ok(Target(out))
}

/// Validate the header's proof of work. The header is not mutated.
pub fn validate(header: &Header) -> Result<(), PowError> {
    let target = compact_to_target(header.bits)?;

    if !target.is_met_by(&header.hash()) {
        return Err(PowError::HighHash);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_hex(bits: u32) -> String {
        compact_to_target(bits).unwrap().to_string()
    }

    #[test]
    fn compact_to_target_vectors() {
        assert_eq!(
            target_hex(0x1d00_ffff),
            "00000000ffff0000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            target_hex(0x0303_0000),
            "0000000000000000000000000000000000000000000000000000000000030000"
        );
        assert_eq!(
            target_hex(0x0100_3456),
            "0000000000000000000000000000000000000000000000000000000000000000"
        );
        assert_eq!(
            target_hex(0x0412_3456),
            "0000000000000000000000000000000000000000000000000000000012345600"
        );
    }

    #[test]
    fn negative_bits_are_rejected() {
        assert_eq!(
            compact_to_target(0x0480_0001),
            Err(PowError::NegativeTarget)
        );
    }

    #[test]
    fn overflowing_bits_are_rejected() {
        assert_eq!(
            compact_to_target(0x2212_3456),
            Err(PowError::TargetOverflow)
        );
    }

    #[test]
    fn comparison_is_big_endian() {
        let target = compact_to_target(0x1d00_ffff).unwrap();

        let mut low = [0u8; 32];
        low[4] = 0xff;
        assert!(target.is_met_by(&Hash::new(low)));

        let mut equal = [0u8; 32];
        equal[4] = 0xff;
        equal[5] = 0xff;
        assert!(target.is_met_by(&Hash::new(equal)));

        let mut high = [0u8; 32];
        high[3] = 0x01;
        assert!(!target.is_met_by(&Hash::new(high)));
    }

    #[test]
    fn monotone_in_the_hash() {
        // if a hash passes, any numerically smaller hash passes too
        let target = compact_to_target(0x0412_3456).unwrap();

        let mut passing = [0u8; 32];
        passing[28] = 0x12;
        passing[29] = 0x34;
        passing[30] = 0x56;
        assert!(target.is_met_by(&Hash::new(passing)));

        let mut smaller = passing;
        smaller[31] = 0;
        smaller[30] = 0x55;
        assert!(target.is_met_by(&Hash::new(smaller)));
    }

    #[test]
    fn zero_target_only_met_by_zero_hash() {
        let target = compact_to_target(0x0100_3456).unwrap();

        assert!(target.is_met_by(&Hash::zero()));

        let mut hash = [0u8; 32];
        hash[31] = 1;
        assert!(!target.is_met_by(&Hash::new(hash)));
    }
}
