//! Block numbers wider than 64 bits.
//!
//! Heights, cursors and transaction values all flow through [`BlockNumber`].
//! On the wire a value that fits in a `u64` is a plain JSON number; anything
//! larger is written as a decimal string so no consumer silently truncates it.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SyncError;

/// A non-negative block number (or any other chain quantity) up to 256 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNumber(U256);

impl BlockNumber {
    pub const ZERO: Self = Self(U256::ZERO);

    pub const fn new(value: U256) -> Self {
        Self(value)
    }

    pub const fn as_u256(&self) -> U256 {
        self.0
    }

    /// Returns the value as `u64` if it fits.
    pub fn to_u64(&self) -> Option<u64> {
        let limbs = self.0.as_limbs();
        if limbs[1..].iter().all(|l| *l == 0) {
            Some(limbs[0])
        } else {
            None
        }
    }

    /// `self - n`, clamped at zero.
    pub fn saturating_sub(self, n: u64) -> Self {
        Self(self.0.saturating_sub(U256::from(n)))
    }

    pub fn saturating_add(self, n: u64) -> Self {
        Self(self.0.saturating_add(U256::from(n)))
    }

    /// `self - n`, or `None` when `n > self`.
    pub fn checked_sub(self, n: u64) -> Option<Self> {
        self.0.checked_sub(U256::from(n)).map(Self)
    }

    pub fn next(self) -> Self {
        self.saturating_add(1)
    }

    /// Decodes a big-endian unsigned integer of at most 32 bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        U256::try_from_be_slice(bytes).map(Self).ok_or_else(|| {
            SyncError::Decode(format!(
                "big-endian integer of {} bytes exceeds 256 bits",
                bytes.len()
            ))
        })
    }

    /// Big-endian bytes with leading zeros removed (empty for zero).
    pub fn to_be_bytes_trimmed(&self) -> Vec<u8> {
        self.0.to_be_bytes_trimmed_vec()
    }

    /// Parses a `0x`-prefixed hex quantity as returned by JSON-RPC nodes.
    pub fn from_hex(s: &str) -> Result<Self, SyncError> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| SyncError::Decode(format!("hex quantity without 0x prefix: {s}")))?;
        if digits.is_empty() {
            return Err(SyncError::Decode("empty hex quantity".into()));
        }
        U256::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|e| SyncError::Decode(format!("invalid hex quantity {s}: {e}")))
    }

    /// `0x`-prefixed lowercase hex, the JSON-RPC quantity encoding.
    pub fn to_hex(&self) -> String {
        format!("0x{:x}", self.0)
    }
}

impl From<u64> for BlockNumber {
    fn from(n: u64) -> Self {
        Self(U256::from(n))
    }
}

impl From<U256> for BlockNumber {
    fn from(n: U256) -> Self {
        Self(n)
    }
}

impl FromStr for BlockNumber {
    type Err = SyncError;

    /// Accepts decimal or `0x`-prefixed hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with("0x") || s.starts_with("0X") {
            return Self::from_hex(s);
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::Decode(format!("invalid block number: {s:?}")));
        }
        U256::from_str_radix(s, 10)
            .map(Self)
            .map_err(|e| SyncError::Decode(format!("invalid block number {s}: {e}")))
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serialize for BlockNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_u64() {
            Some(n) => serializer.serialize_u64(n),
            None => serializer.serialize_str(&self.0.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for BlockNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(BlockNumberVisitor)
    }
}

struct BlockNumberVisitor;

impl<'de> Visitor<'de> for BlockNumberVisitor {
    type Value = BlockNumber;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer, a decimal string, or a 0x-prefixed hex string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(BlockNumber::from(v))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Self::Value, E> {
        Ok(BlockNumber(U256::from(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(BlockNumber::from)
            .map_err(|_| E::custom(format!("negative block number {v}")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        Err(E::custom(format!(
            "block number {v} is not an exact integer; encode large values as strings"
        )))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_serialize_as_numbers() {
        let n = BlockNumber::from(17_000_000);
        assert_eq!(serde_json::to_string(&n).unwrap(), "17000000");
    }

    #[test]
    fn wide_values_keep_full_precision() {
        let wide: BlockNumber = "340282366920938463463374607431768211456".parse().unwrap();
        assert_eq!(wide.to_u64(), None);
        let json = serde_json::to_string(&wide).unwrap();
        assert_eq!(json, "\"340282366920938463463374607431768211456\"");
        let back: BlockNumber = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wide);
    }

    #[test]
    fn accepts_hex_strings() {
        let n: BlockNumber = serde_json::from_str("\"0x10\"").unwrap();
        assert_eq!(n, BlockNumber::from(16));
        assert_eq!(n.to_hex(), "0x10");
        assert!(BlockNumber::from_hex("10").is_err());
        assert!(BlockNumber::from_hex("0x").is_err());
    }

    #[test]
    fn rejects_negative_and_fractional() {
        assert!(serde_json::from_str::<BlockNumber>("-1").is_err());
        assert!(serde_json::from_str::<BlockNumber>("1.5").is_err());
        assert!("12a".parse::<BlockNumber>().is_err());
    }

    #[test]
    fn subtraction_saturates() {
        let n = BlockNumber::from(5);
        assert_eq!(n.saturating_sub(20), BlockNumber::ZERO);
        assert_eq!(n.checked_sub(20), None);
        assert_eq!(n.checked_sub(5), Some(BlockNumber::ZERO));
    }

    #[test]
    fn big_endian_bytes() {
        let n = BlockNumber::from_be_slice(&[0x01, 0x00]).unwrap();
        assert_eq!(n, BlockNumber::from(256));
        assert_eq!(n.to_be_bytes_trimmed(), vec![0x01, 0x00]);
        assert!(BlockNumber::from_be_slice(&[0xff; 33]).is_err());
    }
}
