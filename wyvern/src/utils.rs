//! Hashing and serde helpers shared by the order and contract modules.

use std::borrow::Cow;

use serde::{
    de::{Deserialize, Deserializer, Error},
    ser::Serializer,
};
use sha3::{Digest, Keccak256};
use web3::types::U256;

/// Keccak-256 of an arbitrary byte string.
#[must_use]
pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    <[u8; 32]>::from(hasher.finalize())
}

/// First four bytes of the keccak hash of a Solidity function signature.
#[must_use]
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// A [`U256`] in 32-byte big-endian form, for feeding into hashers.
pub struct BigEndian([u8; 32]);

impl AsRef<[u8]> for BigEndian {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&U256> for BigEndian {
    fn from(value: &U256) -> Self {
        let mut result = [0; 32];
        value.to_big_endian(&mut result);
        Self(result)
    }
}

fn try_hex(str: &str) -> Option<&str> {
    if str.len() >= 2 && (&str[..2] == "0x" || &str[..2] == "0X") {
        Some(&str[2..])
    } else {
        None
    }
}

/// Serialize using [`ToString`], which for numbers gives a decimal string.
pub fn to_string<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: ToString,
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn u64_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let str = <Cow<'de, str>>::deserialize(deserializer)?;
    try_hex(&str)
        .map_or_else(|| str.parse(), |hex| u64::from_str_radix(hex, 16))
        .map_err(D::Error::custom)
}

pub fn u256_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
    let str = <Cow<'de, str>>::deserialize(deserializer)?;
    try_hex(&str).map_or_else(
        || U256::from_dec_str(&str).map_err(D::Error::custom),
        |hex| U256::from_str_radix(hex, 16).map_err(D::Error::custom),
    )
}

pub mod u64_dec {
    pub use super::{to_string as serialize, u64_from_str as deserialize};
}

pub mod u256_dec {
    pub use super::{to_string as serialize, u256_from_str as deserialize};
}

pub mod u256_opt_dec {
    use serde::{de::Deserializer, ser::Serializer};
    use web3::types::U256;

    pub fn serialize<S: Serializer>(
        value: &Option<U256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => super::to_string(value, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error> {
        super::u256_from_str(deserializer).map(Some)
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_keccak_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_selector_transfer() {
        // transfer(address,uint256) is the canonical ERC20 example
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
    }

    #[test]
    fn test_big_endian_roundtrip() {
        let value = U256::from(0x1234_5678_u64);
        let be = BigEndian::from(&value);
        assert_eq!(U256::from_big_endian(be.as_ref()), value);
    }
}
