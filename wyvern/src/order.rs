use core::convert::{TryFrom, TryInto};

use hex_literal::hex;
use once_cell::sync::Lazy;
use serde::{
    de::{Deserializer, Error as _},
    ser::Serializer,
    Deserialize, Serialize,
};
use sha3::{Digest, Keccak256};
use thiserror::Error;
use web3::types::{Address, H256, U256};

use crate::{
    require,
    utils::{keccak256, u256_dec, u256_opt_dec, u64_dec, BigEndian},
};

const DOMAIN_NAME: &[u8] = b"Wyvern Exchange Contract";

static DOMAIN_SEPARATOR_TYPE_HASH: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak256(b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)")
});
static NAME_HASH: Lazy<[u8; 32]> = Lazy::new(|| keccak256(DOMAIN_NAME));
static VERSION_V2_HASH: Lazy<[u8; 32]> = Lazy::new(|| keccak256(b"2"));
static VERSION_V23_HASH: Lazy<[u8; 32]> = Lazy::new(|| keccak256(b"2.3"));
static TYPE_HASH_V2: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak256(
        b"Order(address exchange,address maker,address taker,uint256 makerRelayerFee,uint256 \
          takerRelayerFee,address feeRecipient,uint8 side,address target,bytes32 \
          targetData,address paymentToken,uint256 basePrice,uint256 listingTime,uint256 \
          expirationTime,uint256 salt)",
    )
});
static TYPE_HASH_V23: Lazy<[u8; 32]> = Lazy::new(|| {
    keccak256(
        b"Order(address exchange,address maker,address taker,uint256 makerRelayerFee,uint256 \
          takerRelayerFee,address feeRecipient,uint8 side,address target,bytes32 \
          targetData,address paymentToken,uint256 basePrice,uint256 listingTime,uint256 \
          expirationTime,uint256 salt,uint256 nonce)",
    )
});

const ETH_SIGN_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("order side must be 0 (buy) or 1 (sell)")]
    InvalidSide,
    #[error("order kind is not recognized")]
    UnknownKind,
    #[error("order basePrice cannot be 0")]
    ZeroPrice,
    #[error("order maker address cannot be 0")]
    InvalidMakerAddress,
    #[error("order exchange does not match the chain id")]
    InvalidExchange,
    #[error("v2.3 orders must carry a nonce")]
    MissingNonce,
    #[error("order signature must be valid")]
    InvalidSignature,
}

/// Wyvern protocol version of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderKind {
    WyvernV2,
    WyvernV23,
}

impl OrderKind {
    pub const ALL: [Self; 2] = [Self::WyvernV2, Self::WyvernV23];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WyvernV2 => "wyvern-v2",
            Self::WyvernV23 => "wyvern-v2.3",
        }
    }
}

impl TryFrom<&str> for OrderKind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "wyvern-v2" => Ok(Self::WyvernV2),
            "wyvern-v2.3" => Ok(Self::WyvernV23),
            _ => Err(Error::UnknownKind),
        }
    }
}

impl Serialize for OrderKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OrderKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let str = String::deserialize(deserializer)?;
        str.as_str().try_into().map_err(D::Error::custom)
    }
}

/// Order side. Encoded on the wire as `0` (buy) or `1` (sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl From<Side> for u8 {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

impl TryFrom<u8> for Side {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Buy),
            1 => Ok(Self::Sell),
            _ => Err(Error::InvalidSide),
        }
    }
}

impl Serialize for Side {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8((*self).into())
    }
}

impl<'de> Deserialize<'de> for Side {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer)?
            .try_into()
            .map_err(D::Error::custom)
    }
}

/// What an order may be filled against, decoded from the order's target
/// and calldata patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TargetSpec {
    SingleToken {
        contract: Address,
        #[serde(rename = "tokenId", with = "u256_dec")]
        token_id: U256,
    },
    SingleTokenV2 {
        contract: Address,
        #[serde(rename = "tokenId", with = "u256_dec")]
        token_id: U256,
    },
    TokenRange {
        contract:       Address,
        #[serde(rename = "startTokenId", with = "u256_dec")]
        start_token_id: U256,
        #[serde(rename = "endTokenId", with = "u256_dec")]
        end_token_id:   U256,
    },
    ContractWide {
        contract: Address,
    },
    TokenList {
        contract:    Address,
        #[serde(rename = "merkleRoot")]
        merkle_root: H256,
    },
}

impl TargetSpec {
    #[must_use]
    pub const fn contract(&self) -> Address {
        match self {
            Self::SingleToken { contract, .. }
            | Self::SingleTokenV2 { contract, .. }
            | Self::TokenRange { contract, .. }
            | Self::ContractWide { contract }
            | Self::TokenList { contract, .. } => *contract,
        }
    }

    /// The concrete token a sell order transfers, if the spec names one.
    #[must_use]
    pub const fn token_id(&self) -> Option<U256> {
        match self {
            Self::SingleToken { token_id, .. } | Self::SingleTokenV2 { token_id, .. } => {
                Some(*token_id)
            }
            _ => None,
        }
    }

    /// Commitment over the variant payload, folded into the order hash.
    #[must_use]
    pub fn data_hash(&self) -> H256 {
        match self {
            Self::SingleToken { token_id, .. } | Self::SingleTokenV2 { token_id, .. } => {
                H256::from(keccak256(BigEndian::from(token_id).as_ref()))
            }
            Self::TokenRange {
                start_token_id,
                end_token_id,
                ..
            } => {
                let mut hasher = Keccak256::new();
                hasher.update(BigEndian::from(start_token_id));
                hasher.update(BigEndian::from(end_token_id));
                H256::from(<[u8; 32]>::from(hasher.finalize()))
            }
            Self::ContractWide { .. } => H256::zero(),
            Self::TokenList { merkle_root, .. } => *merkle_root,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParams {
    pub kind:              OrderKind,
    pub exchange:          Address,
    pub maker:             Address,
    pub taker:             Address,
    #[serde(with = "u256_dec")]
    pub maker_relayer_fee: U256,
    #[serde(with = "u256_dec")]
    pub taker_relayer_fee: U256,
    pub fee_recipient:     Address,
    pub side:              Side,
    pub payment_token:     Address,
    #[serde(with = "u256_dec")]
    pub base_price:        U256,
    #[serde(with = "u64_dec")]
    pub listing_time:      u64,
    #[serde(with = "u64_dec")]
    pub expiration_time:   u64,
    #[serde(with = "u256_dec")]
    pub salt:              U256,
    #[serde(default, with = "u256_opt_dec", skip_serializing_if = "Option::is_none")]
    pub nonce:             Option<U256>,
    #[serde(with = "u64_dec")]
    pub chain_id:          u64,
    pub target:            TargetSpec,
}

impl OrderParams {
    /// Sanity checks that do not require chain state.
    pub fn validate(&self) -> Result<(), Error> {
        require!(!self.base_price.is_zero(), Error::ZeroPrice);
        require!(!self.maker.is_zero(), Error::InvalidMakerAddress);
        if self.kind == OrderKind::WyvernV23 {
            require!(self.nonce.is_some(), Error::MissingNonce);
        }
        Ok(())
    }

    /// EIP-712 content hash of the order. This is the order's identity
    /// everywhere in the indexer.
    #[must_use]
    pub fn hash(&self) -> H256 {
        let mut hasher = Keccak256::new();
        hasher.update(hex!("1901"));
        hasher.update(self.domain_hash());
        hasher.update(self.struct_hash());
        H256::from(<[u8; 32]>::from(hasher.finalize()))
    }

    /// The eth_sign digest makers actually sign.
    #[must_use]
    pub fn prefix_hash(&self) -> H256 {
        let mut hasher = Keccak256::new();
        hasher.update(ETH_SIGN_PREFIX);
        hasher.update(self.hash());
        H256::from(<[u8; 32]>::from(hasher.finalize()))
    }

    /// Target-asset introspection: which tokens the order applies to.
    #[must_use]
    pub const fn info(&self) -> &TargetSpec {
        &self.target
    }

    /// Build the counterpart order a taker submits to match this one.
    #[must_use]
    pub fn build_matching(&self, taker: Address) -> Self {
        Self {
            maker: taker,
            taker: self.maker,
            side: match self.side {
                Side::Buy => Side::Sell,
                Side::Sell => Side::Buy,
            },
            fee_recipient: Address::zero(),
            salt: U256::zero(),
            ..*self
        }
    }

    fn domain_hash(&self) -> H256 {
        let version = match self.kind {
            OrderKind::WyvernV2 => *VERSION_V2_HASH,
            OrderKind::WyvernV23 => *VERSION_V23_HASH,
        };
        let mut hasher = Keccak256::new();
        hasher.update(*DOMAIN_SEPARATOR_TYPE_HASH);
        hasher.update(*NAME_HASH);
        hasher.update(version);
        hasher.update(BigEndian::from(&U256::from(self.chain_id)));
        hasher.update(H256::from(self.exchange));
        H256::from(<[u8; 32]>::from(hasher.finalize()))
    }

    fn struct_hash(&self) -> H256 {
        let type_hash = match self.kind {
            OrderKind::WyvernV2 => *TYPE_HASH_V2,
            OrderKind::WyvernV23 => *TYPE_HASH_V23,
        };
        let mut hasher = Keccak256::new();
        hasher.update(type_hash);
        hasher.update(H256::from(self.exchange));
        hasher.update(H256::from(self.maker));
        hasher.update(H256::from(self.taker));
        hasher.update(BigEndian::from(&self.maker_relayer_fee));
        hasher.update(BigEndian::from(&self.taker_relayer_fee));
        hasher.update(H256::from(self.fee_recipient));
        hasher.update(BigEndian::from(&U256::from(u8::from(self.side))));
        hasher.update(H256::from(self.target.contract()));
        hasher.update(self.target.data_hash());
        hasher.update(H256::from(self.payment_token));
        hasher.update(BigEndian::from(&self.base_price));
        hasher.update(BigEndian::from(&U256::from(self.listing_time)));
        hasher.update(BigEndian::from(&U256::from(self.expiration_time)));
        hasher.update(BigEndian::from(&self.salt));
        if self.kind == OrderKind::WyvernV23 {
            hasher.update(BigEndian::from(&self.nonce.unwrap_or_default()));
        }
        H256::from(<[u8; 32]>::from(hasher.finalize()))
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;
    use serde_json::{from_value, json, to_value};

    use super::*;

    pub fn example_order() -> OrderParams {
        from_value(json!({
            "kind": "wyvern-v2.3",
            "exchange": "0x7f268357a8c2552623316e2562d90e642bb538e5",
            "maker": "0x56eb0ad2dc746540fab5c02478b31e2aa9ddc38c",
            "taker": "0x0000000000000000000000000000000000000000",
            "makerRelayerFee": "250",
            "takerRelayerFee": "0",
            "feeRecipient": "0x5b3256965e7c3cf26e11fcaf296dfc8807c01073",
            "side": 1,
            "paymentToken": "0x0000000000000000000000000000000000000000",
            "basePrice": "1000000000000000000",
            "listingTime": "1626321213",
            "expirationTime": "1629321213",
            "salt": "2752094376750492926844965905320507011598275560670346196138937898764",
            "nonce": "0",
            "chainId": "1",
            "target": {
                "type": "single-token",
                "contract": "0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d",
                "tokenId": "7870"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_json_roundtrip() {
        let order = example_order();
        let value = to_value(&order).unwrap();
        assert_eq!(from_value::<OrderParams>(value).unwrap(), order);
    }

    #[test]
    fn test_hash_is_stable() {
        let order = example_order();
        assert_eq!(order.hash(), example_order().hash());
        assert_ne!(order.hash(), order.prefix_hash());
    }

    #[test]
    fn test_hash_covers_nonce() {
        let order = example_order();
        let bumped = OrderParams {
            nonce: Some(U256::from(5)),
            ..order
        };
        assert_ne!(order.hash(), bumped.hash());
    }

    #[test]
    fn test_hash_covers_target() {
        let order = example_order();
        let other = OrderParams {
            target: TargetSpec::ContractWide {
                contract: order.target.contract(),
            },
            ..order
        };
        assert_ne!(order.hash(), other.hash());
    }

    #[test]
    fn test_protocol_versions_hash_differently() {
        let order = OrderParams {
            kind: OrderKind::WyvernV2,
            nonce: None,
            ..example_order()
        };
        assert_ne!(order.hash(), example_order().hash());
    }

    #[test]
    fn test_build_matching_flips_side() {
        let order = example_order();
        let taker: Address = "0x8d5e5b5b5d187bdce2e0143eb6b3cc44eef3c0cb".parse().unwrap();
        let matching = order.build_matching(taker);
        assert_eq!(matching.side, Side::Buy);
        assert_eq!(matching.maker, taker);
        assert_eq!(matching.taker, order.maker);
        assert_eq!(matching.base_price, order.base_price);
    }

    #[test]
    fn test_validate_rejects_missing_nonce() {
        let order = OrderParams {
            nonce: None,
            ..example_order()
        };
        assert_eq!(order.validate(), Err(Error::MissingNonce));
    }

    #[test]
    fn test_side_codes() {
        assert_eq!(u8::from(Side::Buy), 0);
        assert_eq!(u8::from(Side::Sell), 1);
        assert!(Side::try_from(2).is_err());
    }
}

#[cfg(feature = "bench")]
pub mod bench {
    use criterion::{black_box, Criterion};
    use serde_json::{from_value, json};

    #[allow(clippy::wildcard_imports)]
    use super::*;

    pub fn group(criterion: &mut Criterion) {
        bench_hash(criterion);
    }

    fn example_order() -> OrderParams {
        from_value(json!({
            "kind": "wyvern-v2.3",
            "exchange": "0x7f268357a8c2552623316e2562d90e642bb538e5",
            "maker": "0x56eb0ad2dc746540fab5c02478b31e2aa9ddc38c",
            "taker": "0x0000000000000000000000000000000000000000",
            "makerRelayerFee": "250",
            "takerRelayerFee": "0",
            "feeRecipient": "0x5b3256965e7c3cf26e11fcaf296dfc8807c01073",
            "side": 1,
            "paymentToken": "0x0000000000000000000000000000000000000000",
            "basePrice": "1000000000000000000",
            "listingTime": "1626321213",
            "expirationTime": "1629321213",
            "salt": "123456789",
            "nonce": "0",
            "chainId": "1",
            "target": {
                "type": "single-token",
                "contract": "0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d",
                "tokenId": "7870"
            }
        }))
        .unwrap()
    }

    fn bench_hash(criterion: &mut Criterion) {
        let order = example_order();
        criterion.bench_function("wyvern_order_hash", move |bencher| {
            bencher.iter(|| black_box(black_box(&order).hash()));
        });
    }
}
