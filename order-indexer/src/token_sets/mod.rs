//! Token sets: the sets of tokens an order may be filled against.
//!
//! Canonical ids are deterministic so that two orders with identical
//! selectors share a set: `token:{contract}:{tokenId}`,
//! `range:{contract}:{lo}:{hi}`, `contract:{contract}` and
//! `list:{merkleRoot}`.

pub mod merkle;

use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use web3::types::{Address, H256, U256};
use wyvern::TargetSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSet {
    Token {
        contract: Address,
        token_id: U256,
    },
    Range {
        contract:       Address,
        start_token_id: U256,
        end_token_id:   U256,
    },
    Contract {
        contract: Address,
    },
    List {
        merkle_root: H256,
    },
}

impl From<&TargetSpec> for TokenSet {
    fn from(target: &TargetSpec) -> Self {
        match *target {
            TargetSpec::SingleToken { contract, token_id }
            | TargetSpec::SingleTokenV2 { contract, token_id } => {
                Self::Token { contract, token_id }
            }
            TargetSpec::TokenRange {
                contract,
                start_token_id,
                end_token_id,
            } => Self::Range {
                contract,
                start_token_id,
                end_token_id,
            },
            TargetSpec::ContractWide { contract } => Self::Contract { contract },
            TargetSpec::TokenList { merkle_root, .. } => Self::List { merkle_root },
        }
    }
}

impl TokenSet {
    /// Canonical id. A pure function of the selector.
    #[must_use]
    pub fn id(&self) -> String {
        match self {
            Self::Token { contract, token_id } => format!("token:{:?}:{}", contract, token_id),
            Self::Range {
                contract,
                start_token_id,
                end_token_id,
            } => format!("range:{:?}:{}:{}", contract, start_token_id, end_token_id),
            Self::Contract { contract } => format!("contract:{:?}", contract),
            Self::List { merkle_root } => format!("list:{:?}", merkle_root),
        }
    }

    /// JSON label describing the set's kind and data.
    #[must_use]
    pub fn label(&self) -> JsonValue {
        match self {
            Self::Token { contract, token_id } => json!({
                "kind": "token",
                "data": { "contract": contract, "tokenId": token_id.to_string() },
            }),
            Self::Range {
                contract,
                start_token_id,
                end_token_id,
            } => json!({
                "kind": "collection-range",
                "data": {
                    "contract": contract,
                    "startTokenId": start_token_id.to_string(),
                    "endTokenId": end_token_id.to_string(),
                },
            }),
            Self::Contract { contract } => json!({
                "kind": "collection-contract",
                "data": { "contract": contract },
            }),
            Self::List { merkle_root } => json!({
                "kind": "attribute",
                "data": { "merkleRoot": merkle_root },
            }),
        }
    }

    /// Sha-256 over the stable-stringified label. Zero for the three
    /// non-list kinds.
    #[must_use]
    pub fn label_hash(&self) -> H256 {
        match self {
            Self::List { .. } => {
                let label = serde_json::to_string(&self.label()).unwrap_or_default();
                let mut hasher = Sha256::new();
                hasher.update(label.as_bytes());
                H256::from_slice(&hasher.finalize())
            }
            _ => H256::zero(),
        }
    }

    #[must_use]
    pub const fn merkle_root(&self) -> Option<H256> {
        match self {
            Self::List { merkle_root } => Some(*merkle_root),
            _ => None,
        }
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn contract() -> Address {
        "0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d".parse().unwrap()
    }

    #[test]
    fn test_token_id_format() {
        let set = TokenSet::Token {
            contract: contract(),
            token_id: U256::from(7870),
        };
        assert_eq!(
            set.id(),
            "token:0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d:7870"
        );
        assert_eq!(set.label_hash(), H256::zero());
    }

    #[test]
    fn test_range_id_format() {
        let set = TokenSet::Range {
            contract:       contract(),
            start_token_id: U256::from(100),
            end_token_id:   U256::from(200),
        };
        assert_eq!(
            set.id(),
            "range:0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d:100:200"
        );
    }

    #[test]
    fn test_id_is_deterministic() {
        let target = TargetSpec::ContractWide {
            contract: contract(),
        };
        assert_eq!(TokenSet::from(&target).id(), TokenSet::from(&target).id());
        assert_eq!(
            TokenSet::from(&target).id(),
            "contract:0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d"
        );
    }

    #[test]
    fn test_single_token_variants_share_a_set() {
        let v1 = TargetSpec::SingleToken {
            contract: contract(),
            token_id: U256::from(1),
        };
        let v2 = TargetSpec::SingleTokenV2 {
            contract: contract(),
            token_id: U256::from(1),
        };
        assert_eq!(TokenSet::from(&v1), TokenSet::from(&v2));
    }

    #[test]
    fn test_list_label_hash_is_stable() {
        let set = TokenSet::List {
            merkle_root: H256::repeat_byte(0x11),
        };
        assert_ne!(set.label_hash(), H256::zero());
        assert_eq!(set.label_hash(), set.label_hash());
    }
}
