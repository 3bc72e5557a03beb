//! Order domain types: derived lifecycle statuses, per-kind marketplace
//! policy and fee/value arithmetic.

mod filter;
mod save;

use core::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use web3::types::{Address, U256};
use wyvern::{OrderKind, OrderParams, Side, SignedOrder};

pub use self::{
    filter::{filter, FilterOutcome},
    save::{save, Error as SaveError, SavedOrder},
};

/// Fee recipient identifying OpenSea-attributed orders.
pub static OPENSEA_FEE_RECIPIENT: Lazy<Address> = Lazy::new(|| {
    "0x5b3256965e7c3cf26e11fcaf296dfc8807c01073"
        .parse()
        .unwrap()
});

/// Fixed marketplace share attributed to OpenSea orders, in basis points.
pub const OPENSEA_SOURCE_BPS: u64 = 250;

pub const MAX_FEE_BPS: u64 = 10_000;

/// Derived order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillabilityStatus {
    Fillable,
    NoBalance,
    Cancelled,
    Filled,
    Expired,
}

impl FillabilityStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fillable => "fillable",
            Self::NoBalance => "no-balance",
            Self::Cancelled => "cancelled",
            Self::Filled => "filled",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for FillabilityStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fillable" => Ok(Self::Fillable),
            "no-balance" => Ok(Self::NoBalance),
            "cancelled" => Ok(Self::Cancelled),
            "filled" => Ok(Self::Filled),
            "expired" => Ok(Self::Expired),
            _ => Err(anyhow::anyhow!("unknown fillability status {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalStatus {
    Approved,
    NoApproval,
}

impl ApprovalStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::NoApproval => "no-approval",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Self::Approved),
            "no-approval" => Ok(Self::NoApproval),
            _ => Err(anyhow::anyhow!("unknown approval status {:?}", s)),
        }
    }
}

/// Marketplace quirks expressed per order kind instead of branches in the
/// workers. Escrowed kinds hold the token on the exchange, so balance
/// checks do not apply; some marketplaces invalidate off-chain when a
/// maker loses balance or approval.
pub trait KindPolicy {
    fn is_escrowed(self) -> bool;
    fn on_downgrade(self, next: FillabilityStatus) -> FillabilityStatus;
}

impl KindPolicy for OrderKind {
    fn is_escrowed(self) -> bool {
        match self {
            Self::WyvernV2 | Self::WyvernV23 => false,
        }
    }

    fn on_downgrade(self, next: FillabilityStatus) -> FillabilityStatus {
        match self {
            Self::WyvernV2 | Self::WyvernV23 => next,
        }
    }
}

/// Kinds whose balance is held by the maker, quoted for SQL `IN` lists.
#[must_use]
pub fn non_escrowed_kinds_sql() -> String {
    OrderKind::ALL
        .iter()
        .filter(|kind| !kind.is_escrowed())
        .map(|kind| format!("'{}'", kind.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQL expression mapping a balance/approval downgrade to its final
/// status per order kind.
#[must_use]
pub fn downgrade_case_sql(column: &str) -> String {
    let arms: String = OrderKind::ALL
        .iter()
        .filter(|kind| kind.on_downgrade(FillabilityStatus::NoBalance) != FillabilityStatus::NoBalance)
        .map(|kind| {
            format!(
                " WHEN {} = '{}' THEN '{}'",
                column,
                kind.as_str(),
                kind.on_downgrade(FillabilityStatus::NoBalance).as_str()
            )
        })
        .collect();
    if arms.is_empty() {
        "'no-balance'".to_owned()
    } else {
        format!("CASE{} ELSE 'no-balance' END", arms)
    }
}

/// A candidate submission: a signed order plus the optional attribute
/// descriptor (token-list orders) and marketplace attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateOrder {
    #[serde(flatten)]
    pub order:     SignedOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<AttributeDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source:    Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDescriptor {
    pub collection: String,
    pub key:        String,
    pub value:      String,
}

/// Terminal, never-retried reasons a candidate is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("Order has an invalid signature")]
    InvalidSignature,
    #[error("Order has invalid parameters")]
    InvalidParams,
    #[error("Order kind is not supported")]
    UnknownKind,
    #[error("Order has an invalid listing or expiration time")]
    InvalidTiming,
    #[error("Order side does not match its assets")]
    InvalidSide,
    #[error("Order is not paying in a known fungible token")]
    UnsupportedPaymentToken,
    #[error("Order fees are out of range")]
    InvalidFees,
    #[error("Order targets an unindexed contract")]
    UnknownContract,
    #[error("Order has no matching token set")]
    NoMatchingTokenSet,
}

/// Marketplace attribution of an order's fees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeAttribution {
    pub fee_bps:    u64,
    pub source_id:  Address,
    pub source_bps: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Royalty {
    pub recipient: Address,
    pub bps:       u64,
}

/// Total fee is the larger relayer fee; OpenSea orders carry a fixed
/// marketplace share, everything else goes to the submitted source.
#[must_use]
pub fn attribute_fees(params: &OrderParams, source: Option<Address>) -> FeeAttribution {
    let fee_bps = params
        .maker_relayer_fee
        .max(params.taker_relayer_fee)
        .low_u64();
    if params.fee_recipient == *OPENSEA_FEE_RECIPIENT {
        FeeAttribution {
            fee_bps,
            source_id: *OPENSEA_FEE_RECIPIENT,
            source_bps: OPENSEA_SOURCE_BPS,
        }
    } else {
        FeeAttribution {
            fee_bps,
            source_id: source.unwrap_or_else(Address::zero),
            source_bps: fee_bps,
        }
    }
}

/// Price net of fees: buys yield `price - price * takerRelayerFee /
/// 10000` (truncated), sells yield the price itself.
#[must_use]
pub fn order_value(params: &OrderParams) -> U256 {
    match params.side {
        Side::Sell => params.base_price,
        Side::Buy => {
            // Intake bounds the fee at 10_000 bps, so the product cannot
            // overflow for any order that reached the database.
            let fee = params.base_price * params.taker_relayer_fee / U256::from(MAX_FEE_BPS);
            params.base_price.saturating_sub(fee)
        }
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::{from_value, json};
    use wyvern::TargetSpec;

    use super::*;

    pub fn example_params() -> OrderParams {
        from_value(json!({
            "kind": "wyvern-v2.3",
            "exchange": "0x7f268357a8c2552623316e2562d90e642bb538e5",
            "maker": "0x56eb0ad2dc746540fab5c02478b31e2aa9ddc38c",
            "taker": "0x0000000000000000000000000000000000000000",
            "makerRelayerFee": "500",
            "takerRelayerFee": "0",
            "feeRecipient": "0x5b3256965e7c3cf26e11fcaf296dfc8807c01073",
            "side": 1,
            "paymentToken": "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2",
            "basePrice": "1000000000000000000",
            "listingTime": "1626321213",
            "expirationTime": "1629321213",
            "salt": "123456789",
            "nonce": "3",
            "chainId": "1",
            "target": {
                "type": "single-token",
                "contract": "0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d",
                "tokenId": "7"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_opensea_attribution_is_fixed() {
        let params = OrderParams {
            maker_relayer_fee: 500.into(),
            taker_relayer_fee: 500.into(),
            ..example_params()
        };
        let fees = attribute_fees(&params, None);
        assert_eq!(fees.fee_bps, 500);
        assert_eq!(fees.source_id, *OPENSEA_FEE_RECIPIENT);
        assert_eq!(fees.source_bps, 250);
    }

    #[test]
    fn test_opensea_share_is_fixed_even_below_250_bps() {
        let params = OrderParams {
            maker_relayer_fee: 100.into(),
            taker_relayer_fee: 0.into(),
            ..example_params()
        };
        let fees = attribute_fees(&params, None);
        assert_eq!(fees.fee_bps, 100);
        assert_eq!(fees.source_bps, OPENSEA_SOURCE_BPS);
    }

    #[test]
    fn test_foreign_attribution_takes_max_fee() {
        let source: Address = "0x615312fb74c31303eab07dea520019bb23f4c6c2".parse().unwrap();
        let params = OrderParams {
            fee_recipient: "0xcc3c7ea403427154ec908203ba6c418bd699f7ce".parse().unwrap(),
            maker_relayer_fee: 100.into(),
            taker_relayer_fee: 300.into(),
            ..example_params()
        };
        let fees = attribute_fees(&params, Some(source));
        assert_eq!(fees.fee_bps, 300);
        assert_eq!(fees.source_id, source);
        assert_eq!(fees.source_bps, 300);
    }

    #[test]
    fn test_missing_source_falls_back_to_zero_address() {
        let params = OrderParams {
            fee_recipient: "0xcc3c7ea403427154ec908203ba6c418bd699f7ce".parse().unwrap(),
            ..example_params()
        };
        assert_eq!(attribute_fees(&params, None).source_id, Address::zero());
    }

    #[test]
    fn test_sell_value_is_price() {
        let params = example_params();
        assert_eq!(order_value(&params), params.base_price);
    }

    #[test]
    fn test_buy_value_nets_taker_fee() {
        let params = OrderParams {
            side: Side::Buy,
            taker_relayer_fee: 500.into(),
            target: TargetSpec::ContractWide {
                contract: example_params().target.contract(),
            },
            ..example_params()
        };
        // 1e18 - 1e18 * 500 / 10000
        assert_eq!(
            order_value(&params),
            U256::from_dec_str("950000000000000000").unwrap()
        );
    }

    #[test]
    fn test_downgrade_case_defaults_to_no_balance() {
        assert_eq!(downgrade_case_sql("o.kind"), "'no-balance'");
    }

    #[test]
    fn test_non_escrowed_kinds_cover_both_protocols() {
        assert_eq!(non_escrowed_kinds_sql(), "'wyvern-v2', 'wyvern-v2.3'");
    }

    proptest! {
        #[test]
        fn test_buy_value_truncates(price in 1_u64..u64::MAX, fee in 0_u64..=10_000) {
            let params = OrderParams {
                side: Side::Buy,
                base_price: price.into(),
                taker_relayer_fee: fee.into(),
                ..example_params()
            };
            let expected = U256::from(price) - U256::from(price) * U256::from(fee) / U256::from(10_000_u64);
            prop_assert_eq!(order_value(&params), expected);
        }
    }
}
