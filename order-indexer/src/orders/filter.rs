//! Order intake, first stage: cheap validity checks that never touch the
//! chain. Anything that fails here is terminal and reported back with a
//! reason; it is never retried.

use anyhow::Result as AnyResult;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use tracing::debug;
use web3::types::Address;
use wyvern::{ChainInfo, OrderKind, Side};

use super::{CandidateOrder, RejectReason, MAX_FEE_BPS};
use crate::{db::Database, utils::unix_now};

/// Allowed clock skew on listing times.
const LISTING_TIME_SKEW: i64 = 5 * 60;

static VERDICTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "intake_filter_verdicts",
        "Order intake filter verdicts.",
        &["verdict"]
    )
    .unwrap()
});

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub valid:   Vec<CandidateOrder>,
    pub invalid: Vec<(CandidateOrder, RejectReason)>,
}

/// Split candidates into those worth saving and those refused outright.
pub async fn filter(
    db: &Database,
    chain: &ChainInfo,
    candidates: Vec<CandidateOrder>,
) -> AnyResult<FilterOutcome> {
    let mut outcome = FilterOutcome::default();
    let now = unix_now();
    for candidate in candidates {
        match check(db, chain, &candidate, now).await? {
            Ok(()) => {
                VERDICTS.with_label_values(&["valid"]).inc();
                outcome.valid.push(candidate);
            }
            Err(reason) => {
                VERDICTS.with_label_values(&["invalid"]).inc();
                debug!(hash = ?candidate.order.hash(), %reason, "Refusing order");
                outcome.invalid.push((candidate, reason));
            }
        }
    }
    Ok(outcome)
}

/// The outer error is transient (database trouble); the inner verdict is
/// terminal.
async fn check(
    db: &Database,
    chain: &ChainInfo,
    candidate: &CandidateOrder,
    now: i64,
) -> AnyResult<Result<(), RejectReason>> {
    let params = &candidate.order.order;

    if let Err(error) = candidate.order.verify() {
        return Ok(Err(match error {
            wyvern::Error::InvalidSignature => RejectReason::InvalidSignature,
            _ => RejectReason::InvalidParams,
        }));
    }

    if params.exchange != chain.exchange(params.kind == OrderKind::WyvernV23) {
        return Ok(Err(RejectReason::InvalidParams));
    }

    #[allow(clippy::cast_possible_wrap)]
    {
        if params.listing_time as i64 > now + LISTING_TIME_SKEW {
            return Ok(Err(RejectReason::InvalidTiming));
        }
        if params.expiration_time != 0 && params.expiration_time as i64 <= now {
            return Ok(Err(RejectReason::InvalidTiming));
        }
    }

    match params.side {
        // Buy orders escrow nothing, so they must pay in a fungible token
        // the indexer tracks.
        Side::Buy => {
            if params.payment_token != chain.weth {
                return Ok(Err(RejectReason::UnsupportedPaymentToken));
            }
        }
        // Sell orders move a concrete token through the maker's proxy.
        Side::Sell => {
            if params.target.token_id().is_none() {
                return Ok(Err(RejectReason::InvalidSide));
            }
            if params.payment_token != Address::zero() && params.payment_token != chain.weth {
                return Ok(Err(RejectReason::UnsupportedPaymentToken));
            }
        }
    }

    let fee_bps = params
        .maker_relayer_fee
        .max(params.taker_relayer_fee)
        .low_u64();
    if params.maker_relayer_fee.bits() > 64
        || params.taker_relayer_fee.bits() > 64
        || fee_bps > MAX_FEE_BPS
    {
        return Ok(Err(RejectReason::InvalidFees));
    }

    let target = format!("{:?}", params.target.contract());
    if db.contract_kind(target).await?.is_none() {
        return Ok(Err(RejectReason::UnknownContract));
    }

    Ok(Ok(()))
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::orders::test::example_params;
    use wyvern::{OrderParams, SignedOrder, Signature};

    fn candidate(params: OrderParams) -> CandidateOrder {
        CandidateOrder {
            order:     SignedOrder {
                order:     params,
                signature: Signature::default(),
            },
            attribute: None,
            source:    None,
        }
    }

    #[test]
    fn test_listing_time_skew_is_minutes() {
        assert_eq!(LISTING_TIME_SKEW, 300);
    }

    #[test]
    fn test_default_signature_is_refused() {
        // A zeroed signature cannot recover to the maker.
        let candidate = candidate(example_params());
        assert!(candidate.order.verify().is_err());
    }
}
