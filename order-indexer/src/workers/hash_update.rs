//! Authoritative single-order status re-derivation.
//!
//! Recomputes one order's fillability, approval, value, remaining
//! quantity and effective expiration from the current projections and
//! event tables, and writes the result only when something changed.

use core::convert::TryFrom;

use anyhow::{anyhow, Context as _, Result as AnyResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use serde::{Deserialize, Serialize};
use tracing::trace;
use web3::types::U256;
use wyvern::{OrderKind, OrderParams, Side};

use crate::{
    db::{Database, OrderRow},
    orders::{order_value, ApprovalStatus, FillabilityStatus, KindPolicy as _},
    queue::{Job, JobHandler},
    utils::{parse_u256, unix_now},
};

static OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "hash_update_outcomes",
        "Hash update results by derived fillability.",
        &["status"]
    )
    .unwrap()
});

/// What prompted the re-derivation. Purely informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    NewOrder,
    Cancel,
    BulkCancel,
    Fill,
    BalanceChange,
    ApprovalChange,
    Revert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashUpdateJob {
    pub context: String,
    pub hash:    String,
    pub trigger: Trigger,
}

impl Job for HashUpdateJob {
    const QUEUE: &'static str = "hash-update";

    fn context(&self) -> String {
        self.context.clone()
    }
}

pub struct HashUpdateHandler {
    db: Database,
}

impl HashUpdateHandler {
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    async fn derive(&self, row: &OrderRow, now: i64) -> AnyResult<Derived> {
        let params: OrderParams = serde_json::from_str(&row.raw_data)
            .with_context(|| format!("undecodable raw order data for {}", row.hash))?;
        let kind = params.kind;

        // Fills are final for Wyvern orders: any match consumes the
        // full remaining quantity.
        let fills = self.db.fill_count(row.hash.clone()).await?;
        let quantity_remaining = if fills > 0 { U256::zero() } else { U256::one() };

        let cancelled = self.db.is_cancelled(row.hash.clone()).await?
            || self.bulk_cancelled(&params, row).await?;

        let fillability;
        let mut approval = row
            .approval_status
            .parse::<ApprovalStatus>()
            .unwrap_or(ApprovalStatus::NoApproval);
        if cancelled {
            fillability = FillabilityStatus::Cancelled;
        } else if quantity_remaining.is_zero() {
            fillability = FillabilityStatus::Filled;
        } else if params.expiration_time != 0 && i64::try_from(params.expiration_time)? <= now {
            fillability = FillabilityStatus::Expired;
        } else {
            let (funded, approved) = self.funding(&params, row, quantity_remaining).await?;
            approval = if approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::NoApproval
            };
            let mut derived = if funded {
                FillabilityStatus::Fillable
            } else {
                FillabilityStatus::NoBalance
            };
            if derived == FillabilityStatus::NoBalance || approval == ApprovalStatus::NoApproval {
                derived = kind.on_downgrade(derived);
            }
            fillability = derived;
        }

        #[allow(clippy::cast_possible_wrap)]
        let expiration = match fillability {
            FillabilityStatus::Fillable => params.expiration_time as i64,
            _ if row.fillability_status == fillability.as_str() => row.expiration,
            _ => now,
        };

        Ok(Derived {
            fillability,
            approval,
            value: order_value(&params).to_string(),
            quantity_remaining: quantity_remaining.to_string(),
            expiration,
        })
    }

    /// A v2.3 order is dead once its maker bumped the nonce past it.
    async fn bulk_cancelled(&self, params: &OrderParams, row: &OrderRow) -> AnyResult<bool> {
        if params.kind != OrderKind::WyvernV23 {
            return Ok(false);
        }
        let nonce = match &row.nonce {
            Some(nonce) => parse_u256(nonce)?,
            None => return Ok(false),
        };
        let threshold = self.db.max_bulk_min_nonce(row.maker.clone()).await?;
        match threshold {
            Some(threshold) => Ok(nonce < parse_u256(&threshold)?),
            None => Ok(false),
        }
    }

    /// Balance and approval truth for a live order, from projections.
    async fn funding(
        &self,
        params: &OrderParams,
        row: &OrderRow,
        quantity_remaining: U256,
    ) -> AnyResult<(bool, bool)> {
        let contract = format!("{:?}", params.target.contract());
        match params.side {
            Side::Sell => {
                let token_id = params
                    .target
                    .token_id()
                    .ok_or_else(|| anyhow!("sell order {} names no token", row.hash))?;
                let balance = self
                    .db
                    .nft_balance(contract.clone(), token_id.to_string(), row.maker.clone())
                    .await?;
                let funded = parse_signed_amount(&balance)
                    .map_or(false, |amount| amount >= quantity_remaining);
                let approved = match &row.conduit {
                    Some(conduit) => {
                        self.db
                            .latest_nft_approval(contract, row.maker.clone(), conduit.clone())
                            .await?
                    }
                    None => false,
                };
                Ok((funded, approved))
            }
            Side::Buy => {
                let balance = self
                    .db
                    .ft_balance(row.payment_token.clone(), row.maker.clone())
                    .await?;
                let funded = parse_signed_amount(&balance)
                    .map_or(false, |amount| amount >= params.base_price);
                let required = params.base_price.saturating_sub(order_value(params));
                let approved = match &row.conduit {
                    Some(conduit) => {
                        let allowance = self
                            .db
                            .ft_allowance(
                                row.payment_token.clone(),
                                row.maker.clone(),
                                conduit.clone(),
                            )
                            .await?;
                        parse_signed_amount(&allowance)
                            .map_or(false, |amount| amount >= required)
                    }
                    None => false,
                };
                Ok((funded, approved))
            }
        }
    }
}

struct Derived {
    fillability:        FillabilityStatus,
    approval:           ApprovalStatus,
    value:              String,
    quantity_remaining: String,
    expiration:         i64,
}

/// Balance projections fold signed deltas, so a partially-observed
/// history can read negative. Treat those as zero.
fn parse_signed_amount(amount: &str) -> Option<U256> {
    if amount.starts_with('-') {
        Some(U256::zero())
    } else {
        parse_u256(amount).ok()
    }
}

#[async_trait]
impl JobHandler<HashUpdateJob> for HashUpdateHandler {
    async fn process(&self, job: HashUpdateJob) -> AnyResult<()> {
        let row = match self.db.get_order(job.hash.clone()).await? {
            Some(row) => row,
            // Events may reference orders never submitted to us.
            None => return Ok(()),
        };
        let now = unix_now();
        let derived = self.derive(&row, now).await?;
        OUTCOMES
            .with_label_values(&[derived.fillability.as_str()])
            .inc();
        let changed = self
            .db
            .update_order_status(
                row.hash.clone(),
                derived.fillability.as_str().to_owned(),
                derived.approval.as_str().to_owned(),
                derived.value,
                derived.quantity_remaining,
                derived.expiration,
            )
            .await?;
        trace!(
            hash = %row.hash,
            trigger = ?job.trigger,
            status = derived.fillability.as_str(),
            changed,
            "Re-derived order status"
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_job_context_is_the_id() {
        let job = HashUpdateJob {
            context: "0xtx-3-0xhash".to_owned(),
            hash:    "0xhash".to_owned(),
            trigger: Trigger::Cancel,
        };
        assert_eq!(job.context(), "0xtx-3-0xhash");
    }

    #[test]
    fn test_trigger_wire_format() {
        let json = serde_json::to_string(&Trigger::BalanceChange).unwrap();
        assert_eq!(json, "\"balance-change\"");
    }

    #[test]
    fn test_negative_amounts_read_as_zero() {
        assert_eq!(parse_signed_amount("-5"), Some(U256::zero()));
        assert_eq!(parse_signed_amount("5"), Some(U256::from(5)));
    }
}
