//! Bulk re-derivation of a maker's orders after a balance or approval
//! change. Each variant is one SQL statement over the affected orders;
//! every touched order is chased with a hash-update so per-order derived
//! fields are recomputed exactly once per trigger.

use std::sync::Arc;

use anyhow::{Context as _, Result as AnyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wyvern::Contracts;

use super::{hash_update::Trigger, Queues};
use crate::{
    db::Database,
    queue::{Job, JobHandler},
    utils::{parse_address, unix_now},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MakerUpdateJob {
    /// An ERC20 balance of the maker changed.
    BuyBalance {
        context:  String,
        maker:    String,
        contract: String,
    },
    /// An ERC20 allowance may have changed. With an operator this
    /// rechecks orders routed through that conduit (re-reading the
    /// on-chain allowance first when `refresh` is set, since transfers
    /// do not emit `Approval`); with an order kind it fans out one job
    /// per distinct conduit of the maker's open orders of that kind.
    BuyApproval {
        context:    String,
        maker:      String,
        contract:   String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator:   Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_kind: Option<String>,
        #[serde(default)]
        refresh:    bool,
    },
    /// An NFT moved in or out of the maker's wallet.
    SellBalance {
        context:  String,
        maker:    String,
        contract: String,
        token_id: String,
    },
    /// The maker granted or revoked an operator approval.
    SellApproval {
        context:  String,
        maker:    String,
        contract: String,
        operator: String,
    },
}

impl Job for MakerUpdateJob {
    const QUEUE: &'static str = "maker-update";

    fn context(&self) -> String {
        match self {
            Self::BuyBalance { context, .. }
            | Self::BuyApproval { context, .. }
            | Self::SellBalance { context, .. }
            | Self::SellApproval { context, .. } => context.clone(),
        }
    }
}

pub struct MakerUpdateHandler {
    db:        Database,
    contracts: Contracts,
    queues:    Arc<Queues>,
}

impl MakerUpdateHandler {
    #[must_use]
    pub fn new(db: Database, contracts: Contracts, queues: Arc<Queues>) -> Self {
        Self {
            db,
            contracts,
            queues,
        }
    }

    /// Re-read the on-chain allowance; ERC20 `Transfer` does not emit an
    /// `Approval` event, so the projection has to be refreshed directly.
    async fn fetch_and_update_ft_approval(
        &self,
        contract: &str,
        maker: &str,
        operator: &str,
    ) -> AnyResult<()> {
        let allowance = self
            .contracts
            .ft_allowance(
                parse_address(contract)?,
                parse_address(maker)?,
                parse_address(operator)?,
            )
            .await
            .context("error fetching on-chain allowance")?;
        self.db
            .update_ft_approval(
                contract.to_owned(),
                maker.to_owned(),
                operator.to_owned(),
                allowance.to_string(),
            )
            .await
    }
}

#[async_trait]
impl JobHandler<MakerUpdateJob> for MakerUpdateHandler {
    async fn process(&self, job: MakerUpdateJob) -> AnyResult<()> {
        let context = job.context();
        let now = unix_now();
        let (touched, trigger) = match job {
            MakerUpdateJob::SellBalance {
                maker,
                contract,
                token_id,
                ..
            } => (
                self.db
                    .recheck_sell_balance(maker, contract, token_id, now)
                    .await?,
                Trigger::BalanceChange,
            ),
            MakerUpdateJob::SellApproval {
                maker,
                contract,
                operator,
                ..
            } => (
                self.db
                    .recheck_sell_approval(maker, contract, operator)
                    .await?,
                Trigger::ApprovalChange,
            ),
            MakerUpdateJob::BuyBalance {
                maker, contract, ..
            } => (
                self.db.recheck_buy_balance(maker, contract, now).await?,
                Trigger::BalanceChange,
            ),
            MakerUpdateJob::BuyApproval {
                maker,
                contract,
                operator: Some(operator),
                refresh,
                ..
            } => {
                if refresh {
                    self.fetch_and_update_ft_approval(&contract, &maker, &operator)
                        .await?;
                }
                (
                    self.db
                        .recheck_buy_approval(maker, contract, operator)
                        .await?,
                    Trigger::ApprovalChange,
                )
            }
            MakerUpdateJob::BuyApproval {
                maker,
                contract,
                operator: None,
                order_kind: Some(order_kind),
                ..
            } => {
                // Transfer-induced: the conduit is per order kind, so fan
                // out one recheck per distinct conduit in use.
                let conduits = self
                    .db
                    .distinct_buy_conduits(maker.clone(), order_kind)
                    .await?;
                for conduit in conduits {
                    self.queues
                        .maker_update
                        .enqueue(&MakerUpdateJob::BuyApproval {
                            context:    format!("{}-{}", context, conduit),
                            maker:      maker.clone(),
                            contract:   contract.clone(),
                            operator:   Some(conduit),
                            order_kind: None,
                            refresh:    true,
                        })
                        .await?;
                }
                (Vec::new(), Trigger::ApprovalChange)
            }
            MakerUpdateJob::BuyApproval { .. } => {
                warn!(context = %context, "Buy-approval job without operator or kind");
                (Vec::new(), Trigger::ApprovalChange)
            }
        };

        if !touched.is_empty() {
            debug!(context = %context, touched = touched.len(), "Maker update touched orders");
        }
        for hash in touched {
            self.queues
                .hash_update
                .enqueue(&super::hash_update::HashUpdateJob {
                    context: format!("{}-{}", context, hash),
                    hash,
                    trigger,
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;
    use serde_json::{from_value, json, to_value};

    use super::*;

    #[test]
    fn test_job_wire_format() {
        let job = MakerUpdateJob::SellBalance {
            context:  "0xtx-2-0xm-7".to_owned(),
            maker:    "0xm".to_owned(),
            contract: "0xc".to_owned(),
            token_id: "7".to_owned(),
        };
        assert_eq!(
            to_value(&job).unwrap(),
            json!({
                "kind": "sell-balance",
                "context": "0xtx-2-0xm-7",
                "maker": "0xm",
                "contract": "0xc",
                "token_id": "7"
            })
        );
    }

    #[test]
    fn test_optional_fields_default() {
        let job: MakerUpdateJob = from_value(json!({
            "kind": "buy-approval",
            "context": "ctx",
            "maker": "0xm",
            "contract": "0xw"
        }))
        .unwrap();
        assert_eq!(
            job,
            MakerUpdateJob::BuyApproval {
                context:    "ctx".to_owned(),
                maker:      "0xm".to_owned(),
                contract:   "0xw".to_owned(),
                operator:   None,
                order_kind: None,
                refresh:    false,
            }
        );
    }
}
