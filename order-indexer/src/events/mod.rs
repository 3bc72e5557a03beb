//! The event ingestor: decodes chain log batches into the append-only
//! event tables and fans out the downstream trigger jobs.

mod decode;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result as AnyResult;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use tracing::{error, info};
use web3::types::H256;

pub use self::decode::{
    decode, ChainEvent, Error as DecodeError, EventLog, APPROVAL_FOR_ALL_TOPIC, APPROVAL_TOPIC,
    NONCE_INCREMENTED_TOPIC, ORDERS_MATCHED_TOPIC, ORDER_CANCELLED_TOPIC, TRANSFER_BATCH_TOPIC,
    TRANSFER_SINGLE_TOPIC, TRANSFER_TOPIC,
};
use crate::{
    db::{
        BulkCancelEvent, CancelEvent, Database, FillEvent, FtApprovalEvent, FtTransferEvent,
        NftApprovalEvent, NftTransferEvent,
    },
    utils::unix_now,
    workers::{FillJob, HashUpdateJob, MakerUpdateJob, Queues, Trigger},
};

static DECODED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("events_decoded", "Decoded chain events by kind.", &["kind"]).unwrap()
});
static DECODE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("events_decode_failures", "Chain logs that failed to decode.").unwrap()
});
static REORGS: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("events_reorgs", "Reorg fix signals handled.").unwrap());

/// Decodes log batches and writes them through the persistence layer.
/// With `backfill` set, only the event tables are written; the orderbook
/// is reconstructed in bulk afterwards, so trigger jobs are suppressed.
#[derive(Debug, Clone)]
pub struct Ingestor {
    db:     Database,
    queues: Arc<Queues>,
}

impl Ingestor {
    #[must_use]
    pub fn new(db: Database, queues: Arc<Queues>) -> Self {
        Self { db, queues }
    }

    /// Ingest a batch of logs. A log that fails to decode is logged and
    /// skipped; it never fails the batch.
    pub async fn sync(&self, logs: &[EventLog], backfill: bool) -> AnyResult<()> {
        // ERC20 transfers sharing a transaction with a fill warrant a
        // proactive allowance recheck, keyed by the filled orders'
        // kinds. The transfer logs precede the match log inside the
        // transaction, so the kinds are resolved up front.
        let fill_kinds = self.fill_kinds_by_tx(logs).await?;

        for log in logs {
            let events = match decode(log) {
                Ok(events) => events,
                Err(error) => {
                    DECODE_FAILURES.inc();
                    error!(
                        ?error,
                        tx_hash = ?log.tx_hash,
                        log_index = log.log_index,
                        "Failed to decode log, skipping"
                    );
                    continue;
                }
            };
            for event in events {
                self.ingest(log, event, backfill, &fill_kinds).await?;
            }
        }
        Ok(())
    }

    /// The protocol kinds of the orders matched in each transaction of
    /// the batch, for transfer-induced approval fan-out.
    async fn fill_kinds_by_tx(
        &self,
        logs: &[EventLog],
    ) -> AnyResult<HashMap<H256, Vec<String>>> {
        let mut by_tx: HashMap<H256, Vec<String>> = HashMap::new();
        for log in logs {
            if log.topics.first() != Some(&*decode::ORDERS_MATCHED_TOPIC) {
                continue;
            }
            let events = match decode(log) {
                Ok(events) => events,
                Err(_) => continue,
            };
            for event in events {
                if let ChainEvent::OrdersMatched {
                    buy_hash,
                    sell_hash,
                    ..
                } = event
                {
                    let kinds = self
                        .db
                        .order_kinds(vec![
                            format!("{:?}", buy_hash),
                            format!("{:?}", sell_hash),
                        ])
                        .await?;
                    let entry = by_tx.entry(log.tx_hash).or_default();
                    for (_hash, kind) in kinds {
                        if !entry.contains(&kind) {
                            entry.push(kind);
                        }
                    }
                }
            }
        }
        Ok(by_tx)
    }

    #[allow(clippy::too_many_lines, clippy::cast_possible_wrap)]
    async fn ingest(
        &self,
        log: &EventLog,
        event: ChainEvent,
        backfill: bool,
        fill_kinds: &HashMap<H256, Vec<String>>,
    ) -> AnyResult<()> {
        let block_hash = format!("{:?}", log.block_hash);
        let tx_hash = format!("{:?}", log.tx_hash);
        let log_index = log.log_index as i64;
        let block = log.block as i64;
        let now = unix_now();

        match event {
            ChainEvent::OrderCancelled { order_hash } => {
                DECODED.with_label_values(&["cancel"]).inc();
                let hash = format!("{:?}", order_hash);
                self.db
                    .add_cancel_event(
                        CancelEvent {
                            block_hash,
                            tx_hash: tx_hash.clone(),
                            log_index,
                            block,
                            order_hash: hash.clone(),
                        },
                        now,
                    )
                    .await?;
                if !backfill {
                    self.queues
                        .hash_update
                        .enqueue(&HashUpdateJob {
                            context: format!("{}-{}-{}", tx_hash, log_index, hash),
                            hash,
                            trigger: Trigger::Cancel,
                        })
                        .await?;
                }
            }
            ChainEvent::OrdersMatched {
                buy_hash,
                sell_hash,
                maker,
                taker,
                price,
            } => {
                DECODED.with_label_values(&["fill"]).inc();
                let buy = format!("{:?}", buy_hash);
                let sell = format!("{:?}", sell_hash);
                self.db
                    .add_fill_event(FillEvent {
                        block_hash,
                        tx_hash: tx_hash.clone(),
                        log_index,
                        block,
                        buy_order_hash: buy.clone(),
                        sell_order_hash: sell.clone(),
                        maker: format!("{:?}", maker),
                        taker: format!("{:?}", taker),
                        price: price.to_string(),
                    })
                    .await?;
                if !backfill {
                    self.queues
                        .fill_handle
                        .enqueue(&FillJob {
                            context:         format!("{}-{}", tx_hash, log_index),
                            buy_order_hash:  buy.clone(),
                            sell_order_hash: sell.clone(),
                        })
                        .await?;
                    for hash in [buy, sell] {
                        self.queues
                            .hash_update
                            .enqueue(&HashUpdateJob {
                                context: format!("{}-{}-{}", tx_hash, log_index, hash),
                                hash,
                                trigger: Trigger::Fill,
                            })
                            .await?;
                    }
                }
            }
            ChainEvent::NonceIncremented { maker, new_nonce } => {
                DECODED.with_label_values(&["bulk-cancel"]).inc();
                let cancelled = self
                    .db
                    .add_bulk_cancel_event(
                        BulkCancelEvent {
                            block_hash,
                            tx_hash: tx_hash.clone(),
                            log_index,
                            block,
                            maker: format!("{:?}", maker),
                            min_nonce: new_nonce.to_string(),
                        },
                        now,
                    )
                    .await?;
                if !backfill {
                    for hash in cancelled {
                        self.queues
                            .hash_update
                            .enqueue(&HashUpdateJob {
                                context: format!("{}-{}-{}", tx_hash, log_index, hash),
                                hash,
                                trigger: Trigger::BulkCancel,
                            })
                            .await?;
                    }
                }
            }
            ChainEvent::NftTransfer {
                contract,
                token_id,
                sender,
                recipient,
                amount,
                batch_index,
            } => {
                DECODED.with_label_values(&["nft-transfer"]).inc();
                let contract = format!("{:?}", contract);
                let token_id = token_id.to_string();
                self.db
                    .add_nft_transfer_event(NftTransferEvent {
                        block_hash,
                        tx_hash: tx_hash.clone(),
                        log_index,
                        batch_index: batch_index as i64,
                        block,
                        contract: contract.clone(),
                        token_id: token_id.clone(),
                        sender: format!("{:?}", sender),
                        recipient: format!("{:?}", recipient),
                        amount: amount.to_string(),
                    })
                    .await?;
                if !backfill {
                    for party in [sender, recipient] {
                        let maker = format!("{:?}", party);
                        self.queues
                            .maker_update
                            .enqueue(&MakerUpdateJob::SellBalance {
                                context:  format!(
                                    "{}-{}-{}-{}",
                                    tx_hash, log_index, maker, token_id
                                ),
                                maker,
                                contract: contract.clone(),
                                token_id: token_id.clone(),
                            })
                            .await?;
                    }
                }
            }
            ChainEvent::NftApproval {
                contract,
                owner,
                operator,
                approved,
            } => {
                DECODED.with_label_values(&["nft-approval"]).inc();
                let contract = format!("{:?}", contract);
                let owner = format!("{:?}", owner);
                let operator = format!("{:?}", operator);
                self.db
                    .add_nft_approval_event(NftApprovalEvent {
                        block_hash,
                        tx_hash: tx_hash.clone(),
                        log_index,
                        block,
                        contract: contract.clone(),
                        owner: owner.clone(),
                        operator: operator.clone(),
                        approved,
                    })
                    .await?;
                if !backfill {
                    self.queues
                        .maker_update
                        .enqueue(&MakerUpdateJob::SellApproval {
                            context: format!("{}-{}-{}", tx_hash, log_index, owner),
                            maker: owner,
                            contract,
                            operator,
                        })
                        .await?;
                }
            }
            ChainEvent::FtTransfer {
                contract,
                sender,
                recipient,
                amount,
            } => {
                DECODED.with_label_values(&["ft-transfer"]).inc();
                let contract = format!("{:?}", contract);
                self.db
                    .add_ft_transfer_event(FtTransferEvent {
                        block_hash,
                        tx_hash: tx_hash.clone(),
                        log_index,
                        block,
                        contract: contract.clone(),
                        sender: format!("{:?}", sender),
                        recipient: format!("{:?}", recipient),
                        amount: amount.to_string(),
                    })
                    .await?;
                if !backfill {
                    for party in [sender, recipient] {
                        let maker = format!("{:?}", party);
                        self.queues
                            .maker_update
                            .enqueue(&MakerUpdateJob::BuyBalance {
                                context:  format!("{}-{}-{}", tx_hash, log_index, maker),
                                maker,
                                contract: contract.clone(),
                            })
                            .await?;
                    }
                    // A transfer inside a fill transaction may have moved
                    // allowance without an Approval event. Fan out a
                    // recheck per kind of the orders matched in this
                    // transaction.
                    if let Some(kinds) = fill_kinds.get(&log.tx_hash) {
                        let maker = format!("{:?}", sender);
                        for kind in kinds.clone() {
                            self.queues
                                .maker_update
                                .enqueue(&MakerUpdateJob::BuyApproval {
                                    context:    format!(
                                        "{}-{}-{}-{}",
                                        tx_hash, log_index, maker, kind
                                    ),
                                    maker:      maker.clone(),
                                    contract:   contract.clone(),
                                    operator:   None,
                                    order_kind: Some(kind),
                                    refresh:    false,
                                })
                                .await?;
                        }
                    }
                }
            }
            ChainEvent::FtApproval {
                contract,
                owner,
                spender,
                amount,
            } => {
                DECODED.with_label_values(&["ft-approval"]).inc();
                let contract = format!("{:?}", contract);
                let owner = format!("{:?}", owner);
                let spender = format!("{:?}", spender);
                self.db
                    .add_ft_approval_event(FtApprovalEvent {
                        block_hash,
                        tx_hash: tx_hash.clone(),
                        log_index,
                        block,
                        contract: contract.clone(),
                        owner: owner.clone(),
                        spender: spender.clone(),
                        amount: amount.to_string(),
                    })
                    .await?;
                if !backfill {
                    self.queues
                        .maker_update
                        .enqueue(&MakerUpdateJob::BuyApproval {
                            context:    format!("{}-{}-{}", tx_hash, log_index, owner),
                            maker:      owner,
                            contract,
                            operator:   Some(spender),
                            order_kind: None,
                            refresh:    false,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Reorg recovery: erase the events of one block hash and re-derive
    /// every order whose state was fed by them.
    pub async fn fix(&self, block_hash: H256) -> AnyResult<()> {
        REORGS.inc();
        let block_hash = format!("{:?}", block_hash);
        info!(block_hash = %block_hash, "Handling reorg fix");
        let reverted = self.db.revert_block(block_hash.clone()).await?;

        let mut hashes = reverted.order_hashes;
        hashes.sort();
        hashes.dedup();
        for hash in hashes {
            self.queues
                .hash_update
                .enqueue(&HashUpdateJob {
                    context: format!("fix-{}-{}", block_hash, hash),
                    hash,
                    trigger: Trigger::Revert,
                })
                .await?;
        }
        for (contract, token_id, owner) in reverted.nft_transfers {
            self.queues
                .maker_update
                .enqueue(&MakerUpdateJob::SellBalance {
                    context: format!("fix-{}-{}-{}", block_hash, owner, token_id),
                    maker: owner,
                    contract,
                    token_id,
                })
                .await?;
        }
        for (contract, owner) in reverted.ft_transfers {
            self.queues
                .maker_update
                .enqueue(&MakerUpdateJob::BuyBalance {
                    context: format!("fix-{}-{}", block_hash, owner),
                    maker: owner,
                    contract,
                })
                .await?;
        }
        for (contract, owner, operator) in reverted.nft_approvals {
            self.queues
                .maker_update
                .enqueue(&MakerUpdateJob::SellApproval {
                    context: format!("fix-{}-{}-{}", block_hash, owner, operator),
                    maker: owner,
                    contract,
                    operator,
                })
                .await?;
        }
        for (contract, owner, spender) in reverted.ft_approvals {
            self.queues
                .maker_update
                .enqueue(&MakerUpdateJob::BuyApproval {
                    context:    format!("fix-{}-{}-{}", block_hash, owner, spender),
                    maker:      owner,
                    contract,
                    operator:   Some(spender),
                    order_kind: None,
                    refresh:    false,
                })
                .await?;
        }
        Ok(())
    }
}
