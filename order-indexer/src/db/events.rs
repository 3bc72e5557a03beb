//! The append-only event log and its projections.
//!
//! Every ingestion is one SQL statement: a CTE inserts the event row with
//! `ON CONFLICT DO NOTHING` and its `RETURNING` set gates the projection
//! update, so redelivery of a `(block_hash, tx_hash, log_index)` tuple is
//! a no-op. Reverting a block deletes only that block's rows and rebuilds
//! the affected projections by folding the remaining log.

use std::collections::BTreeSet;

use anyhow::{Context as _, Result as AnyResult};
use diesel::{
    pg::PgConnection,
    sql_query,
    sql_types::{BigInt, Bool, Text},
    RunQueryDsl,
};
use tracing::info;

use super::{
    BulkCancelRow, Database, FillHashesRow, FtApprovalKeyRow, FtTransferKeyRow, HashRow,
    NftApprovalKeyRow, NftTransferKeyRow, OrderHashRow,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelEvent {
    pub block_hash: String,
    pub tx_hash:    String,
    pub log_index:  i64,
    pub block:      i64,
    pub order_hash: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FillEvent {
    pub block_hash:      String,
    pub tx_hash:         String,
    pub log_index:       i64,
    pub block:           i64,
    pub buy_order_hash:  String,
    pub sell_order_hash: String,
    pub maker:           String,
    pub taker:           String,
    pub price:           String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkCancelEvent {
    pub block_hash: String,
    pub tx_hash:    String,
    pub log_index:  i64,
    pub block:      i64,
    pub maker:      String,
    pub min_nonce:  String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NftTransferEvent {
    pub block_hash:  String,
    pub tx_hash:     String,
    pub log_index:   i64,
    pub batch_index: i64,
    pub block:       i64,
    pub contract:    String,
    pub token_id:    String,
    pub sender:      String,
    pub recipient:   String,
    pub amount:      String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NftApprovalEvent {
    pub block_hash: String,
    pub tx_hash:    String,
    pub log_index:  i64,
    pub block:      i64,
    pub contract:   String,
    pub owner:      String,
    pub operator:   String,
    pub approved:   bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FtTransferEvent {
    pub block_hash: String,
    pub tx_hash:    String,
    pub log_index:  i64,
    pub block:      i64,
    pub contract:   String,
    pub sender:     String,
    pub recipient:  String,
    pub amount:     String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FtApprovalEvent {
    pub block_hash: String,
    pub tx_hash:    String,
    pub log_index:  i64,
    pub block:      i64,
    pub contract:   String,
    pub owner:      String,
    pub spender:    String,
    pub amount:     String,
}

/// Everything a reverted block touched, for re-derivation.
#[derive(Clone, Debug, Default)]
pub struct RevertedBlock {
    pub order_hashes:  Vec<String>,
    pub nft_transfers: Vec<(String, String, String)>,
    pub ft_transfers:  Vec<(String, String)>,
    pub nft_approvals: Vec<(String, String, String)>,
    pub ft_approvals:  Vec<(String, String, String)>,
}

impl Database {
    /// Record a cancellation and project it onto the order in one
    /// statement. Returns the hashes whose projection changed.
    pub async fn add_cancel_event(&self, event: CancelEvent, now: i64) -> AnyResult<Vec<String>> {
        self.with_connection("add_cancel_event", move |connection| {
            let rows: Vec<HashRow> = sql_query(
                "WITH ins AS ( \
                   INSERT INTO cancel_events (block_hash, tx_hash, log_index, block, order_hash) \
                   VALUES ($1, $2, $3, $4, $5) \
                   ON CONFLICT DO NOTHING \
                   RETURNING order_hash \
                 ) \
                 UPDATE orders SET fillability_status = 'cancelled', expiration = $6, \
                   updated_at = now() \
                 FROM ins \
                 WHERE orders.hash = ins.order_hash \
                   AND orders.fillability_status <> 'cancelled' \
                 RETURNING orders.hash",
            )
            .bind::<Text, _>(event.block_hash)
            .bind::<Text, _>(event.tx_hash)
            .bind::<BigInt, _>(event.log_index)
            .bind::<BigInt, _>(event.block)
            .bind::<Text, _>(event.order_hash)
            .bind::<BigInt, _>(now)
            .load(connection)?;
            Ok(rows.into_iter().map(|row| row.hash).collect())
        })
        .await
        .context("error in add_cancel_event query")
    }

    /// Record a nonce bump and cancel every order of the maker below the
    /// new threshold atomically. Returns the cancelled hashes.
    pub async fn add_bulk_cancel_event(
        &self,
        event: BulkCancelEvent,
        now: i64,
    ) -> AnyResult<Vec<String>> {
        self.with_connection("add_bulk_cancel_event", move |connection| {
            let rows: Vec<HashRow> = sql_query(
                "WITH ins AS ( \
                   INSERT INTO bulk_cancel_events \
                     (block_hash, tx_hash, log_index, block, maker, min_nonce) \
                   VALUES ($1, $2, $3, $4, $5, $6) \
                   ON CONFLICT DO NOTHING \
                   RETURNING maker, min_nonce \
                 ) \
                 UPDATE orders SET fillability_status = 'cancelled', expiration = $7, \
                   updated_at = now() \
                 FROM ins \
                 WHERE orders.maker = ins.maker \
                   AND orders.kind = 'wyvern-v2.3' \
                   AND orders.nonce IS NOT NULL \
                   AND orders.nonce::numeric < ins.min_nonce::numeric \
                   AND orders.fillability_status IN ('fillable', 'no-balance') \
                 RETURNING orders.hash",
            )
            .bind::<Text, _>(event.block_hash)
            .bind::<Text, _>(event.tx_hash)
            .bind::<BigInt, _>(event.log_index)
            .bind::<BigInt, _>(event.block)
            .bind::<Text, _>(event.maker)
            .bind::<Text, _>(event.min_nonce)
            .bind::<BigInt, _>(now)
            .load(connection)?;
            Ok(rows.into_iter().map(|row| row.hash).collect())
        })
        .await
        .context("error in add_bulk_cancel_event query")
    }

    /// Append a match to the fills history. The projection is applied by
    /// the fill handler.
    pub async fn add_fill_event(&self, event: FillEvent) -> AnyResult<bool> {
        self.with_connection("add_fill_event", move |connection| {
            let inserted = sql_query(
                "INSERT INTO fill_events (block_hash, tx_hash, log_index, block, \
                   buy_order_hash, sell_order_hash, maker, taker, price) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT DO NOTHING",
            )
            .bind::<Text, _>(event.block_hash)
            .bind::<Text, _>(event.tx_hash)
            .bind::<BigInt, _>(event.log_index)
            .bind::<BigInt, _>(event.block)
            .bind::<Text, _>(event.buy_order_hash)
            .bind::<Text, _>(event.sell_order_hash)
            .bind::<Text, _>(event.maker)
            .bind::<Text, _>(event.taker)
            .bind::<Text, _>(event.price)
            .execute(connection)?;
            Ok(inserted > 0)
        })
        .await
        .context("error in add_fill_event query")
    }

    /// Append an NFT transfer and fold it into the balance projection.
    pub async fn add_nft_transfer_event(&self, event: NftTransferEvent) -> AnyResult<bool> {
        self.with_connection("add_nft_transfer_event", move |connection| {
            let touched = sql_query(
                "WITH ins AS ( \
                   INSERT INTO nft_transfer_events (block_hash, tx_hash, log_index, \
                     batch_index, block, contract, token_id, sender, recipient, amount) \
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                   ON CONFLICT DO NOTHING \
                   RETURNING contract, token_id, sender, recipient, amount \
                 ) \
                 INSERT INTO nft_balances (contract, token_id, owner, amount) \
                 SELECT contract, token_id, owner, (sum(delta::numeric))::text FROM ( \
                   SELECT contract, token_id, sender AS owner, ('-' || amount) AS delta FROM ins \
                   UNION ALL \
                   SELECT contract, token_id, recipient AS owner, amount AS delta FROM ins \
                 ) AS deltas \
                 GROUP BY contract, token_id, owner \
                 ON CONFLICT (contract, token_id, owner) \
                 DO UPDATE SET amount = \
                   ((nft_balances.amount)::numeric + (excluded.amount)::numeric)::text",
            )
            .bind::<Text, _>(event.block_hash)
            .bind::<Text, _>(event.tx_hash)
            .bind::<BigInt, _>(event.log_index)
            .bind::<BigInt, _>(event.batch_index)
            .bind::<BigInt, _>(event.block)
            .bind::<Text, _>(event.contract)
            .bind::<Text, _>(event.token_id)
            .bind::<Text, _>(event.sender)
            .bind::<Text, _>(event.recipient)
            .bind::<Text, _>(event.amount)
            .execute(connection)?;
            Ok(touched > 0)
        })
        .await
        .context("error in add_nft_transfer_event query")
    }

    /// Append a fungible transfer and fold it into the balance projection.
    pub async fn add_ft_transfer_event(&self, event: FtTransferEvent) -> AnyResult<bool> {
        self.with_connection("add_ft_transfer_event", move |connection| {
            let touched = sql_query(
                "WITH ins AS ( \
                   INSERT INTO ft_transfer_events (block_hash, tx_hash, log_index, block, \
                     contract, sender, recipient, amount) \
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                   ON CONFLICT DO NOTHING \
                   RETURNING contract, sender, recipient, amount \
                 ) \
                 INSERT INTO ft_balances (contract, owner, amount) \
                 SELECT contract, owner, (sum(delta::numeric))::text FROM ( \
                   SELECT contract, sender AS owner, ('-' || amount) AS delta FROM ins \
                   UNION ALL \
                   SELECT contract, recipient AS owner, amount AS delta FROM ins \
                 ) AS deltas \
                 GROUP BY contract, owner \
                 ON CONFLICT (contract, owner) \
                 DO UPDATE SET amount = \
                   ((ft_balances.amount)::numeric + (excluded.amount)::numeric)::text",
            )
            .bind::<Text, _>(event.block_hash)
            .bind::<Text, _>(event.tx_hash)
            .bind::<BigInt, _>(event.log_index)
            .bind::<BigInt, _>(event.block)
            .bind::<Text, _>(event.contract)
            .bind::<Text, _>(event.sender)
            .bind::<Text, _>(event.recipient)
            .bind::<Text, _>(event.amount)
            .execute(connection)?;
            Ok(touched > 0)
        })
        .await
        .context("error in add_ft_transfer_event query")
    }

    /// Append an operator approval. Current state is the latest row per
    /// `(contract, owner, operator)`, so no projection is kept.
    pub async fn add_nft_approval_event(&self, event: NftApprovalEvent) -> AnyResult<bool> {
        self.with_connection("add_nft_approval_event", move |connection| {
            let inserted = sql_query(
                "INSERT INTO nft_approval_events (block_hash, tx_hash, log_index, block, \
                   contract, owner, operator, approved) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT DO NOTHING",
            )
            .bind::<Text, _>(event.block_hash)
            .bind::<Text, _>(event.tx_hash)
            .bind::<BigInt, _>(event.log_index)
            .bind::<BigInt, _>(event.block)
            .bind::<Text, _>(event.contract)
            .bind::<Text, _>(event.owner)
            .bind::<Text, _>(event.operator)
            .bind::<Bool, _>(event.approved)
            .execute(connection)?;
            Ok(inserted > 0)
        })
        .await
        .context("error in add_nft_approval_event query")
    }

    /// Append a fungible approval and reproject the latest allowance from
    /// the full event history, so out-of-order delivery is benign.
    pub async fn add_ft_approval_event(&self, event: FtApprovalEvent) -> AnyResult<bool> {
        self.with_connection("add_ft_approval_event", move |connection| {
            let touched = sql_query(
                "WITH ins AS ( \
                   INSERT INTO ft_approval_events (block_hash, tx_hash, log_index, block, \
                     contract, owner, spender, amount) \
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                   ON CONFLICT DO NOTHING \
                   RETURNING contract, owner, spender \
                 ) \
                 INSERT INTO ft_approvals (contract, owner, spender, amount) \
                 SELECT ins.contract, ins.owner, ins.spender, latest.amount \
                 FROM ins \
                 CROSS JOIN LATERAL ( \
                   SELECT amount FROM ( \
                     SELECT amount, block, log_index FROM ft_approval_events e \
                     WHERE e.contract = ins.contract AND e.owner = ins.owner \
                       AND e.spender = ins.spender \
                     UNION ALL \
                     SELECT $8, $4, $3 \
                   ) u \
                   ORDER BY u.block DESC, u.log_index DESC \
                   LIMIT 1 \
                 ) AS latest \
                 ON CONFLICT (contract, owner, spender) \
                 DO UPDATE SET amount = excluded.amount",
            )
            .bind::<Text, _>(event.block_hash)
            .bind::<Text, _>(event.tx_hash)
            .bind::<BigInt, _>(event.log_index)
            .bind::<BigInt, _>(event.block)
            .bind::<Text, _>(event.contract)
            .bind::<Text, _>(event.owner)
            .bind::<Text, _>(event.spender)
            .bind::<Text, _>(event.amount)
            .execute(connection)?;
            Ok(touched > 0)
        })
        .await
        .context("error in add_ft_approval_event query")
    }

    /// Refresh a fungible allowance from an authoritative chain read.
    pub async fn update_ft_approval(
        &self,
        contract: String,
        owner: String,
        spender: String,
        amount: String,
    ) -> AnyResult<()> {
        self.with_connection("update_ft_approval", move |connection| {
            sql_query(
                "INSERT INTO ft_approvals (contract, owner, spender, amount) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (contract, owner, spender) DO UPDATE SET amount = excluded.amount",
            )
            .bind::<Text, _>(contract)
            .bind::<Text, _>(owner)
            .bind::<Text, _>(spender)
            .bind::<Text, _>(amount)
            .execute(connection)?;
            Ok(())
        })
        .await
        .context("error in update_ft_approval query")
    }

    /// Erase one block from the event log and rebuild the projections it
    /// fed. Only rows with the given block hash are touched; everything
    /// else is re-derived from the remaining history.
    pub async fn revert_block(&self, block_hash: String) -> AnyResult<RevertedBlock> {
        self.in_transaction("revert_block", move |connection| {
            let mut reverted = RevertedBlock::default();

            let cancels: Vec<OrderHashRow> =
                sql_query("DELETE FROM cancel_events WHERE block_hash = $1 RETURNING order_hash")
                    .bind::<Text, _>(block_hash.clone())
                    .load(connection)?;
            reverted
                .order_hashes
                .extend(cancels.into_iter().map(|row| row.order_hash));

            let fills: Vec<FillHashesRow> = sql_query(
                "DELETE FROM fill_events WHERE block_hash = $1 \
                 RETURNING buy_order_hash, sell_order_hash",
            )
            .bind::<Text, _>(block_hash.clone())
            .load(connection)?;
            for fill in fills {
                reverted.order_hashes.push(fill.buy_order_hash);
                reverted.order_hashes.push(fill.sell_order_hash);
            }

            let bulk: Vec<BulkCancelRow> = sql_query(
                "DELETE FROM bulk_cancel_events WHERE block_hash = $1 \
                 RETURNING maker, min_nonce",
            )
            .bind::<Text, _>(block_hash.clone())
            .load(connection)?;
            for row in bulk {
                let hashes: Vec<HashRow> = sql_query(
                    "SELECT hash FROM orders \
                     WHERE maker = $1 AND kind = 'wyvern-v2.3' \
                       AND nonce IS NOT NULL AND nonce::numeric < $2::numeric",
                )
                .bind::<Text, _>(row.maker)
                .bind::<Text, _>(row.min_nonce)
                .load(connection)?;
                reverted
                    .order_hashes
                    .extend(hashes.into_iter().map(|row| row.hash));
            }

            let nft_transfers: Vec<NftTransferKeyRow> = sql_query(
                "DELETE FROM nft_transfer_events WHERE block_hash = $1 \
                 RETURNING contract, token_id, sender, recipient",
            )
            .bind::<Text, _>(block_hash.clone())
            .load(connection)?;
            let mut nft_keys = BTreeSet::new();
            for row in nft_transfers {
                nft_keys.insert((row.contract.clone(), row.token_id.clone(), row.sender));
                nft_keys.insert((row.contract, row.token_id, row.recipient));
            }
            for (contract, token_id, owner) in &nft_keys {
                recompute_nft_balance(connection, contract, token_id, owner)?;
            }
            reverted.nft_transfers = nft_keys.into_iter().collect();

            let ft_transfers: Vec<FtTransferKeyRow> = sql_query(
                "DELETE FROM ft_transfer_events WHERE block_hash = $1 \
                 RETURNING contract, sender, recipient",
            )
            .bind::<Text, _>(block_hash.clone())
            .load(connection)?;
            let mut ft_keys = BTreeSet::new();
            for row in ft_transfers {
                ft_keys.insert((row.contract.clone(), row.sender));
                ft_keys.insert((row.contract, row.recipient));
            }
            for (contract, owner) in &ft_keys {
                recompute_ft_balance(connection, contract, owner)?;
            }
            reverted.ft_transfers = ft_keys.into_iter().collect();

            let nft_approvals: Vec<NftApprovalKeyRow> = sql_query(
                "DELETE FROM nft_approval_events WHERE block_hash = $1 \
                 RETURNING contract, owner, operator",
            )
            .bind::<Text, _>(block_hash.clone())
            .load(connection)?;
            reverted.nft_approvals = nft_approvals
                .into_iter()
                .map(|row| (row.contract, row.owner, row.operator))
                .collect();

            let ft_approvals: Vec<FtApprovalKeyRow> = sql_query(
                "DELETE FROM ft_approval_events WHERE block_hash = $1 \
                 RETURNING contract, owner, spender",
            )
            .bind::<Text, _>(block_hash.clone())
            .load(connection)?;
            for row in &ft_approvals {
                recompute_ft_approval(connection, &row.contract, &row.owner, &row.spender)?;
            }
            reverted.ft_approvals = ft_approvals
                .into_iter()
                .map(|row| (row.contract, row.owner, row.spender))
                .collect();

            info!(
                block_hash = %block_hash,
                orders = reverted.order_hashes.len(),
                "Reverted events for block"
            );
            Ok(reverted)
        })
        .await
        .context("error in revert_block transaction")
    }
}

fn recompute_nft_balance(
    connection: &PgConnection,
    contract: &str,
    token_id: &str,
    owner: &str,
) -> AnyResult<()> {
    sql_query(
        "INSERT INTO nft_balances (contract, token_id, owner, amount) \
         SELECT $1, $2, $3, coalesce(sum( \
             (CASE WHEN recipient = $3 THEN amount::numeric ELSE 0 END) - \
             (CASE WHEN sender = $3 THEN amount::numeric ELSE 0 END)), 0)::text \
         FROM nft_transfer_events \
         WHERE contract = $1 AND token_id = $2 AND (sender = $3 OR recipient = $3) \
         ON CONFLICT (contract, token_id, owner) DO UPDATE SET amount = excluded.amount",
    )
    .bind::<Text, _>(contract.to_owned())
    .bind::<Text, _>(token_id.to_owned())
    .bind::<Text, _>(owner.to_owned())
    .execute(connection)?;
    Ok(())
}

fn recompute_ft_balance(connection: &PgConnection, contract: &str, owner: &str) -> AnyResult<()> {
    sql_query(
        "INSERT INTO ft_balances (contract, owner, amount) \
         SELECT $1, $2, coalesce(sum( \
             (CASE WHEN recipient = $2 THEN amount::numeric ELSE 0 END) - \
             (CASE WHEN sender = $2 THEN amount::numeric ELSE 0 END)), 0)::text \
         FROM ft_transfer_events \
         WHERE contract = $1 AND (sender = $2 OR recipient = $2) \
         ON CONFLICT (contract, owner) DO UPDATE SET amount = excluded.amount",
    )
    .bind::<Text, _>(contract.to_owned())
    .bind::<Text, _>(owner.to_owned())
    .execute(connection)?;
    Ok(())
}

fn recompute_ft_approval(
    connection: &PgConnection,
    contract: &str,
    owner: &str,
    spender: &str,
) -> AnyResult<()> {
    sql_query(
        "INSERT INTO ft_approvals (contract, owner, spender, amount) \
         SELECT $1, $2, $3, coalesce(( \
             SELECT amount FROM ft_approval_events \
             WHERE contract = $1 AND owner = $2 AND spender = $3 \
             ORDER BY block DESC, log_index DESC LIMIT 1), '0') \
         ON CONFLICT (contract, owner, spender) DO UPDATE SET amount = excluded.amount",
    )
    .bind::<Text, _>(contract.to_owned())
    .bind::<Text, _>(owner.to_owned())
    .bind::<Text, _>(spender.to_owned())
    .execute(connection)?;
    Ok(())
}
