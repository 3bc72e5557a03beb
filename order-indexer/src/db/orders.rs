//! Order projection reads and writes.
//!
//! Simple upserts use the diesel DSL; the bulk maker-update statements
//! are raw SQL with positional binds so the balance/approval fold and the
//! conditional `old != new` write happen in one round trip.

use anyhow::{Context as _, Result as AnyResult};
use chrono::{offset::Utc, DateTime};
use diesel::{
    insert_into,
    prelude::*,
    sql_query,
    sql_types::{BigInt, Text},
    update,
};
use tracing::trace;

use super::{
    orders_table, CountRow, Database, HashRow, OrderRow, ScalarBoolRow, ScalarTextRow,
};
use crate::orders::{downgrade_case_sql, non_escrowed_kinds_sql};

/// A fully-derived order ready for insertion.
#[derive(Clone, Debug, PartialEq)]
pub struct NewOrder {
    pub hash:               String,
    pub kind:               String,
    pub side:               String,
    pub maker:              String,
    pub price:              String,
    pub value:              String,
    pub quantity_remaining: String,
    pub token_set_id:       String,
    pub nonce:              Option<String>,
    pub fee_bps:            i64,
    pub source_id:          Option<String>,
    pub royalty_info:       Option<String>,
    pub raw_data:           String,
    pub payment_token:      String,
    pub conduit:            Option<String>,
    pub listing_time:       i64,
    pub expiration_time:    i64,
    pub fillability_status: String,
    pub approval_status:    String,
    pub expiration:         i64,
    pub created_at:         DateTime<Utc>,
}

impl Database {
    /// Idempotent order insert: replays refresh the derived columns only.
    pub async fn insert_order(&self, order: NewOrder) -> AnyResult<()> {
        trace!(hash = %order.hash, "Inserting order in database");
        self.with_connection("insert_order", move |connection| {
            use orders_table::{
                approval_status, conduit, created_at, expiration, expiration_time, fee_bps,
                fillability_status, hash, kind, listing_time, maker, nonce, payment_token, price,
                quantity_remaining, raw_data, royalty_info, side, source_id, token_set_id,
                updated_at, value,
            };

            let query = insert_into(orders_table::table)
                .values((
                    hash.eq(order.hash),
                    kind.eq(order.kind),
                    side.eq(order.side),
                    maker.eq(order.maker),
                    price.eq(order.price.clone()),
                    value.eq(order.value.clone()),
                    quantity_remaining.eq(order.quantity_remaining),
                    token_set_id.eq(order.token_set_id),
                    nonce.eq(order.nonce),
                    fee_bps.eq(order.fee_bps),
                    source_id.eq(order.source_id.clone()),
                    royalty_info.eq(order.royalty_info.clone()),
                    raw_data.eq(order.raw_data),
                    payment_token.eq(order.payment_token),
                    conduit.eq(order.conduit),
                    listing_time.eq(order.listing_time),
                    expiration_time.eq(order.expiration_time),
                    fillability_status.eq(order.fillability_status),
                    approval_status.eq(order.approval_status),
                    expiration.eq(order.expiration),
                    created_at.eq(order.created_at),
                    updated_at.eq(Utc::now()),
                ))
                .on_conflict(hash)
                .do_update()
                .set((
                    price.eq(order.price),
                    value.eq(order.value),
                    source_id.eq(order.source_id),
                    royalty_info.eq(order.royalty_info),
                    updated_at.eq(Utc::now()),
                ));
            query.execute(connection)?;
            Ok(())
        })
        .await
        .context("error in insert_order query")
    }

    pub async fn get_order(&self, order_hash: String) -> AnyResult<Option<OrderRow>> {
        self.with_connection("get_order", move |connection| {
            orders_table::table
                .find(order_hash)
                .first::<OrderRow>(connection)
                .optional()
                .map_err(Into::into)
        })
        .await
        .context("error in get_order query")
    }

    pub async fn orders_by_maker(&self, maker: String, side: String) -> AnyResult<Vec<OrderRow>> {
        self.with_connection("orders_by_maker", move |connection| {
            orders_table::table
                .filter(orders_table::maker.eq(maker))
                .filter(orders_table::side.eq(side))
                .load::<OrderRow>(connection)
                .map_err(Into::into)
        })
        .await
        .context("error in orders_by_maker query")
    }

    /// The protocol kinds of the given orders, for trigger fan-out.
    pub async fn order_kinds(&self, hashes: Vec<String>) -> AnyResult<Vec<(String, String)>> {
        self.with_connection("order_kinds", move |connection| {
            orders_table::table
                .filter(orders_table::hash.eq_any(hashes))
                .select((orders_table::hash, orders_table::kind))
                .load::<(String, String)>(connection)
                .map_err(Into::into)
        })
        .await
        .context("error in order_kinds query")
    }

    /// Cheapest fillable listing for a token.
    pub async fn best_ask(&self, contract: String, token_id: String) -> AnyResult<Option<OrderRow>> {
        self.best_order(contract, token_id, "sell", "ASC").await
    }

    /// Highest fillable bid for a token.
    pub async fn best_bid(&self, contract: String, token_id: String) -> AnyResult<Option<OrderRow>> {
        self.best_order(contract, token_id, "buy", "DESC").await
    }

    async fn best_order(
        &self,
        contract: String,
        token_id: String,
        side: &'static str,
        direction: &'static str,
    ) -> AnyResult<Option<OrderRow>> {
        self.with_connection("best_order", move |connection| {
            let statement = format!(
                "SELECT o.* FROM orders o \
                 JOIN token_sets_tokens t ON t.token_set_id = o.token_set_id \
                 WHERE t.contract = $1 AND t.token_id = $2 AND o.side = $3 \
                   AND o.fillability_status = 'fillable' AND o.approval_status = 'approved' \
                 ORDER BY o.value::numeric {} \
                 LIMIT 1",
                direction
            );
            let mut rows: Vec<OrderRow> = sql_query(statement)
                .bind::<Text, _>(contract)
                .bind::<Text, _>(token_id)
                .bind::<Text, _>(side)
                .load(connection)?;
            Ok(rows.pop())
        })
        .await
        .context("error in best_order query")
    }

    /// Conditional projection write: only rows whose derived state
    /// actually changed are touched.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_order_status(
        &self,
        order_hash: String,
        fillability: String,
        approval: String,
        new_value: String,
        new_quantity_remaining: String,
        new_expiration: i64,
    ) -> AnyResult<bool> {
        self.with_connection("update_order_status", move |connection| {
            use orders_table::{
                approval_status, expiration, fillability_status, hash, quantity_remaining,
                updated_at, value,
            };

            let changed = fillability_status
                .ne(fillability.clone())
                .or(approval_status.ne(approval.clone()))
                .or(value.ne(new_value.clone()))
                .or(quantity_remaining.ne(new_quantity_remaining.clone()))
                .or(expiration.ne(new_expiration));
            let query = update(orders_table::table.filter(hash.eq(order_hash).and(changed))).set((
                fillability_status.eq(fillability),
                approval_status.eq(approval),
                value.eq(new_value),
                quantity_remaining.eq(new_quantity_remaining),
                expiration.eq(new_expiration),
                updated_at.eq(Utc::now()),
            ));
            Ok(query.execute(connection)? > 0)
        })
        .await
        .context("error in update_order_status query")
    }

    /// Recheck every sell order of a maker touching one token after an
    /// NFT balance change. Returns the hashes whose status flipped.
    pub async fn recheck_sell_balance(
        &self,
        maker: String,
        contract: String,
        token_id: String,
        now: i64,
    ) -> AnyResult<Vec<String>> {
        self.with_connection("recheck_sell_balance", move |connection| {
            let statement = format!(
                "UPDATE orders SET \
                   fillability_status = x.new_status, \
                   expiration = CASE WHEN x.new_status = 'fillable' \
                                     THEN orders.expiration_time ELSE $4 END, \
                   updated_at = now() \
                 FROM ( \
                   SELECT o.hash, CASE \
                       WHEN coalesce((SELECT b.amount FROM nft_balances b \
                                      WHERE b.contract = $2 AND b.token_id = $3 \
                                        AND b.owner = $1), '0')::numeric \
                            >= o.quantity_remaining::numeric \
                       THEN 'fillable' ELSE {} END AS new_status \
                   FROM orders o \
                   WHERE o.maker = $1 AND o.side = 'sell' \
                     AND o.fillability_status IN ('fillable', 'no-balance') \
                     AND o.kind IN ({}) \
                     AND EXISTS (SELECT 1 FROM token_sets_tokens t \
                                 WHERE t.token_set_id = o.token_set_id \
                                   AND t.contract = $2 AND t.token_id = $3) \
                 ) x \
                 WHERE orders.hash = x.hash AND orders.fillability_status <> x.new_status \
                 RETURNING orders.hash",
                downgrade_case_sql("o.kind"),
                non_escrowed_kinds_sql(),
            );
            let rows: Vec<HashRow> = sql_query(statement)
                .bind::<Text, _>(maker)
                .bind::<Text, _>(contract)
                .bind::<Text, _>(token_id)
                .bind::<BigInt, _>(now)
                .load(connection)?;
            Ok(rows.into_iter().map(|row| row.hash).collect())
        })
        .await
        .context("error in recheck_sell_balance query")
    }

    /// Recheck every buy order of a maker paying in one fungible token.
    pub async fn recheck_buy_balance(
        &self,
        maker: String,
        contract: String,
        now: i64,
    ) -> AnyResult<Vec<String>> {
        self.with_connection("recheck_buy_balance", move |connection| {
            let statement = format!(
                "UPDATE orders SET \
                   fillability_status = x.new_status, \
                   expiration = CASE WHEN x.new_status = 'fillable' \
                                     THEN orders.expiration_time ELSE $3 END, \
                   updated_at = now() \
                 FROM ( \
                   SELECT o.hash, CASE \
                       WHEN coalesce((SELECT b.amount FROM ft_balances b \
                                      WHERE b.contract = $2 AND b.owner = $1), '0')::numeric \
                            >= o.price::numeric \
                       THEN 'fillable' ELSE {} END AS new_status \
                   FROM orders o \
                   WHERE o.maker = $1 AND o.side = 'buy' AND o.payment_token = $2 \
                     AND o.fillability_status IN ('fillable', 'no-balance') \
                     AND o.kind IN ({}) \
                 ) x \
                 WHERE orders.hash = x.hash AND orders.fillability_status <> x.new_status \
                 RETURNING orders.hash",
                downgrade_case_sql("o.kind"),
                non_escrowed_kinds_sql(),
            );
            let rows: Vec<HashRow> = sql_query(statement)
                .bind::<Text, _>(maker)
                .bind::<Text, _>(contract)
                .bind::<BigInt, _>(now)
                .load(connection)?;
            Ok(rows.into_iter().map(|row| row.hash).collect())
        })
        .await
        .context("error in recheck_buy_balance query")
    }

    /// Recheck operator approval for a maker's sell orders on a contract.
    pub async fn recheck_sell_approval(
        &self,
        maker: String,
        contract: String,
        operator: String,
    ) -> AnyResult<Vec<String>> {
        self.with_connection("recheck_sell_approval", move |connection| {
            let statement = "UPDATE orders SET approval_status = x.new_status, updated_at = now() \
                 FROM ( \
                   SELECT o.hash, CASE \
                       WHEN coalesce((SELECT e.approved FROM nft_approval_events e \
                                      WHERE e.contract = $2 AND e.owner = $1 AND e.operator = $3 \
                                      ORDER BY e.block DESC, e.log_index DESC LIMIT 1), false) \
                       THEN 'approved' ELSE 'no-approval' END AS new_status \
                   FROM orders o \
                   WHERE o.maker = $1 AND o.side = 'sell' AND o.conduit = $3 \
                     AND o.fillability_status IN ('fillable', 'no-balance') \
                     AND EXISTS (SELECT 1 FROM token_sets_tokens t \
                                 WHERE t.token_set_id = o.token_set_id AND t.contract = $2) \
                 ) x \
                 WHERE orders.hash = x.hash AND orders.approval_status <> x.new_status \
                 RETURNING orders.hash";
            let rows: Vec<HashRow> = sql_query(statement)
                .bind::<Text, _>(maker)
                .bind::<Text, _>(contract)
                .bind::<Text, _>(operator)
                .load(connection)?;
            Ok(rows.into_iter().map(|row| row.hash).collect())
        })
        .await
        .context("error in recheck_sell_approval query")
    }

    /// Recheck payment-token allowance for a maker's buy orders routed
    /// through one conduit. The required allowance is the fee share,
    /// `price - value`.
    pub async fn recheck_buy_approval(
        &self,
        maker: String,
        contract: String,
        operator: String,
    ) -> AnyResult<Vec<String>> {
        self.with_connection("recheck_buy_approval", move |connection| {
            let statement = "UPDATE orders SET approval_status = x.new_status, updated_at = now() \
                 FROM ( \
                   SELECT o.hash, CASE \
                       WHEN coalesce((SELECT a.amount FROM ft_approvals a \
                                      WHERE a.contract = $2 AND a.owner = $1 \
                                        AND a.spender = $3), '0')::numeric \
                            >= (o.price::numeric - o.value::numeric) \
                       THEN 'approved' ELSE 'no-approval' END AS new_status \
                   FROM orders o \
                   WHERE o.maker = $1 AND o.side = 'buy' AND o.payment_token = $2 \
                     AND o.conduit = $3 \
                     AND o.fillability_status IN ('fillable', 'no-balance') \
                 ) x \
                 WHERE orders.hash = x.hash AND orders.approval_status <> x.new_status \
                 RETURNING orders.hash";
            let rows: Vec<HashRow> = sql_query(statement)
                .bind::<Text, _>(maker)
                .bind::<Text, _>(contract)
                .bind::<Text, _>(operator)
                .load(connection)?;
            Ok(rows.into_iter().map(|row| row.hash).collect())
        })
        .await
        .context("error in recheck_buy_approval query")
    }

    /// Distinct conduits of a maker's open buy orders of one kind, for
    /// transfer-induced approval fan-out.
    pub async fn distinct_buy_conduits(
        &self,
        maker: String,
        kind: String,
    ) -> AnyResult<Vec<String>> {
        self.with_connection("distinct_buy_conduits", move |connection| {
            let rows: Vec<ScalarTextRow> = sql_query(
                "SELECT DISTINCT conduit AS value FROM orders \
                 WHERE maker = $1 AND side = 'buy' AND kind = $2 \
                   AND conduit IS NOT NULL \
                   AND fillability_status IN ('fillable', 'no-balance')",
            )
            .bind::<Text, _>(maker)
            .bind::<Text, _>(kind)
            .load(connection)?;
            Ok(rows.into_iter().filter_map(|row| row.value).collect())
        })
        .await
        .context("error in distinct_buy_conduits query")
    }

    /// Mark both sides of a match as filled. Returns the hashes touched.
    pub async fn apply_fill(
        &self,
        buy_hash: String,
        sell_hash: String,
        now: i64,
    ) -> AnyResult<Vec<String>> {
        self.with_connection("apply_fill", move |connection| {
            let rows: Vec<HashRow> = sql_query(
                "UPDATE orders SET fillability_status = 'filled', quantity_remaining = '0', \
                   expiration = $3, updated_at = now() \
                 WHERE hash IN ($1, $2) AND fillability_status <> 'filled' \
                 RETURNING hash",
            )
            .bind::<Text, _>(buy_hash)
            .bind::<Text, _>(sell_hash)
            .bind::<BigInt, _>(now)
            .load(connection)?;
            Ok(rows.into_iter().map(|row| row.hash).collect())
        })
        .await
        .context("error in apply_fill query")
    }

    pub async fn is_cancelled(&self, order_hash: String) -> AnyResult<bool> {
        self.with_connection("is_cancelled", move |connection| {
            let rows: Vec<CountRow> =
                sql_query("SELECT count(*) AS count FROM cancel_events WHERE order_hash = $1")
                    .bind::<Text, _>(order_hash)
                    .load(connection)?;
            Ok(rows.first().map_or(0, |row| row.count) > 0)
        })
        .await
        .context("error in is_cancelled query")
    }

    pub async fn fill_count(&self, order_hash: String) -> AnyResult<i64> {
        self.with_connection("fill_count", move |connection| {
            let rows: Vec<CountRow> = sql_query(
                "SELECT count(*) AS count FROM fill_events \
                 WHERE buy_order_hash = $1 OR sell_order_hash = $1",
            )
            .bind::<Text, _>(order_hash)
            .load(connection)?;
            Ok(rows.first().map_or(0, |row| row.count))
        })
        .await
        .context("error in fill_count query")
    }

    /// The highest bulk-cancel nonce threshold a maker has set, if any.
    pub async fn max_bulk_min_nonce(&self, maker: String) -> AnyResult<Option<String>> {
        self.with_connection("max_bulk_min_nonce", move |connection| {
            let rows: Vec<ScalarTextRow> = sql_query(
                "SELECT max(min_nonce::numeric)::text AS value \
                 FROM bulk_cancel_events WHERE maker = $1",
            )
            .bind::<Text, _>(maker)
            .load(connection)?;
            Ok(rows.into_iter().next().and_then(|row| row.value))
        })
        .await
        .context("error in max_bulk_min_nonce query")
    }

    pub async fn nft_balance(
        &self,
        contract: String,
        token_id: String,
        owner: String,
    ) -> AnyResult<String> {
        self.with_connection("nft_balance", move |connection| {
            let rows: Vec<ScalarTextRow> = sql_query(
                "SELECT coalesce((SELECT amount FROM nft_balances \
                   WHERE contract = $1 AND token_id = $2 AND owner = $3), '0') AS value",
            )
            .bind::<Text, _>(contract)
            .bind::<Text, _>(token_id)
            .bind::<Text, _>(owner)
            .load(connection)?;
            Ok(rows
                .into_iter()
                .next()
                .and_then(|row| row.value)
                .unwrap_or_else(|| "0".to_owned()))
        })
        .await
        .context("error in nft_balance query")
    }

    pub async fn ft_balance(&self, contract: String, owner: String) -> AnyResult<String> {
        self.with_connection("ft_balance", move |connection| {
            let rows: Vec<ScalarTextRow> = sql_query(
                "SELECT coalesce((SELECT amount FROM ft_balances \
                   WHERE contract = $1 AND owner = $2), '0') AS value",
            )
            .bind::<Text, _>(contract)
            .bind::<Text, _>(owner)
            .load(connection)?;
            Ok(rows
                .into_iter()
                .next()
                .and_then(|row| row.value)
                .unwrap_or_else(|| "0".to_owned()))
        })
        .await
        .context("error in ft_balance query")
    }

    pub async fn ft_allowance(
        &self,
        contract: String,
        owner: String,
        spender: String,
    ) -> AnyResult<String> {
        self.with_connection("ft_allowance", move |connection| {
            let rows: Vec<ScalarTextRow> = sql_query(
                "SELECT coalesce((SELECT amount FROM ft_approvals \
                   WHERE contract = $1 AND owner = $2 AND spender = $3), '0') AS value",
            )
            .bind::<Text, _>(contract)
            .bind::<Text, _>(owner)
            .bind::<Text, _>(spender)
            .load(connection)?;
            Ok(rows
                .into_iter()
                .next()
                .and_then(|row| row.value)
                .unwrap_or_else(|| "0".to_owned()))
        })
        .await
        .context("error in ft_allowance query")
    }

    /// Latest operator approval state derived from the append-only log.
    pub async fn latest_nft_approval(
        &self,
        contract: String,
        owner: String,
        operator: String,
    ) -> AnyResult<bool> {
        self.with_connection("latest_nft_approval", move |connection| {
            let rows: Vec<ScalarBoolRow> = sql_query(
                "SELECT coalesce((SELECT approved FROM nft_approval_events \
                   WHERE contract = $1 AND owner = $2 AND operator = $3 \
                   ORDER BY block DESC, log_index DESC LIMIT 1), false) AS value",
            )
            .bind::<Text, _>(contract)
            .bind::<Text, _>(owner)
            .bind::<Text, _>(operator)
            .load(connection)?;
            Ok(rows.first().map_or(false, |row| row.value))
        })
        .await
        .context("error in latest_nft_approval query")
    }
}
