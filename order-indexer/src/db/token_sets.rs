//! Token sets, their memberships and the reference tables order intake
//! reads (indexed contracts, collections, attributes, proxies).

use anyhow::{Context as _, Result as AnyResult};
use diesel::{
    insert_into,
    prelude::*,
    sql_query,
    sql_types::Text,
};

use super::{
    attributes, collections, contracts, proxies, token_sets_schema as token_sets,
    token_sets_tokens, Database,
};
use crate::token_sets::TokenSet;

/// A token set as persisted: canonical id, label and membership source.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredTokenSet {
    pub id:          String,
    pub label:       String,
    pub label_hash:  String,
    pub merkle_root: Option<String>,
    pub set:         TokenSet,
}

impl Database {
    /// Insert a token set and, the first time it is referenced, its
    /// membership. Membership is write-once: replays and concurrent saves
    /// are no-ops.
    pub async fn save_token_set(
        &self,
        stored: StoredTokenSet,
        members: Vec<(String, String)>,
    ) -> AnyResult<()> {
        self.with_connection("save_token_set", move |connection| {
            let inserted = insert_into(token_sets::table)
                .values((
                    token_sets::id.eq(stored.id.clone()),
                    token_sets::label.eq(stored.label),
                    token_sets::label_hash.eq(stored.label_hash),
                    token_sets::merkle_root.eq(stored.merkle_root),
                ))
                .on_conflict(token_sets::id)
                .do_nothing()
                .execute(connection)?;
            if inserted == 0 {
                return Ok(());
            }

            match stored.set {
                TokenSet::Token { .. } | TokenSet::List { .. } => {
                    let rows: Vec<_> = members
                        .into_iter()
                        .map(|(contract, token_id)| {
                            (
                                token_sets_tokens::token_set_id.eq(stored.id.clone()),
                                token_sets_tokens::contract.eq(contract),
                                token_sets_tokens::token_id.eq(token_id),
                            )
                        })
                        .collect();
                    insert_into(token_sets_tokens::table)
                        .values(rows)
                        .on_conflict_do_nothing()
                        .execute(connection)?;
                }
                TokenSet::Range {
                    contract,
                    start_token_id,
                    end_token_id,
                } => {
                    sql_query(
                        "INSERT INTO token_sets_tokens (token_set_id, contract, token_id) \
                         SELECT $1, contract, token_id FROM tokens \
                         WHERE contract = $2 \
                           AND token_id::numeric BETWEEN $3::numeric AND $4::numeric \
                         ON CONFLICT DO NOTHING",
                    )
                    .bind::<Text, _>(stored.id)
                    .bind::<Text, _>(format!("{:?}", contract))
                    .bind::<Text, _>(start_token_id.to_string())
                    .bind::<Text, _>(end_token_id.to_string())
                    .execute(connection)?;
                }
                TokenSet::Contract { contract } => {
                    sql_query(
                        "INSERT INTO token_sets_tokens (token_set_id, contract, token_id) \
                         SELECT $1, contract, token_id FROM tokens WHERE contract = $2 \
                         ON CONFLICT DO NOTHING",
                    )
                    .bind::<Text, _>(stored.id)
                    .bind::<Text, _>(format!("{:?}", contract))
                    .execute(connection)?;
                }
            }
            Ok(())
        })
        .await
        .context("error in save_token_set query")
    }

    /// The indexed kind of a target contract (`erc721` / `erc1155`).
    pub async fn contract_kind(&self, address: String) -> AnyResult<Option<String>> {
        self.with_connection("contract_kind", move |connection| {
            contracts::table
                .find(address)
                .select(contracts::kind)
                .first::<String>(connection)
                .optional()
                .map_err(Into::into)
        })
        .await
        .context("error in contract_kind query")
    }

    pub async fn collection_royalty_recipient(
        &self,
        contract: String,
    ) -> AnyResult<Option<String>> {
        self.with_connection("collection_royalty_recipient", move |connection| {
            collections::table
                .find(contract)
                .select(collections::royalty_recipient)
                .first::<Option<String>>(connection)
                .optional()
                .map(Option::flatten)
                .map_err(Into::into)
        })
        .await
        .context("error in collection_royalty_recipient query")
    }

    /// All `(contract, tokenId)` pairs carrying an attribute.
    pub async fn attribute_tokens(
        &self,
        collection: String,
        key: String,
        value: String,
    ) -> AnyResult<Vec<(String, String)>> {
        self.with_connection("attribute_tokens", move |connection| {
            attributes::table
                .filter(attributes::collection.eq(collection))
                .filter(attributes::key.eq(key))
                .filter(attributes::value.eq(value))
                .select((attributes::contract, attributes::token_id))
                .load::<(String, String)>(connection)
                .map_err(Into::into)
        })
        .await
        .context("error in attribute_tokens query")
    }

    /// Cached Wyvern user proxy for a maker.
    pub async fn proxy_of(&self, owner: String) -> AnyResult<Option<String>> {
        self.with_connection("proxy_of", move |connection| {
            proxies::table
                .find(owner)
                .select(proxies::proxy)
                .first::<String>(connection)
                .optional()
                .map_err(Into::into)
        })
        .await
        .context("error in proxy_of query")
    }

    pub async fn save_proxy(&self, owner: String, proxy: String) -> AnyResult<()> {
        self.with_connection("save_proxy", move |connection| {
            insert_into(proxies::table)
                .values((proxies::owner.eq(owner), proxies::proxy.eq(proxy.clone())))
                .on_conflict(proxies::owner)
                .do_update()
                .set(proxies::proxy.eq(proxy))
                .execute(connection)?;
            Ok(())
        })
        .await
        .context("error in save_proxy query")
    }
}
