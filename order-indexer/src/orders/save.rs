//! Order intake, second stage: derive the token set, attribute fees and
//! royalties, resolve the conduit and insert the order row.

use anyhow::{Error as AnyError, Result as AnyResult};
use chrono::offset::Utc;
use thiserror::Error;
use tracing::debug;
use web3::types::H256;
use wyvern::{Contracts, Side};

use super::{
    attribute_fees, order_value, ApprovalStatus, CandidateOrder, FillabilityStatus, RejectReason,
    Royalty,
};
use crate::{
    db::{Database, NewOrder, StoredTokenSet},
    token_sets::{merkle, TokenSet},
    utils::{parse_address, parse_u256},
};

#[derive(Debug, Error)]
pub enum Error {
    /// Terminal: the candidate itself is at fault.
    #[error("{0}")]
    Rejected(#[from] RejectReason),
    /// Transient: database or chain trouble, retryable.
    #[error(transparent)]
    Internal(#[from] AnyError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedOrder {
    pub hash:         H256,
    pub token_set_id: String,
}

/// Persist a filtered candidate. The insert is keyed on the order hash,
/// so replays refresh derived columns and nothing else.
pub async fn save(
    db: &Database,
    contracts: &Contracts,
    candidate: &CandidateOrder,
) -> Result<SavedOrder, Error> {
    let params = &candidate.order.order;
    let hash = candidate.order.hash();
    let contract = format!("{:?}", params.target.contract());

    let set = TokenSet::from(&params.target);
    let members = resolve_members(db, candidate, &set).await?;
    let stored = StoredTokenSet {
        id:          set.id(),
        label:       set.label().to_string(),
        label_hash:  format!("{:?}", set.label_hash()),
        merkle_root: set.merkle_root().map(|root| format!("{:?}", root)),
        set,
    };
    let token_set_id = stored.id.clone();
    db.save_token_set(stored, members).await.map_err(AnyError::from)?;

    let fees = attribute_fees(params, candidate.source);
    let royalty_info = royalty_info(db, &contract, fees.fee_bps, fees.source_bps).await?;

    let conduit = match params.side {
        Side::Sell => resolve_proxy(db, contracts, params.maker).await?,
        Side::Buy => Some(format!("{:?}", contracts.chain.token_transfer_proxy)),
    };

    #[allow(clippy::cast_possible_wrap)]
    let order = NewOrder {
        hash: format!("{:?}", hash),
        kind: params.kind.as_str().to_owned(),
        side: params.side.as_str().to_owned(),
        maker: format!("{:?}", params.maker),
        price: params.base_price.to_string(),
        value: order_value(params).to_string(),
        quantity_remaining: "1".to_owned(),
        token_set_id: token_set_id.clone(),
        nonce: params.nonce.map(|nonce| nonce.to_string()),
        fee_bps: fees.fee_bps as i64,
        source_id: Some(format!("{:?}", fees.source_id)),
        royalty_info,
        raw_data: serde_json::to_string(params).map_err(AnyError::from)?,
        payment_token: format!("{:?}", params.payment_token),
        conduit,
        listing_time: params.listing_time as i64,
        expiration_time: params.expiration_time as i64,
        fillability_status: FillabilityStatus::NoBalance.as_str().to_owned(),
        approval_status: ApprovalStatus::NoApproval.as_str().to_owned(),
        expiration: params.expiration_time as i64,
        created_at: Utc::now(),
    };
    db.insert_order(order).await.map_err(AnyError::from)?;
    debug!(hash = ?hash, token_set = %token_set_id, "Saved order");

    Ok(SavedOrder {
        hash,
        token_set_id,
    })
}

/// Explicit membership for the set kinds that carry it. Range and
/// contract-wide sets are populated from the token inventory on first
/// reference instead.
async fn resolve_members(
    db: &Database,
    candidate: &CandidateOrder,
    set: &TokenSet,
) -> Result<Vec<(String, String)>, Error> {
    let params = &candidate.order.order;
    match set {
        TokenSet::Token { contract, token_id } => {
            Ok(vec![(format!("{:?}", contract), token_id.to_string())])
        }
        TokenSet::List { merkle_root } => {
            let attribute = candidate
                .attribute
                .as_ref()
                .ok_or(RejectReason::NoMatchingTokenSet)?;
            let tokens = db
                .attribute_tokens(
                    attribute.collection.clone(),
                    attribute.key.clone(),
                    attribute.value.clone(),
                )
                .await
                .map_err(AnyError::from)?;
            if tokens.is_empty() {
                return Err(RejectReason::NoMatchingTokenSet.into());
            }

            // Every member must live on the order's target contract.
            let expected = format!("{:?}", params.target.contract());
            if tokens.iter().any(|(contract, _)| *contract != expected) {
                return Err(RejectReason::NoMatchingTokenSet.into());
            }

            let ids = tokens
                .iter()
                .map(|(_, token_id)| parse_u256(token_id))
                .collect::<AnyResult<Vec<_>>>()?;
            if merkle::merkle_root(&ids) != *merkle_root {
                return Err(RejectReason::NoMatchingTokenSet.into());
            }
            Ok(tokens)
        }
        TokenSet::Range { .. } | TokenSet::Contract { .. } => Ok(Vec::new()),
    }
}

/// The fee share exceeding the marketplace share goes to the collection's
/// royalty recipient, when one is known.
async fn royalty_info(
    db: &Database,
    contract: &str,
    fee_bps: u64,
    source_bps: u64,
) -> Result<Option<String>, Error> {
    let royalty_bps = fee_bps.saturating_sub(source_bps);
    if royalty_bps == 0 {
        return Ok(None);
    }
    let recipient = db
        .collection_royalty_recipient(contract.to_owned())
        .await
        .map_err(AnyError::from)?;
    match recipient {
        Some(recipient) => {
            let royalties = vec![Royalty {
                recipient: parse_address(&recipient)?,
                bps:       royalty_bps,
            }];
            Ok(Some(serde_json::to_string(&royalties).map_err(AnyError::from)?))
        }
        None => Ok(None),
    }
}

/// The Wyvern conduit for sells is the maker's user proxy; look it up in
/// the cache, fall back to the registry, and remember the answer.
async fn resolve_proxy(
    db: &Database,
    contracts: &Contracts,
    maker: web3::types::Address,
) -> Result<Option<String>, Error> {
    let owner = format!("{:?}", maker);
    if let Some(proxy) = db.proxy_of(owner.clone()).await.map_err(AnyError::from)? {
        return Ok(Some(proxy));
    }
    let proxy = contracts
        .get_proxy(maker)
        .await
        .map_err(|error| AnyError::from(error).context("error reading proxy registry"))?;
    match proxy {
        Some(proxy) => {
            let proxy = format!("{:?}", proxy);
            db.save_proxy(owner, proxy.clone())
                .await
                .map_err(AnyError::from)?;
            Ok(Some(proxy))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_save_error_keeps_reject_reason_text() {
        let error = Error::from(RejectReason::NoMatchingTokenSet);
        assert_eq!(error.to_string(), "Order has no matching token set");
    }
}
