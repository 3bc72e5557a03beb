//! Off-chain relay of accepted orders: OpenSea-attributed orders are
//! posted to the OpenSea orderbook, and every order is handed to the
//! archival sink. The sink is fire-and-forget, at-least-once; consumers
//! must tolerate duplicates.

use anyhow::{anyhow, Context as _, Result as AnyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use structopt::StructOpt;
use tracing::{debug, info};
use wyvern::{SignedOrder, TargetSpec};

use crate::{
    orders::OPENSEA_FEE_RECIPIENT,
    queue::{Job, JobHandler},
};

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct RelayOptions {
    /// OpenSea API key, required for posting on main net.
    #[structopt(long, env = "OPENSEA_API_KEY", default_value = "")]
    pub opensea_api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayJob {
    pub context: String,
    pub order:   SignedOrder,
}

impl Job for RelayJob {
    const QUEUE: &'static str = "orders-relay";

    fn context(&self) -> String {
        self.context.clone()
    }
}

/// Downstream archival store. Loss is acceptable; duplication is the
/// consumer's problem.
#[async_trait]
pub trait ArchivalSink: Send + Sync + 'static {
    async fn store(&self, order: &SignedOrder) -> AnyResult<()>;
}

/// Default sink: log and drop. The real uploader is an external
/// collaborator consuming the same queue.
pub struct LogSink;

#[async_trait]
impl ArchivalSink for LogSink {
    async fn store(&self, order: &SignedOrder) -> AnyResult<()> {
        debug!(hash = ?order.hash(), "Order handed to archival sink");
        Ok(())
    }
}

pub struct RelayHandler {
    http:     reqwest::Client,
    options:  RelayOptions,
    chain_id: u64,
    sink:     Box<dyn ArchivalSink>,
}

impl RelayHandler {
    #[must_use]
    pub fn new(options: RelayOptions, chain_id: u64, sink: Box<dyn ArchivalSink>) -> Self {
        Self {
            http: reqwest::Client::new(),
            options,
            chain_id,
            sink,
        }
    }

    fn orderbook_url(&self) -> &'static str {
        if self.chain_id == 1 {
            "https://api.opensea.io/wyvern/v1/orders/post"
        } else {
            "https://testnets-api.opensea.io/wyvern/v1/orders/post"
        }
    }

    /// The OpenSea order shape: the raw order fields plus the protocol
    /// constants and asset metadata the orderbook expects.
    fn orderbook_body(order: &SignedOrder) -> AnyResult<JsonValue> {
        let (contract, token_id) = match order.order.target {
            TargetSpec::SingleToken { contract, token_id }
            | TargetSpec::SingleTokenV2 { contract, token_id } => (contract, token_id),
            _ => return Err(anyhow!("only single-token orders can be relayed")),
        };
        let mut body = serde_json::to_value(order)?;
        let object = body
            .as_object_mut()
            .ok_or_else(|| anyhow!("order did not serialize to an object"))?;
        object.insert("makerProtocolFee".to_owned(), json!("0"));
        object.insert("takerProtocolFee".to_owned(), json!("0"));
        object.insert("makerReferrerFee".to_owned(), json!("0"));
        object.insert("feeMethod".to_owned(), json!(1));
        object.insert("quantity".to_owned(), json!("1"));
        object.insert(
            "metadata".to_owned(),
            json!({
                "asset": {
                    "id": token_id.to_string(),
                    "address": contract,
                },
                "schema": "ERC721",
            }),
        );
        object.insert("hash".to_owned(), json!(order.hash()));
        Ok(body)
    }

    async fn post_to_opensea(&self, order: &SignedOrder) -> AnyResult<()> {
        let body = Self::orderbook_body(order)?;
        let mut request = self.http.post(self.orderbook_url()).json(&body);
        if self.chain_id == 1 && !self.options.opensea_api_key.is_empty() {
            request = request.header("X-Api-Key", &self.options.opensea_api_key);
        }
        let response = request
            .send()
            .await
            .context("error posting order to OpenSea")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("OpenSea rejected order: {} {}", status, text));
        }
        info!(hash = ?order.hash(), "Order relayed to OpenSea");
        Ok(())
    }
}

#[async_trait]
impl JobHandler<RelayJob> for RelayHandler {
    async fn process(&self, job: RelayJob) -> AnyResult<()> {
        if job.order.order.fee_recipient == *OPENSEA_FEE_RECIPIENT {
            self.post_to_opensea(&job.order).await?;
        }
        self.sink.store(&job.order).await
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wyvern::Signature;

    use super::*;
    use crate::orders::test::example_params;

    fn signed_example() -> SignedOrder {
        SignedOrder {
            order:     example_params(),
            signature: Signature::default(),
        }
    }

    #[test]
    fn test_orderbook_body_shape() {
        let order = signed_example();
        let body = RelayHandler::orderbook_body(&order).unwrap();
        assert_eq!(body["makerProtocolFee"], json!("0"));
        assert_eq!(body["takerProtocolFee"], json!("0"));
        assert_eq!(body["feeMethod"], json!(1));
        assert_eq!(body["quantity"], json!("1"));
        assert_eq!(body["metadata"]["schema"], json!("ERC721"));
        assert_eq!(body["metadata"]["asset"]["id"], json!("7"));
        assert_eq!(body["hash"], serde_json::to_value(order.hash()).unwrap());
        // The raw order fields ride along at the top level.
        assert_eq!(body["basePrice"], json!("1000000000000000000"));
    }

    #[test]
    fn test_contract_wide_orders_are_not_relayable() {
        let mut order = signed_example();
        order.order.target = TargetSpec::ContractWide {
            contract: order.order.target.contract(),
        };
        assert!(RelayHandler::orderbook_body(&order).is_err());
    }
}
