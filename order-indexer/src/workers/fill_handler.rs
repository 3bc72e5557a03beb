//! Applies `OrdersMatched` events to the order projection. The event row
//! itself is the fills-history record; this worker only projects it.

use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    hash_update::{HashUpdateJob, Trigger},
    Queues,
};
use crate::{
    db::Database,
    queue::{Job, JobHandler},
    utils::unix_now,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillJob {
    pub context:         String,
    pub buy_order_hash:  String,
    pub sell_order_hash: String,
}

impl Job for FillJob {
    const QUEUE: &'static str = "fill-handle";

    fn context(&self) -> String {
        self.context.clone()
    }
}

pub struct FillHandler {
    db:     Database,
    queues: Arc<Queues>,
}

impl FillHandler {
    #[must_use]
    pub fn new(db: Database, queues: Arc<Queues>) -> Self {
        Self { db, queues }
    }
}

#[async_trait]
impl JobHandler<FillJob> for FillHandler {
    async fn process(&self, job: FillJob) -> AnyResult<()> {
        let touched = self
            .db
            .apply_fill(
                job.buy_order_hash.clone(),
                job.sell_order_hash.clone(),
                unix_now(),
            )
            .await?;
        debug!(
            buy = %job.buy_order_hash,
            sell = %job.sell_order_hash,
            touched = touched.len(),
            "Applied fill"
        );
        // Both sides re-derive so any residual state (expiry, partially
        // observed history) is reconciled from the event log.
        for hash in [job.buy_order_hash, job.sell_order_hash] {
            self.queues
                .hash_update
                .enqueue(&HashUpdateJob {
                    context: format!("{}-{}", job.context, hash),
                    hash,
                    trigger: Trigger::Fill,
                })
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_fill_job_roundtrip() {
        let job = FillJob {
            context:         "0xtx-9".to_owned(),
            buy_order_hash:  "0xb".to_owned(),
            sell_order_hash: "0xs".to_owned(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert_eq!(serde_json::from_str::<FillJob>(&json).unwrap(), job);
    }
}
