//! Queue consumers and the explicit queue registry.

pub mod fill_handler;
pub mod hash_update;
pub mod maker_update;
pub mod relay;

use std::sync::Arc;

use redis::aio::ConnectionManager;
use wyvern::Contracts;

pub use self::{
    fill_handler::{FillHandler, FillJob},
    hash_update::{HashUpdateHandler, HashUpdateJob, Trigger},
    maker_update::{MakerUpdateHandler, MakerUpdateJob},
    relay::{ArchivalSink, LogSink, RelayHandler, RelayJob, RelayOptions},
};
use crate::{
    db::Database,
    queue::{JobQueue, QueueOptions},
};

/// Per-worker concurrency caps.
const HASH_UPDATE_CONCURRENCY: usize = 20;
const MAKER_UPDATE_CONCURRENCY: usize = 30;
const FILL_HANDLE_CONCURRENCY: usize = 10;
const RELAY_CONCURRENCY: usize = 5;

/// All queues, constructed once and passed explicitly to whoever
/// enqueues or consumes.
#[derive(Debug, Clone)]
pub struct Queues {
    pub hash_update:  JobQueue<HashUpdateJob>,
    pub maker_update: JobQueue<MakerUpdateJob>,
    pub fill_handle:  JobQueue<FillJob>,
    pub relay:        JobQueue<RelayJob>,
}

impl Queues {
    #[must_use]
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            hash_update:  JobQueue::new(redis.clone(), QueueOptions::default()),
            maker_update: JobQueue::new(redis.clone(), QueueOptions::default()),
            fill_handle:  JobQueue::new(redis.clone(), QueueOptions::default()),
            relay:        JobQueue::new(redis, QueueOptions::default()),
        }
    }
}

/// Register the worker closures. Only processes with the `master` role
/// do background work; everyone else only enqueues.
pub fn start(
    queues: &Arc<Queues>,
    db: Database,
    contracts: Contracts,
    relay_options: RelayOptions,
    chain_id: u64,
    sink: Box<dyn ArchivalSink>,
) {
    queues.hash_update.run(
        Arc::new(HashUpdateHandler::new(db.clone())),
        HASH_UPDATE_CONCURRENCY,
    );
    queues.maker_update.run(
        Arc::new(MakerUpdateHandler::new(
            db.clone(),
            contracts,
            queues.clone(),
        )),
        MAKER_UPDATE_CONCURRENCY,
    );
    queues.fill_handle.run(
        Arc::new(FillHandler::new(db, queues.clone())),
        FILL_HANDLE_CONCURRENCY,
    );
    queues.relay.run(
        Arc::new(RelayHandler::new(relay_options, chain_id, sink)),
        RELAY_CONCURRENCY,
    );
}
