#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]
//! NFT marketplace order indexer and status engine.
//!
//! Ingests chain events (transfers, approvals, matches, cancels, nonce
//! bumps) and off-chain signed-order submissions, and maintains a
//! queryable projection of currently fillable orders. Status derivation
//! is idempotent and reconciled from the append-only event log, so
//! redelivery, out-of-order arrival and reorgs all converge to on-chain
//! truth.

#[macro_use]
extern crate diesel;

pub mod db;
pub mod events;
pub mod logging;
pub mod orders;
pub mod queue;
pub mod steps;
pub mod token_sets;
pub mod utils;
pub mod workers;

use std::sync::Arc;

use anyhow::{Context as _, Error as AnyError, Result as AnyResult};
use structopt::StructOpt;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::info;
use url::Url;
use web3::{transports::Http, Web3};
use wyvern::{ChainInfo, Contracts};

use crate::{
    events::Ingestor,
    orders::{CandidateOrder, RejectReason, SaveError, SavedOrder},
    workers::{HashUpdateJob, LogSink, Queues, RelayJob, Trigger},
};

#[derive(Debug, PartialEq, StructOpt)]
pub struct Options {
    #[structopt(flatten)]
    database: db::Options,

    #[structopt(flatten)]
    queue: queue::Options,

    #[structopt(flatten)]
    relay: workers::RelayOptions,

    /// Ethereum JSON-RPC endpoint.
    #[structopt(
        long,
        env = "ETHEREUM",
        default_value = "https://mainnet.infura.io/v3/"
    )]
    ethereum: Url,

    /// Chain id (1 = main net, 4 = rinkeby).
    #[structopt(long, env = "CHAIN_ID", default_value = "1")]
    chain_id: u64,

    /// Accept off-chain order submissions.
    #[structopt(
        long,
        env = "ACCEPT_ORDERS",
        parse(try_from_str),
        default_value = "true"
    )]
    accept_orders: bool,

    /// Run the background workers in this process.
    #[structopt(long, env = "MASTER", parse(try_from_str), default_value = "true")]
    master: bool,
}

/// Errors surfaced to the order submission surface.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Internal(#[from] AnyError),
}

#[derive(Debug, Default)]
pub struct IntakeOutcome {
    pub saved:   Vec<SavedOrder>,
    pub invalid: Vec<(CandidateOrder, RejectReason)>,
}

#[derive(Clone, Debug)]
pub struct App {
    pub db:        db::Database,
    pub contracts: Contracts,
    pub queues:    Arc<Queues>,
    pub ingestor:  Ingestor,
    accept_orders: bool,
}

impl App {
    pub async fn connect(options: Options) -> AnyResult<Self> {
        let db = db::Database::connect(options.database).await?;
        let redis = queue::connect(&options.queue).await?;

        info!("Connecting to Ethereum at {}", options.ethereum);
        let transport = Http::new(options.ethereum.as_str())
            .with_context(|| format!("error connecting to Ethereum at {}", options.ethereum))?;
        let contracts = Contracts::new(
            Web3::new(transport),
            ChainInfo::for_chain(options.chain_id),
        );

        let queues = Arc::new(Queues::new(redis));
        let ingestor = Ingestor::new(db.clone(), queues.clone());

        if options.master {
            workers::start(
                &queues,
                db.clone(),
                contracts.clone(),
                options.relay,
                options.chain_id,
                Box::new(LogSink),
            );
        }

        Ok(Self {
            db,
            contracts,
            queues,
            ingestor,
            accept_orders: options.accept_orders,
        })
    }

    /// Order intake: filter, save, and schedule the initial status
    /// derivation plus the off-chain relay for every accepted order.
    pub async fn submit_orders(
        &self,
        candidates: Vec<CandidateOrder>,
    ) -> Result<IntakeOutcome, IntakeError> {
        crate::require!(self.accept_orders, IntakeError::Unauthorized);
        let filtered = orders::filter(&self.db, &self.contracts.chain, candidates).await?;
        let mut outcome = IntakeOutcome {
            saved:   Vec::new(),
            invalid: filtered.invalid,
        };
        for candidate in filtered.valid {
            match orders::save(&self.db, &self.contracts, &candidate).await {
                Ok(saved) => {
                    let hash = format!("{:?}", saved.hash);
                    self.queues
                        .hash_update
                        .enqueue(&HashUpdateJob {
                            context: format!("new-order-{}", hash),
                            hash:    hash.clone(),
                            trigger: Trigger::NewOrder,
                        })
                        .await?;
                    self.queues
                        .relay
                        .enqueue(&RelayJob {
                            context: format!("relay-{}", hash),
                            order:   candidate.order.clone(),
                        })
                        .await?;
                    outcome.saved.push(saved);
                }
                Err(SaveError::Rejected(reason)) => outcome.invalid.push((candidate, reason)),
                Err(SaveError::Internal(error)) => return Err(error.into()),
            }
        }
        Ok(outcome)
    }
}

/// Run until the shutdown signal fires.
#[allow(clippy::missing_errors_doc)]
pub async fn main(options: Options, shutdown: oneshot::Receiver<()>) -> AnyResult<()> {
    let _app = App::connect(options).await?;
    info!("Order indexer started, waiting for shutdown signal");
    shutdown.await?;
    Ok(())
}
