#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

use anyhow::{Context as _, Result as AnyResult};
use dotenv::dotenv;
use structopt::StructOpt;
use tokio::{runtime, spawn, sync::oneshot};
use tracing::info;

use order_indexer::logging::LogOptions;

#[derive(StructOpt)]
struct Options {
    #[structopt(flatten)]
    log: LogOptions,

    #[structopt(flatten)]
    app: order_indexer::Options,
}

fn main() -> AnyResult<()> {
    dotenv().ok();
    let options = Options::from_args();

    // Start log system
    options.log.init()?;

    // Launch Tokio runtime
    runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Error creating Tokio runtime")?
        .block_on(async {
            let (send, shutdown) = oneshot::channel();
            spawn(async move {
                tokio::signal::ctrl_c().await.unwrap();
                let _result = send.send(());
            });

            order_indexer::main(options.app, shutdown).await
        })?;

    // Terminate successfully
    info!("program terminating normally");
    Ok(())
}
