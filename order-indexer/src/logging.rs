use anyhow::{Context as _, Result as AnyResult};
use structopt::StructOpt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Debug, PartialEq, StructOpt)]
pub struct LogOptions {
    /// Log filter directives, e.g. `info,order_indexer=debug`
    #[structopt(long, env = "LOG_FILTER", default_value = "info")]
    pub log_filter: String,

    /// Emit logs as JSON lines
    #[structopt(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl LogOptions {
    pub fn init(&self) -> AnyResult<()> {
        let filter = EnvFilter::try_new(&self.log_filter)
            .with_context(|| format!("invalid log filter {:?}", self.log_filter))?;
        if self.log_json {
            fmt().with_env_filter(filter).json().init();
        } else {
            fmt().with_env_filter(filter).init();
        }
        Ok(())
    }
}
