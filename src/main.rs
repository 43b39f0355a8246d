use anyhow::Result;
use tracing_subscriber::{self, EnvFilter};

use tradecell::config::Config;
use tradecell::{dispatch, server};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();

    if config.runtime_worker {
        // Job-worker process: the sandbox pool exists only here.
        tracing::info!(pool_size = config.pool_size, "starting in worker mode");
        dispatch::run_worker(config).await
    } else {
        server::run(config).await
    }
}
