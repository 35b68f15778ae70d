pub mod app;
pub mod block_set;
pub mod catalog;
pub mod config;
pub mod db;
pub mod feed;
pub mod gate;
pub mod monitor;
pub mod settings;
pub mod usage;
mod utils;

use std::sync::Arc;

use anyhow::Result;
use tokio::{io::BufReader, sync::Mutex};

use app::{Runtime, SharedOutput};
use catalog::ProcessCatalog;
use config::AppConfig;
use settings::OfflineRemote;

/// Run against stdin/stdout until `quit` or end of input.
pub async fn run() -> Result<()> {
    utils::logging::init(config::debug_enabled());
    log::info!("ZenGate starting up...");

    let config = AppConfig::load()?;
    log::info!(
        "Using data dir {} for user {}",
        config.data_dir.display(),
        config.user_id
    );

    let output: SharedOutput = Arc::new(Mutex::new(Box::new(tokio::io::stdout())));
    let runtime = Runtime::start(
        config,
        Arc::new(OfflineRemote),
        Arc::new(ProcessCatalog::new()),
        output,
    )
    .await?;

    let served = runtime.serve(BufReader::new(tokio::io::stdin())).await;
    let stopped = runtime.shutdown().await;
    served.and(stopped)
}
