use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::commands::open_store;
use crate::config::GlobalConfig;
use crate::error::DeckError;
use crate::infra::pipe_manager::PipeManager;
use crate::infra::tmux::TmuxDriver;
use crate::scheduler::Scheduler;

/// Run the engine in the foreground until interrupted. The store, driver
/// and pipe manager are the process-wide services everything else
/// borrows; they are built exactly once, here.
pub async fn execute(config: &GlobalConfig) -> Result<(), DeckError> {
    let store = open_store(config)?;
    let driver = Arc::new(TmuxDriver::new());
    let pipes = PipeManager::new(driver.clone());
    let scheduler = Scheduler::new(store, driver, pipes, config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(true);
    engine
        .await
        .map_err(|e| DeckError::User(format!("engine task panicked: {e}")))??;
    Ok(())
}
