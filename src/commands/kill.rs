use std::sync::Arc;

use crate::commands::{open_store, resolve_instance};
use crate::config::GlobalConfig;
use crate::error::DeckError;
use crate::infra::pipe_manager::PipeManager;
use crate::infra::tmux::TmuxDriver;
use crate::patterns;
use crate::session::Session;

pub async fn execute(id: String, config: &GlobalConfig) -> Result<(), DeckError> {
    let store = open_store(config)?;
    let instance = resolve_instance(&store, &id)?;

    let driver = Arc::new(TmuxDriver::new());
    let pipes = PipeManager::new(driver.clone());
    let overrides = config.pattern_overrides_for(instance.tool.key());
    let resolved = patterns::resolve_for_tool(&instance.tool, overrides.as_ref());
    let session = Session::reconnect_lazy(
        &instance,
        driver,
        pipes.clone(),
        resolved,
        config.tmux_option_pairs(),
    );

    match session.kill().await {
        Ok(()) => {}
        // Killing an already-dead session is a successful removal.
        Err(e) if e.is_session_gone() => {}
        Err(e) => return Err(e),
    }
    pipes.close().await;

    store.delete_instance(&instance.id)?;
    store.touch()?;
    println!("Killed session '{}'", instance.title);
    Ok(())
}
