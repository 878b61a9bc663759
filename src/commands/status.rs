use std::sync::Arc;

use crate::commands::{open_store, resolve_instance};
use crate::config::GlobalConfig;
use crate::error::DeckError;
use crate::infra::pipe_manager::PipeManager;
use crate::infra::tmux::TmuxDriver;
use crate::patterns;
use crate::session::Session;

/// One-shot status check: classify the session right now instead of
/// reading the possibly-stale store row.
pub async fn execute(id: String, json: bool, config: &GlobalConfig) -> Result<(), DeckError> {
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

    let status = session.get_status().await;
    pipes.close().await;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "id": instance.id,
                "title": instance.title,
                "tool": instance.tool.key(),
                "status": status.as_str(),
                "acknowledged": session.is_acknowledged(),
                "tmux_session": instance.tmux_session,
            })
        );
    } else {
        println!("{}: {status}", instance.title);
    }
    Ok(())
}
