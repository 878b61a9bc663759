use std::sync::Arc;

use crate::commands::open_store;
use crate::config::GlobalConfig;
use crate::domain::instance::Instance;
use crate::error::DeckError;
use crate::infra::pipe_manager::PipeManager;
use crate::infra::tmux::TmuxDriver;
use crate::patterns;
use crate::session::Session;

pub async fn execute(
    title: String,
    command: String,
    path: Option<String>,
    group: Option<String>,
    config: &GlobalConfig,
) -> Result<(), DeckError> {
    let store = open_store(config)?;
    let driver = Arc::new(TmuxDriver::new());
    let pipes = PipeManager::new(driver.clone());

    let project_path = match path {
        Some(p) => p,
        None => std::env::current_dir()?.to_string_lossy().to_string(),
    };

    let mut instance = Instance::new(&title, &project_path, &command);
    if let Some(group) = group {
        instance.group_path = group;
    }

    let overrides = config.pattern_overrides_for(instance.tool.key());
    let resolved = patterns::resolve_for_tool(&instance.tool, overrides.as_ref());
    let session = Session::start(
        &mut instance,
        driver,
        pipes.clone(),
        resolved,
        config.tmux_option_pairs(),
    )
    .await?;

    instance.status = session.last_stable_status();
    store.save_instance(&instance)?;
    store.touch()?;
    pipes.close().await;

    println!("Created session '{title}'");
    println!("  id:    {}", instance.id);
    println!("  tmux:  {}", instance.tmux_session);
    println!("  tool:  {}", instance.tool);
    println!("\nAttach with: tmux attach -t {}", instance.tmux_session);
    Ok(())
}
