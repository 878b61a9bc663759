use crate::commands::{open_store, resolve_instance};
use crate::config::GlobalConfig;
use crate::error::DeckError;

/// Acknowledge from the CLI. The flag is written to the store and the
/// beacon bumped; any running engine replicates it on its next tick.
pub async fn execute(id: String, config: &GlobalConfig) -> Result<(), DeckError> {
    let store = open_store(config)?;
    let instance = resolve_instance(&store, &id)?;
    store.set_acknowledged(&instance.id, true)?;
    store.touch()?;
    println!("Acknowledged '{}'", instance.title);
    Ok(())
}
