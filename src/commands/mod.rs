pub mod ack;
pub mod kill;
pub mod list;
pub mod new;
pub mod run;
pub mod status;

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::domain::instance::Instance;
use crate::error::DeckError;
use crate::infra::store::Store;

/// Resolve a session id or unique id prefix to a full instance row.
pub fn resolve_instance(store: &Arc<Store>, id: &str) -> Result<Instance, DeckError> {
    if let Some(inst) = store.get_instance(id)? {
        return Ok(inst);
    }
    let matches: Vec<Instance> = store
        .list_instances()?
        .into_iter()
        .filter(|i| i.id.starts_with(id) || i.title == id)
        .collect();
    match matches.len() {
        1 => Ok(matches.into_iter().next().unwrap()),
        0 => Err(DeckError::InstanceNotFound(id.to_string())),
        _ => Err(DeckError::User(format!(
            "'{id}' is ambiguous ({} sessions match)",
            matches.len()
        ))),
    }
}

pub fn open_store(config: &GlobalConfig) -> Result<Arc<Store>, DeckError> {
    let path = config
        .store_path
        .clone()
        .unwrap_or_else(Store::default_path);
    Ok(Arc::new(Store::open(&path)?))
}
