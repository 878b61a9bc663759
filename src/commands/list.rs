use crate::commands::open_store;
use crate::config::GlobalConfig;
use crate::error::DeckError;

pub async fn execute(json: bool, config: &GlobalConfig) -> Result<(), DeckError> {
    let store = open_store(config)?;
    let instances = store.list_instances()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!("No sessions. Create one with: deck new <title> -c <command>");
        return Ok(());
    }

    println!(
        "{:<18} {:<22} {:<10} {:<9} {}",
        "ID", "TITLE", "TOOL", "STATUS", "GROUP"
    );
    for inst in &instances {
        let ack = if inst.acknowledged { " ✓" } else { "" };
        println!(
            "{:<18} {:<22} {:<10} {:<9} {}{ack}",
            inst.id,
            truncate(&inst.title, 22),
            inst.tool,
            inst.status,
            inst.group_path,
        );
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
