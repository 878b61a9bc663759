use agent_deck::cli::{Cli, Commands};
use agent_deck::error::DeckError;
use agent_deck::{commands, config, infra};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing();

    preflight_checks()?;

    let cfg = config::load_config()?;
    info!(command = ?cli.command, "deck started");

    match cli.command {
        None | Some(Commands::Run) => {
            commands::run::execute(&cfg).await?;
        }

        Some(Commands::New {
            title,
            command,
            path,
            group,
        }) => {
            commands::new::execute(title, command, path, group, &cfg).await?;
        }

        Some(Commands::List { json }) => {
            commands::list::execute(json, &cfg).await?;
        }

        Some(Commands::Status { id, json }) => {
            commands::status::execute(id, json, &cfg).await?;
        }

        Some(Commands::Kill { id }) => {
            commands::kill::execute(id, &cfg).await?;
        }

        Some(Commands::Ack { id }) => {
            commands::ack::execute(id, &cfg).await?;
        }
    }

    Ok(())
}

fn preflight_checks() -> Result<(), DeckError> {
    if !infra::tmux::TmuxDriver::is_available() {
        return Err(DeckError::TmuxNotInstalled);
    }
    Ok(())
}

/// Initialize tracing with a file appender under ~/.agent-deck. Returns
/// a guard that must be held for the lifetime of the program (dropping
/// it flushes the writer).
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let log_dir = dirs::home_dir()?.join(".agent-deck");
    if std::fs::create_dir_all(&log_dir).is_err() {
        return None;
    }

    let file_appender = tracing_appender::rolling::never(&log_dir, "agent-deck.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    Some(guard)
}
