//! Ack-signal file watcher. tmux key-bindings write a session id to
//! `~/.agent-deck/ack-signal`; the controlling process picks it up here
//! and acknowledges the session without any IPC.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub fn signal_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-deck")
        .join("ack-signal")
}

pub struct AckSignalWatcher {
    _watcher: RecommendedWatcher,
}

impl AckSignalWatcher {
    /// Watch the signal file's directory; each write delivers the file's
    /// content (a session id) on the channel and truncates the file.
    pub fn start(tx: mpsc::UnboundedSender<String>) -> Result<Self, notify::Error> {
        let path = signal_path();
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        info!(path = %path.display(), "watching ack-signal file");

        let signal_file = path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                let Ok(event) = res else { return };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                if !event.paths.iter().any(|p| p == &signal_file) {
                    return;
                }
                let Ok(content) = std::fs::read_to_string(&signal_file) else {
                    return;
                };
                let id = content.trim().to_string();
                if id.is_empty() {
                    return;
                }
                debug!(session_id = %id, "ack signal received");
                let _ = std::fs::write(&signal_file, "");
                let _ = tx.send(id);
            },
            Config::default(),
        )?;

        // Watch the parent so creation of the file itself is seen.
        let dir = path.parent().unwrap_or(&path).to_path_buf();
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self { _watcher: watcher })
    }
}
