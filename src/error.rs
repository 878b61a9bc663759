use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeckError {
    #[error("tmux error: {0}")]
    Tmux(String),

    #[error("tmux session not found: {0}")]
    SessionNotFound(String),

    #[error("tmux session already exists: {0}")]
    SessionExists(String),

    #[error("pane capture timed out after {0} seconds")]
    CaptureTimeout(u64),

    #[error("control pipe is dead")]
    PipeDead,

    #[error("control pipe command timed out")]
    PipeTimeout,

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("database is busy")]
    Busy,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("tmux not installed. Install with: brew install tmux")]
    TmuxNotInstalled,

    #[error("{0}")]
    User(String),
}

impl DeckError {
    /// True when the error means the tmux target is gone for good, as
    /// opposed to a transient failure worth retrying.
    pub fn is_session_gone(&self) -> bool {
        match self {
            DeckError::SessionNotFound(_) => true,
            DeckError::Tmux(msg) => {
                msg.contains("can't find session") || msg.contains("session not found")
            }
            _ => false,
        }
    }
}
