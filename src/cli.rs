use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "deck", version, about = "Terminal-session manager for AI coding agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the session-state engine in the foreground (default)
    Run,

    /// Create and start a new session
    New {
        /// Session title
        title: String,

        /// Command to run inside the session (defaults to a shell)
        #[arg(short, long, default_value = "")]
        command: String,

        /// Project directory for the session
        #[arg(short, long)]
        path: Option<String>,

        /// Group to file the session under
        #[arg(short, long)]
        group: Option<String>,
    },

    /// List all sessions
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one session's current status
    Status {
        /// Session id (or unique prefix)
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Kill a session and remove it
    Kill {
        /// Session id (or unique prefix)
        id: String,
    },

    /// Acknowledge a waiting session
    Ack {
        /// Session id (or unique prefix)
        id: String,
    },
}
