use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of agent (or plain shell) running inside a session's pane.
/// Determines which busy/prompt patterns apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Tool {
    Claude,
    Gemini,
    Opencode,
    Codex,
    Shell,
    Custom(String),
}

impl Tool {
    /// Stable string key used in the store and in pattern configuration.
    pub fn key(&self) -> &str {
        match self {
            Tool::Claude => "claude",
            Tool::Gemini => "gemini",
            Tool::Opencode => "opencode",
            Tool::Codex => "codex",
            Tool::Shell => "shell",
            Tool::Custom(name) => name,
        }
    }

    /// Infer the tool from the command a session was started with.
    /// `claude --resume abc` → Claude; an empty command means a bare shell.
    pub fn from_command(command: &str) -> Tool {
        let binary = command
            .split_whitespace()
            .next()
            .map(|w| w.rsplit('/').next().unwrap_or(w))
            .unwrap_or("");
        match binary {
            "" => Tool::Shell,
            "claude" => Tool::Claude,
            "gemini" => Tool::Gemini,
            "opencode" => Tool::Opencode,
            "codex" => Tool::Codex,
            _ => Tool::Shell,
        }
    }

    pub fn builtin_keys() -> &'static [&'static str] {
        &["claude", "gemini", "opencode", "codex", "shell"]
    }
}

impl From<String> for Tool {
    fn from(s: String) -> Self {
        match s.as_str() {
            "claude" => Tool::Claude,
            "gemini" => Tool::Gemini,
            "opencode" => Tool::Opencode,
            "codex" => Tool::Codex,
            "shell" | "" => Tool::Shell,
            _ => Tool::Custom(s),
        }
    }
}

impl From<Tool> for String {
    fn from(t: Tool) -> String {
        t.key().to_string()
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
