use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::DeckError;
use crate::patterns::RawPatterns;

/// Global config: ~/.config/agent-deck/config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Scheduler tick in milliseconds.
    pub poll_interval_ms: u64,
    /// Heartbeats older than this are stale.
    pub heartbeat_timeout_secs: i64,
    /// Idle sessions poll every Nth tick.
    pub idle_poll_divisor: u64,
    /// Desktop notification when a session starts waiting.
    pub notify_on_waiting: bool,
    /// Extra tmux session options applied after the built-in batch.
    pub tmux_options: HashMap<String, String>,
    /// Per-tool pattern overrides, keyed by tool name.
    pub patterns: HashMap<String, PatternOverrides>,
    /// Override the state store location (mainly for tests).
    pub store_path: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            heartbeat_timeout_secs: 30,
            idle_poll_divisor: 4,
            notify_on_waiting: true,
            tmux_options: HashMap::new(),
            patterns: HashMap::new(),
            store_path: None,
        }
    }
}

/// User overrides for one tool's patterns. A present list *replaces* the
/// defaults (even when empty); `extra_*` lists append instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternOverrides {
    pub busy_patterns: Option<Vec<String>>,
    pub prompt_patterns: Option<Vec<String>>,
    /// Spinner glyphs as a string, one glyph per char.
    pub spinner_chars: Option<String>,
    pub whimsical_words: Option<Vec<String>>,
    pub extra_busy_patterns: Vec<String>,
    pub extra_prompt_patterns: Vec<String>,
    pub extra_spinner_chars: String,
}

impl PatternOverrides {
    pub fn to_raw(&self) -> RawPatterns {
        RawPatterns {
            busy_patterns: self.busy_patterns.clone(),
            prompt_patterns: self.prompt_patterns.clone(),
            spinner_chars: self.spinner_chars.as_ref().map(|s| s.chars().collect()),
            whimsical_words: self.whimsical_words.clone(),
            extra_busy_patterns: self.extra_busy_patterns.clone(),
            extra_prompt_patterns: self.extra_prompt_patterns.clone(),
            extra_spinner_chars: self.extra_spinner_chars.chars().collect(),
        }
    }
}

impl GlobalConfig {
    pub fn pattern_overrides_for(&self, tool_key: &str) -> Option<RawPatterns> {
        self.patterns.get(tool_key).map(|o| o.to_raw())
    }

    pub fn tmux_option_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .tmux_options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("agent-deck")
}

/// Load the global config, falling back to defaults when absent.
pub fn load_config() -> Result<GlobalConfig, DeckError> {
    let path = config_dir().join("config.toml");
    if !path.exists() {
        return Ok(GlobalConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| DeckError::Config(format!("Failed to read config: {e}")))?;
    toml::from_str(&content).map_err(|e| DeckError::Config(format!("Failed to parse config: {e}")))
}
