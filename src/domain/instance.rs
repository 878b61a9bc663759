use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::tool::Tool;

/// Prefix for every tmux session we own. Also used to recognize our
/// sessions in fleet-wide tmux queries.
pub const TMUX_PREFIX: &str = "agentdeck_";

/// Status of the agent inside a session, as classified from its pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Agent is actively working (busy pattern or spinner visible).
    Active,
    /// Agent is at a prompt and the user has not acknowledged it yet.
    Waiting,
    /// Agent is at a prompt and the user has seen it.
    Idle,
    /// Session was started recently and hasn't settled into a known state.
    Starting,
    /// The tmux session no longer exists.
    Inactive,
    /// The SQL default for uninitialized rows.
    #[default]
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Waiting => "waiting",
            Status::Idle => "idle",
            Status::Starting => "starting",
            Status::Inactive => "inactive",
            Status::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Status {
        match s {
            // "running" is the legacy spelling of active in old rows
            "active" | "running" => Status::Active,
            "waiting" => Status::Waiting,
            "idle" => Status::Idle,
            "starting" => Status::Starting,
            "inactive" => Status::Inactive,
            _ => Status::Error,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Worktree association for sessions running inside a git worktree.
/// Opaque to the engine; provisioning lives outside the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Worktree {
    pub path: String,
    pub repo: String,
    pub branch: String,
}

impl Worktree {
    pub fn is_empty(&self) -> bool {
        self.path.is_empty() && self.repo.is_empty() && self.branch.is_empty()
    }
}

/// One managed session: a row in the `instances` table plus the identity
/// needed to find its tmux session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub title: String,
    pub project_path: String,
    pub group_path: String,
    pub sort_order: i64,
    pub command: String,
    pub wrapper: String,
    pub tool: Tool,
    pub status: Status,
    pub tmux_session: String,
    pub created_at: i64,
    pub last_accessed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<Worktree>,
    /// Per-tool scratch data: detected session ids, last prompt, plugin
    /// names. The engine round-trips it without interpreting it.
    #[serde(default)]
    pub tool_data: serde_json::Value,
    pub acknowledged: bool,
}

pub const DEFAULT_GROUP: &str = "my-sessions";

impl Instance {
    pub fn new(title: &str, project_path: &str, command: &str) -> Self {
        let now = Utc::now().timestamp();
        let tool = Tool::from_command(command);
        Self {
            id: generate_id(),
            title: title.to_string(),
            project_path: project_path.to_string(),
            group_path: DEFAULT_GROUP.to_string(),
            sort_order: 0,
            command: command.to_string(),
            wrapper: String::new(),
            tool,
            status: Status::Error,
            tmux_session: derive_tmux_name(title),
            created_at: now,
            last_accessed: now,
            parent_session_id: None,
            worktree: None,
            tool_data: serde_json::json!({}),
            acknowledged: false,
        }
    }

    /// Assign a fresh tmux name. Used when session creation collides with
    /// an existing name and needs a new suffix.
    pub fn regenerate_tmux_name(&mut self) {
        self.tmux_session = derive_tmux_name(&self.title);
    }
}

/// A sidebar group of sessions. Pure metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub path: String,
    pub name: String,
    pub expanded: bool,
    pub sort_order: i64,
    pub default_path: String,
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Derive a host-unique tmux session name: prefix + sanitized title +
/// random 8-hex suffix.
pub fn derive_tmux_name(title: &str) -> String {
    let mut sanitized: String = title
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    sanitized.truncate(20);
    if sanitized.is_empty() {
        sanitized.push_str("session");
    }
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    format!("{TMUX_PREFIX}{sanitized}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_defaults() {
        let inst = Instance::new("My Session", "/tmp/proj", "claude");
        assert_eq!(inst.title, "My Session");
        assert_eq!(inst.tool, Tool::Claude);
        assert_eq!(inst.status, Status::Error);
        assert_eq!(inst.group_path, DEFAULT_GROUP);
        assert!(!inst.acknowledged);
        assert_eq!(inst.id.len(), 16);
        assert!(inst.tmux_session.starts_with(TMUX_PREFIX));
    }

    #[test]
    fn test_derive_tmux_name_sanitizes() {
        let name = derive_tmux_name("Fix: the bug!");
        assert!(name.starts_with("agentdeck_fix__the_bug_"));
        // prefix + sanitized + '_' + 8 hex
        let suffix = name.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_derive_tmux_name_unique() {
        assert_ne!(derive_tmux_name("same"), derive_tmux_name("same"));
    }

    #[test]
    fn test_derive_tmux_name_empty_title() {
        let name = derive_tmux_name("!!!");
        assert!(name.starts_with("agentdeck____"));
        let name = derive_tmux_name("");
        assert!(name.starts_with("agentdeck_session_"));
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for s in [
            Status::Active,
            Status::Waiting,
            Status::Idle,
            Status::Starting,
            Status::Inactive,
            Status::Error,
        ] {
            assert_eq!(Status::parse(s.as_str()), s);
        }
        // legacy spelling
        assert_eq!(Status::parse("running"), Status::Active);
        assert_eq!(Status::parse("garbage"), Status::Error);
    }

    #[test]
    fn test_instance_serialization_roundtrip() {
        let inst = Instance::new("t", "/p", "codex");
        let json = serde_json::to_string(&inst).unwrap();
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, inst.id);
        assert_eq!(back.tool, Tool::Codex);
        assert_eq!(back.status, Status::Error);
    }
}
