//! Subprocess tmux driver: session lifecycle, keystrokes, captures, and
//! fleet-wide caches. Shells out to `tmux`; the control pipe is the fast
//! path and falls back here.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::DeckError;
use crate::infra::process;

/// Hard ceiling on any tmux subprocess call. A capture that exceeds this
/// yields `CaptureTimeout`; callers must preserve previous state.
pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(3);

/// TTLs for the fleet caches. Refreshed once per scheduler tick, never
/// per session.
const ACTIVITY_TTL: Duration = Duration::from_secs(2);
const PANE_INFO_TTL: Duration = Duration::from_secs(4);

/// Payloads larger than this are sent in line-boundary chunks.
const SEND_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct PaneInfo {
    pub title: String,
    pub current_command: String,
}

struct TimedCache<T> {
    value: T,
    refreshed_at: Option<Instant>,
}

impl<T: Default> Default for TimedCache<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            refreshed_at: None,
        }
    }
}

impl<T: Clone> TimedCache<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        match self.refreshed_at {
            Some(at) if at.elapsed() < ttl => Some(self.value.clone()),
            _ => None,
        }
    }

    fn store(&mut self, value: T) {
        self.value = value;
        self.refreshed_at = Some(Instant::now());
    }
}

/// All subprocess tmux operations plus the process-wide fleet caches.
/// One instance per process, created at startup and shared via `Arc`.
pub struct TmuxDriver {
    /// Names registered at creation time so an existence check issued
    /// right after `create_session` doesn't race the server.
    known_sessions: Mutex<HashSet<String>>,
    activities: Mutex<TimedCache<HashMap<String, i64>>>,
    pane_info: Mutex<TimedCache<HashMap<String, PaneInfo>>>,
}

impl TmuxDriver {
    pub fn new() -> Self {
        Self {
            known_sessions: Mutex::new(HashSet::new()),
            activities: Mutex::new(TimedCache::default()),
            pane_info: Mutex::new(TimedCache::default()),
        }
    }

    /// Check if tmux is installed
    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    pub async fn session_exists(&self, name: &str) -> bool {
        if self.known_sessions.lock().unwrap().contains(name) {
            return true;
        }
        matches!(
            run_tmux_status(&["has-session", "-t", name]).await,
            Ok(true)
        )
    }

    /// Create a detached session and register its name immediately.
    pub async fn create_session(&self, name: &str, workdir: &str) -> Result<(), DeckError> {
        if self.session_exists(name).await {
            return Err(DeckError::SessionExists(name.to_string()));
        }
        debug!(session = name, workdir, "creating tmux session");
        run_tmux(&[
            "new-session", "-d", "-s", name, "-c", workdir, "-x", "200", "-y", "50",
        ])
        .await
        .map_err(|e| match e {
            DeckError::Tmux(msg) if msg.contains("duplicate session") => {
                DeckError::SessionExists(name.to_string())
            }
            DeckError::Io(io) => DeckError::SpawnFailed(io.to_string()),
            other => other,
        })?;
        self.known_sessions.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    /// Kill a session, then verify its pane's process tree actually died.
    /// The tree is snapshotted before the kill; verification runs in the
    /// background and escalates HUP → TERM → KILL.
    pub async fn kill_session(&self, name: &str) -> Result<(), DeckError> {
        let tree = self.pane_process_tree(name).await;
        let result = run_tmux(&["kill-session", "-t", name]).await;
        self.known_sessions.lock().unwrap().remove(name);
        if !tree.is_empty() {
            tokio::spawn(process::kill_tree_escalating(tree));
        }
        result
    }

    /// Replace the pane's process with a new command. Scrollback is
    /// cleared first so stale output can't satisfy busy patterns.
    pub async fn respawn_pane(&self, name: &str, command: &str) -> Result<(), DeckError> {
        let tree = self.pane_process_tree(name).await;
        run_tmux(&["clear-history", "-t", name]).await?;
        let wrapped = wrap_command(command);
        run_tmux(&["respawn-pane", "-k", "-t", name, &wrapped]).await?;
        if !tree.is_empty() {
            tokio::spawn(process::kill_tree_escalating(tree));
        }
        Ok(())
    }

    async fn pane_process_tree(&self, name: &str) -> Vec<u32> {
        let pid = match run_tmux_output(&["display-message", "-p", "-t", name, "#{pane_pid}"])
            .await
        {
            Ok(out) => out.trim().parse::<u32>().ok(),
            Err(_) => None,
        };
        pid.map(process::collect_tree).unwrap_or_default()
    }

    /// Send literal text. Payloads over 4 KiB are chunked at line
    /// boundaries with a 50 ms gap so the agent's input buffer keeps up.
    pub async fn send_keys(&self, name: &str, text: &str) -> Result<(), DeckError> {
        for (i, chunk) in split_chunks(text, SEND_CHUNK_BYTES).into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            run_tmux(&["send-keys", "-t", name, "-l", "--", chunk]).await?;
        }
        Ok(())
    }

    pub async fn send_enter(&self, name: &str) -> Result<(), DeckError> {
        run_tmux(&["send-keys", "-t", name, "Enter"]).await
    }

    /// Text and Enter as two sends, 100 ms apart. Literal sends arrive
    /// inside bracketed-paste markers and some TUI agents swallow an
    /// Enter that lands in the same chunk.
    pub async fn send_keys_and_enter(&self, name: &str, text: &str) -> Result<(), DeckError> {
        self.send_keys(name, text).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.send_enter(name).await
    }

    /// Capture the visible pane with wrapped lines joined. On timeout the
    /// caller must keep its previous state; the session is not dead.
    pub async fn capture_pane(&self, name: &str) -> Result<String, DeckError> {
        match run_tmux_output(&["capture-pane", "-t", name, "-p", "-J"]).await {
            Ok(content) => Ok(content),
            Err(DeckError::CaptureTimeout(s)) => Err(DeckError::CaptureTimeout(s)),
            Err(e) if e.is_session_gone() => Err(DeckError::SessionNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Last activity epoch of the session's most recent window, from the
    /// fleet cache when fresh.
    pub async fn get_window_activity(&self, name: &str) -> Option<i64> {
        if let Some(map) = self.activities.lock().unwrap().fresh(ACTIVITY_TTL) {
            return map.get(name).copied();
        }
        let out = run_tmux_output(&["display-message", "-p", "-t", name, "#{window_activity}"])
            .await
            .ok()?;
        out.trim().parse().ok()
    }

    pub fn cached_window_activity(&self, name: &str) -> Option<i64> {
        self.activities
            .lock()
            .unwrap()
            .fresh(ACTIVITY_TTL)
            .and_then(|m| m.get(name).copied())
    }

    /// Whether the session appears in the fresh fleet cache. `None` when
    /// the cache is stale and the caller must probe with a subprocess.
    pub fn session_in_fleet(&self, name: &str) -> Option<bool> {
        if self.known_sessions.lock().unwrap().contains(name) {
            return Some(true);
        }
        self.activities
            .lock()
            .unwrap()
            .fresh(ACTIVITY_TTL)
            .map(|m| m.contains_key(name))
    }

    pub fn cached_pane_info(&self, name: &str) -> Option<PaneInfo> {
        self.pane_info
            .lock()
            .unwrap()
            .fresh(PANE_INFO_TTL)
            .and_then(|m| m.get(name).cloned())
    }

    pub fn activity_cache_stale(&self) -> bool {
        self.activities
            .lock()
            .unwrap()
            .fresh(ACTIVITY_TTL)
            .is_none()
    }

    pub fn pane_info_cache_stale(&self) -> bool {
        self.pane_info.lock().unwrap().fresh(PANE_INFO_TTL).is_none()
    }

    /// Install a fleet-wide activity map (from a pipe query or a
    /// subprocess refresh).
    pub fn store_activities(&self, map: HashMap<String, i64>) {
        let mut known = self.known_sessions.lock().unwrap();
        known.retain(|name| map.contains_key(name));
        drop(known);
        self.activities.lock().unwrap().store(map);
    }

    pub fn store_pane_info(&self, map: HashMap<String, PaneInfo>) {
        self.pane_info.lock().unwrap().store(map);
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, DeckError> {
        let out = run_tmux_output(&["list-sessions", "-F", "#{session_name}"]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).collect())
    }

    /// One-shot subprocess refresh of the activity cache. Used when no
    /// control pipe is alive.
    pub async fn refresh_activities(&self) -> Result<(), DeckError> {
        let out = run_tmux_output(&[
            "list-windows",
            "-a",
            "-F",
            "#{session_name} #{window_activity}",
        ])
        .await?;
        self.store_activities(parse_activities(&out));
        Ok(())
    }

    pub async fn refresh_pane_info(&self) -> Result<(), DeckError> {
        let out = run_tmux_output(&[
            "list-panes",
            "-a",
            "-F",
            "#{session_name}\t#{pane_title}\t#{pane_current_command}",
        ])
        .await?;
        self.store_pane_info(parse_pane_info(&out));
        Ok(())
    }

    /// Baseline setup for a freshly created session, chained into a
    /// single tmux call. Mouse and clipboard for interactive use,
    /// passthrough and hyperlinks for agent TUIs, a deep scrollback, and
    /// a low escape-time so agents see Escape promptly.
    pub async fn apply_session_setup(&self, name: &str) -> Result<(), DeckError> {
        run_tmux(&[
            "set-option", "-t", name, "mouse", "on", ";",
            "set-option", "-t", name, "allow-passthrough", "on", ";",
            "set-option", "-t", name, "set-clipboard", "on", ";",
            "set-option", "-t", name, "history-limit", "10000", ";",
            "set-option", "-t", name, "status", "off", ";",
            "set-option", "-s", "escape-time", "10", ";",
            "set-option", "-as", "terminal-features", "*:hyperlinks",
        ])
        .await
    }

    /// Apply session options as a single chained tmux command: one
    /// subprocess instead of one per option.
    pub async fn set_options(&self, name: &str, options: &[(&str, &str)]) -> Result<(), DeckError> {
        if options.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = Vec::with_capacity(options.len() * 6);
        for (i, &(key, value)) in options.iter().enumerate() {
            if i > 0 {
                args.push(";");
            }
            args.extend_from_slice(&["set-option", "-t", name, key, value]);
        }
        run_tmux(&args).await
    }

    /// Pipe pane output to a log file, appending.
    pub async fn pipe_to_log(&self, name: &str, log_path: &str) -> Result<(), DeckError> {
        let shell_cmd = format!("cat >> '{log_path}'");
        run_tmux(&["pipe-pane", "-t", name, &shell_cmd]).await
    }
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `list-windows -a` output into session → max activity.
pub fn parse_activities(out: &str) -> HashMap<String, i64> {
    let mut map: HashMap<String, i64> = HashMap::new();
    for line in out.lines() {
        let mut parts = line.rsplitn(2, ' ');
        let (Some(ts), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(ts) = ts.trim().parse::<i64>() else {
            continue;
        };
        let entry = map.entry(name.to_string()).or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
    }
    map
}

/// Parse `list-panes -a` tab-separated output into session → pane info.
pub fn parse_pane_info(out: &str) -> HashMap<String, PaneInfo> {
    let mut map = HashMap::new();
    for line in out.lines() {
        let parts: Vec<&str> = line.splitn(3, '\t').collect();
        if parts.len() == 3 {
            map.insert(
                parts[0].to_string(),
                PaneInfo {
                    title: parts[1].to_string(),
                    current_command: parts[2].to_string(),
                },
            );
        }
    }
    map
}

/// Wrap commands that rely on bash-only substitution in `bash -ic` so
/// they work regardless of the user's shell.
pub fn wrap_command(command: &str) -> String {
    if command.contains("$(") || command.trim_start().starts_with("session_id=") {
        let escaped = command.replace('\'', "'\\''");
        format!("bash -ic '{escaped}'")
    } else {
        command.to_string()
    }
}

/// Split text into chunks of at most `max` bytes, breaking at line
/// boundaries whenever a line fits.
pub fn split_chunks(text: &str, max: usize) -> Vec<&str> {
    if text.len() <= max {
        return vec![text];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let remaining = &text[start..];
        if remaining.len() <= max {
            chunks.push(remaining);
            break;
        }
        let window = &remaining[..max];
        let cut = match window.rfind('\n') {
            Some(pos) if pos > 0 => pos + 1,
            _ => {
                // No line boundary: cut at a char boundary at or below max.
                let mut cut = max;
                while !remaining.is_char_boundary(cut) {
                    cut -= 1;
                }
                cut
            }
        };
        chunks.push(&remaining[..cut]);
        start += cut;
    }
    chunks
}

async fn run_tmux(args: &[&str]) -> Result<(), DeckError> {
    let output = tokio::time::timeout(
        SUBPROCESS_TIMEOUT,
        Command::new("tmux").args(args).output(),
    )
    .await
    .map_err(|_| DeckError::CaptureTimeout(SUBPROCESS_TIMEOUT.as_secs()))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(args = ?args, stderr = %stderr, "tmux command failed");
        return Err(DeckError::Tmux(stderr.trim().to_string()));
    }
    Ok(())
}

async fn run_tmux_output(args: &[&str]) -> Result<String, DeckError> {
    let output = tokio::time::timeout(
        SUBPROCESS_TIMEOUT,
        Command::new("tmux").args(args).output(),
    )
    .await
    .map_err(|_| DeckError::CaptureTimeout(SUBPROCESS_TIMEOUT.as_secs()))??;

    if !output.status.success() {
        return Err(DeckError::Tmux(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run tmux and report only whether it exited zero.
async fn run_tmux_status(args: &[&str]) -> Result<bool, DeckError> {
    let output = tokio::time::timeout(
        SUBPROCESS_TIMEOUT,
        Command::new("tmux").args(args).output(),
    )
    .await
    .map_err(|_| DeckError::CaptureTimeout(SUBPROCESS_TIMEOUT.as_secs()))??;
    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_command_bash_substitution() {
        assert_eq!(
            wrap_command("claude --resume $(cat id)"),
            "bash -ic 'claude --resume $(cat id)'"
        );
        assert_eq!(
            wrap_command("session_id=abc claude"),
            "bash -ic 'session_id=abc claude'"
        );
        assert_eq!(wrap_command("claude"), "claude");
    }

    #[test]
    fn test_wrap_command_escapes_quotes() {
        let wrapped = wrap_command("echo $(date '+%s')");
        assert_eq!(wrapped, "bash -ic 'echo $(date '\\''+%s'\\'')'");
    }

    #[test]
    fn test_split_chunks_small_passthrough() {
        assert_eq!(split_chunks("hello", 4096), vec!["hello"]);
    }

    #[test]
    fn test_split_chunks_breaks_at_lines() {
        let line = "x".repeat(30);
        let text = format!("{line}\n{line}\n{line}\n");
        let chunks = split_chunks(&text, 40);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.len() <= 40);
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_chunks_no_newline() {
        let text = "y".repeat(100);
        let chunks = split_chunks(&text, 40);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_parse_activities_takes_max() {
        let out = "agentdeck_a_12345678 100\nagentdeck_a_12345678 250\nother 50\n";
        let map = parse_activities(out);
        assert_eq!(map.get("agentdeck_a_12345678"), Some(&250));
        assert_eq!(map.get("other"), Some(&50));
    }

    #[test]
    fn test_parse_activities_name_with_spaces() {
        let map = parse_activities("my session 42\n");
        assert_eq!(map.get("my session"), Some(&42));
    }

    #[test]
    fn test_parse_pane_info() {
        let out = "sess1\t✳ Claude\tnode\nsess2\t\tzsh\n";
        let map = parse_pane_info(out);
        assert_eq!(map["sess1"].title, "✳ Claude");
        assert_eq!(map["sess1"].current_command, "node");
        assert_eq!(map["sess2"].title, "");
        assert_eq!(map["sess2"].current_command, "zsh");
    }

    #[test]
    fn test_timed_cache_expiry() {
        let mut cache: TimedCache<i32> = TimedCache::default();
        assert!(cache.fresh(Duration::from_secs(1)).is_none());
        cache.store(7);
        assert_eq!(cache.fresh(Duration::from_secs(1)), Some(7));
        assert!(cache.fresh(Duration::ZERO).is_none());
    }
}
