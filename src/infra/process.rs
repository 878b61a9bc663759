//! Process-tree supervision for pane children.
//!
//! Some CLI agents ignore the SIGHUP tmux sends when a pane dies, leaving
//! orphans. Killing a session therefore snapshots the pane's process tree
//! first, then verifies the snapshot is gone, escalating signals.

use std::time::Duration;
use tracing::{debug, warn};

/// Command names we are willing to signal during post-kill verification.
/// Guards against PID reuse: a recycled PID whose command is not on this
/// list is left alone.
const KILL_WHITELIST: [&str; 7] = ["claude", "node", "zsh", "bash", "sh", "cat", "npm"];

/// Maximum recursion depth when walking the process tree.
const MAX_TREE_DEPTH: usize = 8;

/// Snapshot a process tree: the root PID plus every descendant reachable
/// through the parent→children table. Must run *before* the kill; the
/// table is gone afterwards.
pub fn collect_tree(root: u32) -> Vec<u32> {
    let mut pids = vec![root];
    if !collect_children_procfs(root, &mut pids, 0) {
        collect_children_pgrep(root, &mut pids, 0);
    }
    pids
}

/// Walk `/proc/<pid>/task/<pid>/children` (Linux). Returns false when
/// /proc is unavailable so the caller can fall back to pgrep.
fn collect_children_procfs(pid: u32, pids: &mut Vec<u32>, depth: usize) -> bool {
    if depth >= MAX_TREE_DEPTH {
        return true;
    }
    let path = format!("/proc/{pid}/task/{pid}/children");
    let Ok(children) = std::fs::read_to_string(&path) else {
        return false;
    };
    for child in children.split_whitespace() {
        if let Ok(child_pid) = child.parse::<u32>() {
            pids.push(child_pid);
            collect_children_procfs(child_pid, pids, depth + 1);
        }
    }
    true
}

/// `pgrep -P` fallback for hosts without /proc (macOS).
fn collect_children_pgrep(pid: u32, pids: &mut Vec<u32>, depth: usize) {
    if depth >= MAX_TREE_DEPTH {
        return;
    }
    let Ok(output) = std::process::Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output()
    else {
        return;
    };
    if !output.status.success() {
        return;
    }
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Ok(child_pid) = line.trim().parse::<u32>() {
            pids.push(child_pid);
            collect_children_pgrep(child_pid, pids, depth + 1);
        }
    }
}

/// The short command name of a live process, or None if it's gone.
pub fn command_name(pid: u32) -> Option<String> {
    if let Ok(comm) = std::fs::read_to_string(format!("/proc/{pid}/comm")) {
        return Some(comm.trim().to_string());
    }
    let output = std::process::Command::new("ps")
        .args(["-o", "comm=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

pub fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

pub fn is_whitelisted(name: &str) -> bool {
    // ps may report a path or a bracketed kernel thread name.
    let base = name.trim().rsplit('/').next().unwrap_or(name);
    KILL_WHITELIST.contains(&base)
}

fn signal_survivors(pids: &[u32], signal: i32) -> usize {
    let mut survivors = 0;
    for &pid in pids {
        if !is_alive(pid) {
            continue;
        }
        // Re-read the command name on every pass: the original process may
        // be gone and the PID recycled.
        match command_name(pid) {
            Some(name) if is_whitelisted(&name) => {
                debug!(pid, name, signal, "signalling pane descendant");
                unsafe {
                    libc::kill(pid as i32, signal);
                }
                survivors += 1;
            }
            Some(name) => {
                debug!(pid, name, "pid no longer matches whitelist, skipping");
            }
            None => {}
        }
    }
    survivors
}

/// Verify a previously captured process tree is dead, escalating
/// SIGHUP → SIGTERM → SIGKILL with short waits between stages.
pub async fn kill_tree_escalating(pids: Vec<u32>) {
    if signal_survivors(&pids, libc::SIGHUP) == 0 {
        return;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    if signal_survivors(&pids, libc::SIGTERM) == 0 {
        return;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let remaining = signal_survivors(&pids, libc::SIGKILL);
    if remaining > 0 {
        warn!(remaining, "pane descendants required SIGKILL");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist() {
        assert!(is_whitelisted("claude"));
        assert!(is_whitelisted("node"));
        assert!(is_whitelisted("/bin/bash"));
        assert!(is_whitelisted("npm"));
        assert!(!is_whitelisted("postgres"));
        assert!(!is_whitelisted("sshd"));
    }

    #[test]
    fn test_collect_tree_includes_root() {
        let me = std::process::id();
        let tree = collect_tree(me);
        assert!(tree.contains(&me));
    }

    #[test]
    fn test_own_process_alive_and_named() {
        let me = std::process::id();
        assert!(is_alive(me));
        assert!(command_name(me).is_some());
    }

    #[test]
    fn test_dead_pid_has_no_name() {
        // PID near the typical pid_max ceiling; vanishingly unlikely to
        // exist in a test environment.
        assert!(command_name(4_194_000).is_none() || !is_alive(4_194_000));
    }
}
