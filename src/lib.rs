//! Agent Deck: a terminal-session manager for AI coding agents.
//!
//! The library is the session-state engine: tmux driver, control-mode
//! pipes, pattern-based status classification, the shared SQLite store,
//! and the scheduler that ties them together. UI front-ends embed this
//! crate; the `deck` binary runs the engine headless.

pub mod cli;
pub mod commands;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod patterns;
pub mod scheduler;
pub mod session;
