//! The tick loop: one cooperative clock that heartbeats the process,
//! refreshes fleet caches, drives per-session classification, replicates
//! through the store, and reacts to pipe output events.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::domain::instance::{Instance, Status};
use crate::error::DeckError;
use crate::infra::pipe_manager::PipeManager;
use crate::infra::signal::AckSignalWatcher;
use crate::infra::store::Store;
use crate::infra::tmux::TmuxDriver;
use crate::patterns;
use crate::session::Session;

/// Primary election re-runs every this many ticks.
const ELECTION_EVERY_TICKS: u64 = 20;

pub struct Scheduler {
    store: Arc<Store>,
    driver: Arc<TmuxDriver>,
    pipes: Arc<PipeManager>,
    config: GlobalConfig,
    /// Live sessions keyed by instance id.
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// Tmux names flagged by pipe output since the last tick; their next
    /// poll ignores tier throttling.
    poll_now: Arc<Mutex<HashSet<String>>>,
    /// Last fleet activity timestamp each session was polled at.
    seen_activity: Mutex<HashMap<String, i64>>,
    is_primary: AtomicBool,
    last_seen_modified: Mutex<i64>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        driver: Arc<TmuxDriver>,
        pipes: Arc<PipeManager>,
        config: GlobalConfig,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            store,
            driver,
            pipes: pipes.clone(),
            config,
            sessions: Mutex::new(HashMap::new()),
            poll_now: Arc::new(Mutex::new(HashSet::new())),
            seen_activity: Mutex::new(HashMap::new()),
            is_primary: AtomicBool::new(false),
            last_seen_modified: Mutex::new(0),
        });

        let poll_now = scheduler.poll_now.clone();
        pipes.set_output_callback(Arc::new(move |tmux_name: &str| {
            poll_now.lock().unwrap().insert(tmux_name.to_string());
        }));

        scheduler
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::Relaxed)
    }

    /// Register, load the fleet, then tick until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), DeckError> {
        self.store.register_process(false)?;
        let won = self
            .store
            .elect_primary(self.config.heartbeat_timeout_secs)?;
        self.is_primary.store(won, Ordering::Relaxed);
        info!(primary = won, "scheduler started");

        self.reload_from_store().await?;

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let _ack_watcher = match AckSignalWatcher::start(ack_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "ack-signal watcher unavailable");
                None
            }
        };

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tick += 1;
                    if let Err(e) = self.run_tick(tick).await {
                        warn!(error = %e, "tick failed");
                    }
                }
                Some(session_id) = ack_rx.recv() => {
                    self.acknowledge(&session_id);
                }
                _ = shutdown.changed() => break,
            }
        }

        let _ = self.store.resign_primary();
        let _ = self.store.unregister_process();
        self.pipes.close().await;
        info!("scheduler stopped");
        Ok(())
    }

    async fn run_tick(&self, tick: u64) -> Result<(), DeckError> {
        // 1. Liveness and (periodically) leadership.
        self.store.heartbeat()?;
        if tick % ELECTION_EVERY_TICKS == 1 {
            let won = self
                .store
                .elect_primary(self.config.heartbeat_timeout_secs)?;
            self.is_primary.store(won, Ordering::Relaxed);
            if won {
                let _ = self
                    .store
                    .clean_dead_processes(self.config.heartbeat_timeout_secs);
            }
        }

        // 2. Fleet caches: one pipe query each, subprocess fallback.
        if self.driver.activity_cache_stale() {
            if self.pipes.refresh_all_activities().await.is_err() {
                let _ = self.driver.refresh_activities().await;
            }
        }
        if self.driver.pane_info_cache_stale() {
            if self.pipes.refresh_all_pane_info().await.is_err() {
                let _ = self.driver.refresh_pane_info().await;
            }
        }

        // 3. Peer changes, detected cheaply through the beacon.
        let modified = self.store.last_modified()?.unwrap_or(0);
        let needs_reload = {
            let mut seen = self.last_seen_modified.lock().unwrap();
            if modified > *seen {
                *seen = modified;
                true
            } else {
                false
            }
        };
        if needs_reload {
            self.reload_from_store().await?;
        }

        // 4. Per-session polling with tier gating.
        let due = self.sessions_due(tick);
        let stored = self.store.read_all_statuses()?;
        for session in due {
            let status = session.get_status().await;
            let row = stored.get(&session.id);
            let changed = row.is_none_or(|r| r.status != status);
            if changed {
                self.store.write_status(&session.id, status, &session.tool)?;
                self.store.touch()?;
                debug!(id = %session.id, status = %status, "status written");
                if status == Status::Waiting && self.is_primary() && self.config.notify_on_waiting {
                    notify_waiting(&session.id);
                }
            }
        }
        Ok(())
    }

    /// Select sessions to poll this tick. `active`/`waiting` poll every
    /// tick; quiet sessions every Nth, unless their activity timestamp
    /// moved or a pipe event flagged them.
    fn sessions_due(&self, tick: u64) -> Vec<Arc<Session>> {
        let divisor = self.config.idle_poll_divisor.max(1);
        let flagged: HashSet<String> = self.poll_now.lock().unwrap().drain().collect();
        let sessions = self.sessions.lock().unwrap();
        let mut seen = self.seen_activity.lock().unwrap();

        let mut due = Vec::new();
        for session in sessions.values() {
            let fast = matches!(
                session.last_stable_status(),
                Status::Active | Status::Waiting | Status::Starting | Status::Error
            );
            let activity = self.driver.cached_window_activity(&session.tmux_name);
            let moved = match (activity, seen.get(&session.tmux_name)) {
                (Some(ts), Some(prev)) => ts != *prev,
                (Some(_), None) => true,
                (None, _) => false,
            };
            let eligible = fast
                || moved
                || flagged.contains(&session.tmux_name)
                || tick % divisor == 0;
            if eligible {
                if let Some(ts) = activity {
                    seen.insert(session.tmux_name.clone(), ts);
                }
                due.push(session.clone());
            }
        }
        due
    }

    /// Sync the in-memory fleet with the store: build sessions for new
    /// rows, drop removed ones, replicate acknowledgment flags.
    async fn reload_from_store(&self) -> Result<(), DeckError> {
        let instances = self.store.list_instances()?;
        let shared = self.store.read_all_statuses()?;

        let mut sessions = self.sessions.lock().unwrap();
        let live_ids: HashSet<&str> = instances.iter().map(|i| i.id.as_str()).collect();
        sessions.retain(|id, _| live_ids.contains(id.as_str()));

        for instance in &instances {
            if instance.tmux_session.is_empty() {
                continue;
            }
            match sessions.get(&instance.id) {
                Some(session) => {
                    if let Some(row) = shared.get(&instance.id) {
                        session.apply_shared_acknowledged(row.acknowledged);
                    }
                }
                None => {
                    sessions.insert(instance.id.clone(), self.build_session(instance));
                }
            }
        }
        debug!(count = sessions.len(), "fleet reloaded from store");
        Ok(())
    }

    fn build_session(&self, instance: &Instance) -> Arc<Session> {
        let overrides = self.config.pattern_overrides_for(instance.tool.key());
        let resolved = patterns::resolve_for_tool(&instance.tool, overrides.as_ref());
        Session::reconnect_lazy(
            instance,
            self.driver.clone(),
            self.pipes.clone(),
            resolved,
            self.config.tmux_option_pairs(),
        )
    }

    /// Handle an ack-signal for one session id.
    fn acknowledge(&self, session_id: &str) {
        let session = self.sessions.lock().unwrap().get(session_id).cloned();
        let Some(session) = session else {
            debug!(session_id, "ack signal for unknown session");
            return;
        };
        session.acknowledge_with_snapshot();
        if let Err(e) = self.store.set_acknowledged(session_id, true) {
            warn!(session_id, error = %e, "failed to persist acknowledgment");
        }
        let _ = self.store.touch();
    }

    /// Register a session started in this process (as opposed to loaded
    /// from the store).
    pub fn adopt(&self, session: Arc<Session>) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session);
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }
}

fn notify_waiting(session_id: &str) {
    let id = session_id.to_string();
    tokio::task::spawn_blocking(move || {
        let _ = notify_rust::Notification::new()
            .summary("Agent Deck")
            .body(&format!("Session {id} is waiting for input"))
            .show();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tool::Tool;

    fn scheduler() -> Arc<Scheduler> {
        let driver = Arc::new(TmuxDriver::new());
        Scheduler::new(
            Arc::new(Store::open_in_memory().unwrap()),
            driver.clone(),
            PipeManager::new(driver),
            GlobalConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_reload_builds_and_prunes_sessions() {
        let s = scheduler();
        let a = Instance::new("a", "/tmp", "claude");
        let b = Instance::new("b", "/tmp", "codex");
        s.store.save_instances(&[a.clone(), b.clone()]).unwrap();

        s.reload_from_store().await.unwrap();
        assert!(s.session(&a.id).is_some());
        assert_eq!(s.session(&b.id).unwrap().tool, Tool::Codex);

        s.store.save_instances(&[a.clone()]).unwrap();
        s.reload_from_store().await.unwrap();
        assert!(s.session(&b.id).is_none());
        assert!(s.session(&a.id).is_some());
    }

    #[tokio::test]
    async fn test_reload_replicates_acknowledged() {
        let s = scheduler();
        let a = Instance::new("a", "/tmp", "claude");
        s.store.save_instances(&[a.clone()]).unwrap();
        s.reload_from_store().await.unwrap();
        assert!(!s.session(&a.id).unwrap().is_acknowledged());

        s.store.set_acknowledged(&a.id, true).unwrap();
        s.reload_from_store().await.unwrap();
        assert!(s.session(&a.id).unwrap().is_acknowledged());
    }

    #[tokio::test]
    async fn test_poll_now_flag_promotes_session() {
        let s = scheduler();
        let a = Instance::new("a", "/tmp", "claude");
        s.store.save_instances(&[a.clone()]).unwrap();
        s.reload_from_store().await.unwrap();
        // Force the session out of the fast tier.
        s.session(&a.id).unwrap().acknowledge();

        // Tick 1 with divisor 4: not due without a flag.
        assert!(s.sessions_due(1).is_empty());
        s.poll_now
            .lock()
            .unwrap()
            .insert(a.tmux_session.clone());
        assert_eq!(s.sessions_due(1).len(), 1);
        // Flag is consumed.
        assert!(s.sessions_due(1).is_empty());
        // Divisor tick always polls.
        assert_eq!(s.sessions_due(4).len(), 1);
    }
}
