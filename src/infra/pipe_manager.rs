//! Owns every control pipe. One persistent pipe per session keeps
//! capture latency low; fleet queries ride a single pipe so a tick costs
//! one command instead of N subprocesses.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::DeckError;
use crate::infra::control_pipe::ControlPipe;
use crate::infra::tmux::{parse_activities, parse_pane_info, TmuxDriver};

/// Reconnection backoff schedule: 2 s, 4 s, 8 s, 16 s, then capped.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Callback invoked when any pipe reports pane output. Carries the tmux
/// name as a value; sessions are looked up by name, never held.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct PipeManager {
    driver: Arc<TmuxDriver>,
    pipes: Mutex<HashMap<String, Arc<ControlPipe>>>,
    /// Names with a connect/reconnect in flight. Forbids concurrent
    /// creation attempts for the same session.
    reconnecting: Mutex<HashSet<String>>,
    on_output: Mutex<Option<OutputCallback>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PipeManager {
    pub fn new(driver: Arc<TmuxDriver>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            driver,
            pipes: Mutex::new(HashMap::new()),
            reconnecting: Mutex::new(HashSet::new()),
            on_output: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Register the fleet-wide output callback. Must be set before
    /// sessions connect; later pipes inherit it.
    pub fn set_output_callback(&self, cb: OutputCallback) {
        *self.on_output.lock().unwrap() = Some(cb);
    }

    /// Idempotent, collision-safe connect. Pipe creation spawns a
    /// process, so it runs outside the map lock; if a concurrent winner
    /// installed a live pipe first, the loser is closed.
    pub async fn connect(self: &Arc<Self>, name: &str) -> Result<(), DeckError> {
        {
            let pipes = self.pipes.lock().unwrap();
            if pipes.get(name).is_some_and(|p| p.is_alive()) {
                return Ok(());
            }
        }
        {
            let mut guard = self.reconnecting.lock().unwrap();
            if !guard.insert(name.to_string()) {
                return Ok(());
            }
        }

        let result = self.connect_locked_out(name).await;
        self.reconnecting.lock().unwrap().remove(name);
        result
    }

    async fn connect_locked_out(self: &Arc<Self>, name: &str) -> Result<(), DeckError> {
        let pipe = match ControlPipe::connect(name).await {
            Ok(pipe) => Arc::new(pipe),
            Err(e) => return Err(e),
        };

        let stale = {
            let mut pipes = self.pipes.lock().unwrap();
            if pipes.get(name).is_some_and(|p| p.is_alive()) {
                // Concurrent winner: close the pipe we just made.
                Some(pipe.clone())
            } else {
                pipes.insert(name.to_string(), pipe.clone());
                None
            }
        };
        if let Some(loser) = stale {
            loser.close().await;
            return Ok(());
        }

        self.spawn_forwarder(&pipe);
        self.spawn_watcher(name.to_string(), &pipe);
        Ok(())
    }

    /// Relay the pipe's coalesced output events into the manager-wide
    /// callback.
    fn spawn_forwarder(self: &Arc<Self>, pipe: &Arc<ControlPipe>) {
        let Some(mut events) = pipe.output_events() else {
            return;
        };
        let manager = Arc::downgrade(self);
        let name = pipe.target().to_string();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        if event.is_none() {
                            break;
                        }
                        let Some(manager) = manager.upgrade() else { break };
                        let cb = manager.on_output.lock().unwrap().clone();
                        if let Some(cb) = cb {
                            cb(&name);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// Await pipe death, then try to bring it back with exponential
    /// backoff. Gives up immediately if the tmux session is gone.
    fn spawn_watcher(self: &Arc<Self>, name: String, pipe: &Arc<ControlPipe>) {
        let manager = Arc::downgrade(self);
        let pipe = pipe.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = pipe.done() => {}
                _ = shutdown.changed() => return,
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if *manager.shutdown_rx.borrow() {
                return;
            }
            debug!(session = %name, "control pipe died");
            manager.reconnect_with_backoff(&name).await;
        });
    }

    async fn reconnect_with_backoff(self: &Arc<Self>, name: &str) {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let delay = Duration::from_secs(2u64 << (attempt - 1)).min(BACKOFF_CAP);
            tokio::time::sleep(delay).await;
            if *self.shutdown_rx.borrow() {
                return;
            }
            // A cheap existence probe before each attempt: reconnecting
            // to a killed session would spin through the whole schedule.
            if !self.driver.session_exists(name).await {
                info!(session = name, "session gone, abandoning pipe reconnect");
                self.remove(name).await;
                return;
            }
            match self.connect(name).await {
                Ok(()) => {
                    info!(session = name, attempt, "control pipe reconnected");
                    return;
                }
                Err(e) if e.is_session_gone() => {
                    self.remove(name).await;
                    return;
                }
                Err(e) => {
                    warn!(session = name, attempt, error = %e, "pipe reconnect failed");
                }
            }
        }
        warn!(session = name, "giving up on pipe reconnect");
        self.remove(name).await;
    }

    fn pipe_for(&self, name: &str) -> Option<Arc<ControlPipe>> {
        self.pipes
            .lock()
            .unwrap()
            .get(name)
            .filter(|p| p.is_alive())
            .cloned()
    }

    /// True when a live pipe exists for this session.
    pub fn is_connected(&self, name: &str) -> bool {
        self.pipe_for(name).is_some()
    }

    /// Capture over this session's own pipe. Errors when no live pipe
    /// exists so the caller can fall back to a subprocess.
    pub async fn capture_pane(&self, name: &str) -> Result<String, DeckError> {
        match self.pipe_for(name) {
            Some(pipe) => pipe.capture_pane().await,
            None => Err(DeckError::PipeDead),
        }
    }

    pub async fn get_window_activity(&self, name: &str) -> Result<i64, DeckError> {
        match self.pipe_for(name) {
            Some(pipe) => pipe.get_window_activity().await,
            None => Err(DeckError::PipeDead),
        }
    }

    fn any_pipe(&self) -> Option<Arc<ControlPipe>> {
        self.pipes
            .lock()
            .unwrap()
            .values()
            .find(|p| p.is_alive())
            .cloned()
    }

    /// Refresh the fleet activity cache with one query over any live
    /// pipe. Control mode requires double-quoted format strings.
    pub async fn refresh_all_activities(&self) -> Result<(), DeckError> {
        let pipe = self.any_pipe().ok_or(DeckError::PipeDead)?;
        let out = pipe
            .send_command("list-windows -a -F \"#{session_name} #{window_activity}\"")
            .await?;
        self.driver.store_activities(parse_activities(&out));
        Ok(())
    }

    pub async fn refresh_all_pane_info(&self) -> Result<(), DeckError> {
        let pipe = self.any_pipe().ok_or(DeckError::PipeDead)?;
        let out = pipe
            .send_command(
                "list-panes -a -F \"#{session_name}\t#{pane_title}\t#{pane_current_command}\"",
            )
            .await?;
        self.driver.store_pane_info(parse_pane_info(&out));
        Ok(())
    }

    /// Close and forget one session's pipe. Used when the session is
    /// killed; no reconnect follows.
    pub async fn remove(&self, name: &str) {
        let pipe = self.pipes.lock().unwrap().remove(name);
        if let Some(pipe) = pipe {
            pipe.close().await;
        }
    }

    /// Cancel all workers and close every pipe.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let pipes: Vec<Arc<ControlPipe>> = self.pipes.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pipe in pipes {
            pipe.close().await;
        }
    }
}
