//! Per-session state machine: lifecycle, acknowledgment, and the ordered
//! status classification procedure on top of the driver, pipes and
//! patterns.

pub mod status;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::domain::instance::{Instance, Status};
use crate::domain::tool::Tool;
use crate::error::DeckError;
use crate::infra::pipe_manager::PipeManager;
use crate::infra::tmux::{wrap_command, TmuxDriver};
use crate::patterns::normalize::content_hash;
use crate::patterns::prompt::PromptDetector;
use crate::patterns::spinner::{is_braille, SpinnerActivityTracker};
use crate::patterns::ResolvedPatterns;
use status::{detect_busy, CaptureDecision, SpikeFilter, PROMPT_DEMOTE_POLLS};

/// Capture results are reused for this long; every mutating operation
/// invalidates the cache early.
const CAPTURE_TTL: Duration = Duration::from_millis(500);

/// A freshly started (or respawned) pane gets this long to settle before
/// unrecognized content stops reading as `starting`.
const STARTUP_WINDOW: Duration = Duration::from_secs(120);

/// After `acknowledge_with_snapshot`, prompt detection won't flip the
/// session back to `waiting` for this long.
const ACK_IGNORE_WINDOW: Duration = Duration::from_secs(2);

/// Mutable per-session state. Everything in here is guarded by the
/// session mutex; `get_status` drops that lock across captures.
struct SessionState {
    tracker: StateTracker,
    last_stable: Status,
    started_at: Option<Instant>,
    capture_cache: Option<(String, Instant)>,
    configured: bool,
}

/// The classifier's memory between ticks.
#[derive(Default)]
struct StateTracker {
    last_hash: String,
    last_change_time: Option<Instant>,
    acknowledged: bool,
    acknowledged_at: Option<Instant>,
    waiting_since: Option<Instant>,
    prompt_no_busy_count: u32,
    spike: SpikeFilter,
    spinner: SpinnerActivityTracker,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            spinner: SpinnerActivityTracker::default(),
            ..Default::default()
        }
    }
}

pub struct Session {
    pub id: String,
    pub tmux_name: String,
    pub tool: Tool,
    patterns: ResolvedPatterns,
    prompt_detector: PromptDetector,
    driver: Arc<TmuxDriver>,
    pipes: Arc<PipeManager>,
    state: Mutex<SessionState>,
    /// Single-flight gate: concurrent captures park here and reuse the
    /// winner's result through the cache.
    capture_gate: tokio::sync::Mutex<()>,
    extra_options: Vec<(String, String)>,
}

impl Session {
    /// Create the tmux session, configure it, send the startup command
    /// and request a control pipe. On a name collision the instance gets
    /// a fresh suffix and we retry.
    pub async fn start(
        instance: &mut Instance,
        driver: Arc<TmuxDriver>,
        pipes: Arc<PipeManager>,
        patterns: ResolvedPatterns,
        extra_options: Vec<(String, String)>,
    ) -> Result<Arc<Session>, DeckError> {
        let workdir = if instance.project_path.is_empty() {
            ".".to_string()
        } else {
            instance.project_path.clone()
        };

        let mut attempts = 0;
        loop {
            match driver.create_session(&instance.tmux_session, &workdir).await {
                Ok(()) => break,
                Err(DeckError::SessionExists(_)) if attempts < 3 => {
                    attempts += 1;
                    instance.regenerate_tmux_name();
                }
                Err(e) => return Err(e),
            }
        }

        let session = Arc::new(Session::build(
            instance,
            driver,
            pipes,
            patterns,
            extra_options,
        ));
        session.configure().await?;

        if !instance.command.is_empty() {
            let command = wrap_command(&instance.command);
            session
                .driver
                .send_keys_and_enter(&session.tmux_name, &command)
                .await?;
        }

        {
            let mut st = session.state.lock().unwrap();
            st.started_at = Some(Instant::now());
            st.last_stable = Status::Starting;
            st.configured = true;
        }

        if let Err(e) = session.pipes.connect(&session.tmux_name).await {
            warn!(session = %session.tmux_name, error = %e, "control pipe connect failed, subprocess fallback in effect");
        }

        info!(id = %session.id, tmux = %session.tmux_name, "session started");
        Ok(session)
    }

    /// Rebuild a Session for an already-running tmux session without
    /// issuing any tmux commands. Used for bulk loading at startup;
    /// `ensure_configured` runs later, before first interaction.
    pub fn reconnect_lazy(
        instance: &Instance,
        driver: Arc<TmuxDriver>,
        pipes: Arc<PipeManager>,
        patterns: ResolvedPatterns,
        extra_options: Vec<(String, String)>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::build(
            instance,
            driver,
            pipes,
            patterns,
            extra_options,
        ));
        {
            let mut st = session.state.lock().unwrap();
            st.last_stable = instance.status;
            st.tracker.acknowledged = instance.acknowledged;
        }
        session
    }

    fn build(
        instance: &Instance,
        driver: Arc<TmuxDriver>,
        pipes: Arc<PipeManager>,
        patterns: ResolvedPatterns,
        extra_options: Vec<(String, String)>,
    ) -> Session {
        Session {
            id: instance.id.clone(),
            tmux_name: instance.tmux_session.clone(),
            tool: instance.tool.clone(),
            prompt_detector: PromptDetector::new(instance.tool.clone()),
            patterns,
            driver,
            pipes,
            state: Mutex::new(SessionState {
                tracker: StateTracker::new(),
                last_stable: Status::Error,
                started_at: None,
                capture_cache: None,
                configured: false,
            }),
            capture_gate: tokio::sync::Mutex::new(()),
            extra_options,
        }
    }

    /// Apply session options once for lazily reconnected sessions.
    pub async fn ensure_configured(&self) -> Result<(), DeckError> {
        if self.state.lock().unwrap().configured {
            return Ok(());
        }
        self.configure().await?;
        self.state.lock().unwrap().configured = true;
        self.pipes.connect(&self.tmux_name).await.ok();
        Ok(())
    }

    async fn configure(&self) -> Result<(), DeckError> {
        self.driver.apply_session_setup(&self.tmux_name).await?;
        if !self.extra_options.is_empty() {
            let opts: Vec<(&str, &str)> = self
                .extra_options
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            self.driver.set_options(&self.tmux_name, &opts).await?;
        }
        if let Some(log_path) = self.log_path() {
            if let Some(parent) = log_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = self
                .driver
                .pipe_to_log(&self.tmux_name, &log_path.to_string_lossy())
                .await;
        }
        Ok(())
    }

    fn log_path(&self) -> Option<PathBuf> {
        dirs::home_dir().map(|home| {
            home.join(".agent-deck")
                .join("logs")
                .join(format!("{}.log", self.tmux_name))
        })
    }

    /// Disconnect the pipe, remove the log file, then kill the tmux
    /// session with process-tree verification.
    pub async fn kill(&self) -> Result<(), DeckError> {
        self.pipes.remove(&self.tmux_name).await;
        if let Some(log_path) = self.log_path() {
            let _ = std::fs::remove_file(log_path);
        }
        self.driver.kill_session(&self.tmux_name).await
    }

    /// Replace the pane process. Spinner history and the status snapshot
    /// reset so the new process starts from a clean `starting`.
    pub async fn respawn(&self, command: &str) -> Result<(), DeckError> {
        self.driver.respawn_pane(&self.tmux_name, command).await?;
        {
            let mut st = self.state.lock().unwrap();
            st.tracker.spinner.reset();
            st.tracker.spike.forget();
            st.tracker.prompt_no_busy_count = 0;
            st.capture_cache = None;
            st.last_stable = Status::Starting;
            st.started_at = Some(Instant::now());
        }
        self.pipes.connect(&self.tmux_name).await.ok();
        Ok(())
    }

    pub async fn send_keys(&self, text: &str) -> Result<(), DeckError> {
        self.invalidate_capture();
        self.driver.send_keys(&self.tmux_name, text).await
    }

    pub async fn send_enter(&self) -> Result<(), DeckError> {
        self.invalidate_capture();
        self.driver.send_enter(&self.tmux_name).await
    }

    pub async fn send_keys_and_enter(&self, text: &str) -> Result<(), DeckError> {
        self.invalidate_capture();
        self.driver.send_keys_and_enter(&self.tmux_name, text).await
    }

    fn invalidate_capture(&self) {
        self.state.lock().unwrap().capture_cache = None;
    }

    // ── acknowledgment ──────────────────────────────────────────────

    /// Mark the waiting prompt as seen. No capture; acknowledging must
    /// be instantaneous.
    pub fn acknowledge(&self) {
        let mut st = self.state.lock().unwrap();
        st.tracker.acknowledged = true;
        st.last_stable = Status::Idle;
    }

    /// Acknowledge and open a short ignore window so the very next polls
    /// can't flip straight back to `waiting`.
    pub fn acknowledge_with_snapshot(&self) {
        let mut st = self.state.lock().unwrap();
        st.tracker.acknowledged = true;
        st.tracker.acknowledged_at = Some(Instant::now());
        st.last_stable = Status::Idle;
    }

    /// External hook (e.g. the agent's Stop event): the session needs
    /// attention again.
    pub fn reset_acknowledged(&self) {
        let mut st = self.state.lock().unwrap();
        st.tracker.acknowledged = false;
        st.tracker.waiting_since = Some(Instant::now());
        st.last_stable = Status::Waiting;
    }

    /// Replicate an acknowledgment flag written by another process.
    /// Only the flag moves; the next natural tick maps the status.
    pub fn apply_shared_acknowledged(&self, acknowledged: bool) {
        self.state.lock().unwrap().tracker.acknowledged = acknowledged;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state.lock().unwrap().tracker.acknowledged
    }

    pub fn last_stable_status(&self) -> Status {
        self.state.lock().unwrap().last_stable
    }

    /// Hash of the last normalized capture, for external change
    /// detection.
    pub fn content_hash(&self) -> String {
        self.state.lock().unwrap().tracker.last_hash.clone()
    }

    // ── status classification ───────────────────────────────────────

    /// The ordered decision procedure. Returns the session's current
    /// status, updating the stable snapshot as a side effect.
    pub async fn get_status(&self) -> Status {
        // 1. Session existence (served from the fleet cache when fresh).
        if !self.exists().await {
            let mut st = self.state.lock().unwrap();
            st.last_stable = Status::Inactive;
            return Status::Inactive;
        }

        // 2. Title fast path: a braille glyph in the pane title means
        // the agent is mid-turn. Done markers (✳ ✻ ✽ ✶ ✢) and plain
        // titles both defer to the content path.
        if let Some(info) = self.driver.cached_pane_info(&self.tmux_name) {
            if info.title.chars().any(is_braille) {
                let mut st = self.state.lock().unwrap();
                st.tracker.spinner.mark_busy();
                return mark_active(&mut st);
            }
        }

        // 3. Activity timestamp, 4. capture decision.
        let decision = match self.driver.cached_window_activity(&self.tmux_name) {
            Some(ts) => {
                let mut st = self.state.lock().unwrap();
                let fast = matches!(st.last_stable, Status::Active | Status::Starting);
                st.tracker.spike.observe(ts, fast)
            }
            // Degraded mode: no activity source, fall back to hashing
            // fresh captures every tick (the capture cache bounds cost).
            None => CaptureDecision::Capture,
        };

        match decision {
            CaptureDecision::Skip | CaptureDecision::HoldStable => {
                self.state.lock().unwrap().last_stable
            }
            CaptureDecision::Capture => {
                // 5. Capture without holding the state lock.
                match self.capture_cached().await {
                    Ok(content) => {
                        let mut st = self.state.lock().unwrap();
                        self.classify(&mut st, &content)
                    }
                    Err(DeckError::CaptureTimeout(_)) | Err(DeckError::PipeTimeout) => {
                        // Never demote on a timeout.
                        self.state.lock().unwrap().last_stable
                    }
                    Err(e) if e.is_session_gone() => {
                        let mut st = self.state.lock().unwrap();
                        st.last_stable = Status::Inactive;
                        Status::Inactive
                    }
                    Err(e) => {
                        debug!(session = %self.tmux_name, error = %e, "capture failed, keeping previous status");
                        self.state.lock().unwrap().last_stable
                    }
                }
            }
        }
    }

    /// Classify captured content under the state lock.
    fn classify(&self, st: &mut MutexGuard<'_, SessionState>, content: &str) -> Status {
        st.tracker.spike.reset_window();

        let hash = content_hash(content);
        if hash != st.tracker.last_hash {
            st.tracker.last_hash = hash;
            st.tracker.last_change_time = Some(Instant::now());
        }

        let check = detect_busy(content, &self.tool, &self.patterns);
        if check.busy {
            st.tracker.spinner.mark_busy();
            st.tracker.prompt_no_busy_count = 0;
            return mark_active(st);
        }
        if st.tracker.spinner.in_grace_period() {
            // The spinner vanished between tool calls; hold active.
            return mark_active(st);
        }

        let prompt = self.prompt_detector.detect(content, &self.patterns);
        if prompt {
            // Hysteresis: one prompt-only capture right after activity is
            // usually the gap between tool calls.
            if st.last_stable == Status::Active
                && st.tracker.prompt_no_busy_count + 1 < PROMPT_DEMOTE_POLLS
            {
                st.tracker.prompt_no_busy_count += 1;
                return Status::Active;
            }
            st.tracker.prompt_no_busy_count = 0;
            return self.settle_prompt(st);
        }

        // Neither busy nor prompt.
        if let Some(started) = st.started_at {
            if started.elapsed() < STARTUP_WINDOW {
                st.last_stable = Status::Starting;
                return Status::Starting;
            }
        }
        match st.last_stable {
            // Activity ended without a recognizable prompt; surface it.
            Status::Active => self.settle_prompt(st),
            Status::Starting => {
                st.last_stable = Status::Idle;
                Status::Idle
            }
            other => other,
        }
    }

    /// Map a detected prompt through acknowledgment state.
    fn settle_prompt(&self, st: &mut MutexGuard<'_, SessionState>) -> Status {
        let recently_acked = st
            .tracker
            .acknowledged_at
            .is_some_and(|at| at.elapsed() < ACK_IGNORE_WINDOW);
        if st.tracker.acknowledged || recently_acked {
            st.last_stable = Status::Idle;
            Status::Idle
        } else {
            if st.last_stable != Status::Waiting {
                st.tracker.waiting_since = Some(Instant::now());
            }
            st.last_stable = Status::Waiting;
            Status::Waiting
        }
    }

    async fn exists(&self) -> bool {
        if let Some(known) = self.driver.session_in_fleet(&self.tmux_name) {
            return known;
        }
        self.driver.session_exists(&self.tmux_name).await
    }

    /// Capture via pipe with subprocess fallback, deduplicated through
    /// the single-flight gate and cached for 500 ms.
    pub async fn capture_cached(&self) -> Result<String, DeckError> {
        if let Some(content) = self.fresh_capture() {
            return Ok(content);
        }
        let _flight = self.capture_gate.lock().await;
        // A parked caller may find the winner's result already cached.
        if let Some(content) = self.fresh_capture() {
            return Ok(content);
        }

        let content = match self.pipes.capture_pane(&self.tmux_name).await {
            Ok(content) => content,
            Err(DeckError::PipeDead) => self.driver.capture_pane(&self.tmux_name).await?,
            Err(DeckError::PipeTimeout) => return Err(DeckError::PipeTimeout),
            Err(e) if e.is_session_gone() => return Err(e),
            Err(e) => {
                debug!(session = %self.tmux_name, error = %e, "pipe capture failed, trying subprocess");
                self.driver.capture_pane(&self.tmux_name).await?
            }
        };

        self.state.lock().unwrap().capture_cache = Some((content.clone(), Instant::now()));
        Ok(content)
    }

    fn fresh_capture(&self) -> Option<String> {
        let st = self.state.lock().unwrap();
        st.capture_cache
            .as_ref()
            .filter(|(_, at)| at.elapsed() < CAPTURE_TTL)
            .map(|(content, _)| content.clone())
    }
}

/// Transition to active: the acknowledged flag always clears.
fn mark_active(st: &mut MutexGuard<'_, SessionState>) -> Status {
    st.tracker.acknowledged = false;
    st.last_stable = Status::Active;
    Status::Active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{compile, default_raw};

    fn test_session(tool: Tool) -> Session {
        let patterns = compile(&default_raw(&tool));
        let mut instance = Instance::new("test", "/tmp", tool.key());
        instance.tool = tool.clone();
        Session::build(
            &instance,
            Arc::new(TmuxDriver::new()),
            PipeManager::new(Arc::new(TmuxDriver::new())),
            patterns,
            vec![],
        )
    }

    fn classify(session: &Session, content: &str) -> Status {
        let mut st = session.state.lock().unwrap();
        session.classify(&mut st, content)
    }

    #[test]
    fn test_classify_active_clears_acknowledged() {
        // The canonical working screen: asterisk spinner line plus prompt.
        let session = test_session(Tool::Claude);
        session.state.lock().unwrap().tracker.acknowledged = true;
        let status = classify(&session, "✳ Gusting… (35s · ↑ 673 tokens)\n❯\n");
        assert_eq!(status, Status::Active);
        assert!(!session.is_acknowledged());
        assert_eq!(session.last_stable_status(), Status::Active);
    }

    #[test]
    fn test_classify_prompt_waits_then_idles_when_acked() {
        // Welcome banner with a prompt and no spinner line.
        let session = test_session(Tool::Claude);
        session.state.lock().unwrap().last_stable = Status::Idle;
        let banner = "Opus 4.6 is here · $50 free extra usage · Try fast mode or use i…\n❯\n";

        let status = classify(&session, banner);
        assert_eq!(status, Status::Waiting);

        session.acknowledge();
        let status = classify(&session, banner);
        assert_eq!(status, Status::Idle);
    }

    #[test]
    fn test_classify_interrupt_guard_follows_prompt_path() {
        // An interrupt hint quoted in plain output, no working context.
        let session = test_session(Tool::Claude);
        session.state.lock().unwrap().last_stable = Status::Idle;
        let status = classify(
            &session,
            "Some text mentioning esc to interrupt from docs\n❯\n",
        );
        assert_eq!(status, Status::Waiting);
    }

    #[test]
    fn test_hysteresis_holds_active_for_one_prompt_poll() {
        let session = test_session(Tool::Claude);
        // Become active, then force grace expiry so only hysteresis holds.
        classify(&session, "⠙ Thinking… (2s · 10 tokens)\n");
        {
            let mut st = session.state.lock().unwrap();
            st.tracker.spinner = SpinnerActivityTracker::new(Duration::ZERO);
        }

        // First prompt-no-busy poll: held.
        assert_eq!(classify(&session, "all done\n❯\n"), Status::Active);
        // Second consecutive one: demoted.
        assert_eq!(classify(&session, "all done\n❯\n"), Status::Waiting);
        assert!(session.state.lock().unwrap().tracker.waiting_since.is_some());
    }

    #[test]
    fn test_grace_period_holds_active_without_spinner() {
        let session = test_session(Tool::Claude);
        classify(&session, "⠹ working on it\n");
        // Spinner gone, no prompt: grace keeps it active.
        let status = classify(&session, "tool output scrolling by\n");
        assert_eq!(status, Status::Active);
    }

    #[test]
    fn test_startup_window_reports_starting() {
        let session = test_session(Tool::Claude);
        {
            let mut st = session.state.lock().unwrap();
            st.started_at = Some(Instant::now());
            st.last_stable = Status::Starting;
        }
        let status = classify(&session, "booting the agent...\n");
        assert_eq!(status, Status::Starting);
    }

    #[test]
    fn test_starting_settles_to_idle_after_window() {
        let session = test_session(Tool::Claude);
        {
            let mut st = session.state.lock().unwrap();
            st.started_at = Some(Instant::now() - STARTUP_WINDOW);
            st.last_stable = Status::Starting;
        }
        let status = classify(&session, "unrecognized banner\n");
        assert_eq!(status, Status::Idle);
    }

    #[test]
    fn test_acknowledge_family() {
        let session = test_session(Tool::Claude);
        session.state.lock().unwrap().last_stable = Status::Waiting;

        session.acknowledge();
        assert!(session.is_acknowledged());
        assert_eq!(session.last_stable_status(), Status::Idle);

        session.reset_acknowledged();
        assert!(!session.is_acknowledged());
        assert_eq!(session.last_stable_status(), Status::Waiting);

        // Shared flag sync does not force a transition.
        session.apply_shared_acknowledged(true);
        assert!(session.is_acknowledged());
        assert_eq!(session.last_stable_status(), Status::Waiting);
    }

    #[test]
    fn test_ack_ignore_window_keeps_idle() {
        let session = test_session(Tool::Claude);
        session.state.lock().unwrap().last_stable = Status::Waiting;
        session.acknowledge_with_snapshot();

        // Even if the shared flag is cleared, the ignore window keeps
        // the next prompt classification at idle.
        session.apply_shared_acknowledged(false);
        let status = classify(&session, "❯\n");
        assert_eq!(status, Status::Idle);
    }

    #[test]
    fn test_content_hash_updates_on_change() {
        let session = test_session(Tool::Claude);
        classify(&session, "output A\n❯\n");
        let first = session.content_hash();
        classify(&session, "output B\n❯\n");
        let second = session.content_hash();
        assert_ne!(first, second);
        // Spinner-frame churn does not move the hash.
        classify(&session, "output B  \n❯\n");
        assert_eq!(session.content_hash(), second);
    }

    #[test]
    fn test_opencode_frame_not_waiting_while_busy() {
        let session = test_session(Tool::Opencode);
        let status = classify(&session, "Ask anything\n█▓▒░ thinking...\n");
        assert_eq!(status, Status::Active);
    }
}
