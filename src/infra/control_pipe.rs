//! Persistent control-mode connection to one tmux session.
//!
//! Each pipe is a `tmux -C attach-session -t <name>` child. Its stdout
//! speaks the control-mode line protocol: `%begin`/`%end` (or `%error`)
//! bracket command responses, `%output` announces pane output, every
//! other `%` line is noise that must never leak into a response body.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::error::DeckError;

/// Handshake budget: the initial `%begin`/`%end` pair from the attach.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-command response budget. A hung command must not stall the
/// scheduler tick forever.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Reader buffer size. Must absorb multi-megabyte capture-pane bodies.
const READER_BUFFER: usize = 2 * 1024 * 1024;

/// Output-event channel capacity. Overflow is dropped, not buffered:
/// consumers only need "something happened".
const OUTPUT_EVENTS: usize = 64;

/// One parsed command response.
#[derive(Debug)]
struct Response {
    ok: bool,
    text: String,
}

/// A parsed control-mode line.
#[derive(Debug, PartialEq)]
pub enum ControlLine<'a> {
    Begin,
    End,
    /// Message is the concatenation of tokens from index 3 onward.
    Error(String),
    Output,
    /// `%session-changed`, `%exit` and friends. Never part of a body.
    Notification,
    Data(&'a str),
}

/// Parse one line of control-mode stdout. Prefix matching is exact,
/// trailing space included: `%end ` terminates a block, `%endless`
/// is just another notification.
pub fn parse_control_line(line: &str) -> ControlLine<'_> {
    if line.starts_with("%begin ") {
        return ControlLine::Begin;
    }
    if line.starts_with("%end ") {
        return ControlLine::End;
    }
    if line.starts_with("%error ") {
        let msg = line.split_whitespace().skip(3).collect::<Vec<_>>().join(" ");
        return ControlLine::Error(msg);
    }
    if line.starts_with("%output ") {
        return ControlLine::Output;
    }
    if line.starts_with('%') {
        return ControlLine::Notification;
    }
    ControlLine::Data(line)
}

/// Stdin handle and response stream, bundled under one lock so commands
/// are strictly serialized and responses match in FIFO order.
struct CommandChannel {
    stdin: ChildStdin,
    responses: mpsc::Receiver<Response>,
}

pub struct ControlPipe {
    target: String,
    channel: Mutex<CommandChannel>,
    child: std::sync::Mutex<Option<Child>>,
    child_pid: u32,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    last_output_ns: Arc<AtomicI64>,
    done_rx: watch::Receiver<bool>,
    output_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl ControlPipe {
    /// Attach to a session in control mode. Blocks until the initial
    /// handshake completes or 2 s passes. A handshake `%error` (usually
    /// "can't find session") fails the constructor so callers can tell a
    /// missing target from a transient fault; a silent timeout is only
    /// logged; the pipe may still come up, and the first command will
    /// surface a real failure.
    pub async fn connect(target: &str) -> Result<Self, DeckError> {
        let mut cmd = Command::new("tmux");
        cmd.args(["-C", "attach-session", "-t", target])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        // New session/process group so close() can kill the whole child
        // tree at once.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| DeckError::SpawnFailed(e.to_string()))?;
        let child_pid = child.id().unwrap_or(0);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DeckError::SpawnFailed("no stdin on tmux -C child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeckError::SpawnFailed("no stdout on tmux -C child".into()))?;

        let (response_tx, response_rx) = mpsc::channel(16);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_EVENTS);
        let (done_tx, done_rx) = watch::channel(false);
        let alive = Arc::new(AtomicBool::new(true));
        let last_output_ns = Arc::new(AtomicI64::new(0));

        let reader_alive = alive.clone();
        let reader_last_output = last_output_ns.clone();
        tokio::spawn(async move {
            reader_loop(stdout, response_tx, output_tx, reader_last_output).await;
            reader_alive.store(false, Ordering::SeqCst);
            let _ = done_tx.send(true);
        });

        let pipe = Self {
            target: target.to_string(),
            channel: Mutex::new(CommandChannel {
                stdin,
                responses: response_rx,
            }),
            child: std::sync::Mutex::new(Some(child)),
            child_pid,
            alive,
            closed: AtomicBool::new(false),
            last_output_ns,
            done_rx,
            output_rx: std::sync::Mutex::new(Some(output_rx)),
        };

        // Consume the handshake response.
        {
            let mut channel = pipe.channel.lock().await;
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.responses.recv()).await {
                Ok(Some(resp)) if resp.ok => {}
                Ok(Some(resp)) => {
                    drop(channel);
                    pipe.close().await;
                    return Err(DeckError::Tmux(resp.text));
                }
                Ok(None) => {
                    drop(channel);
                    pipe.close().await;
                    return Err(DeckError::PipeDead);
                }
                Err(_) => {
                    warn!(session = target, "control-mode handshake timed out, proceeding");
                }
            }
        }

        debug!(session = target, pid = child_pid, "control pipe connected");
        Ok(pipe)
    }

    /// Send one command and wait for its paired `%end`/`%error`. Commands
    /// are serialized; any stale response left by a previous timeout is
    /// drained first so FIFO pairing holds.
    pub async fn send_command(&self, cmd: &str) -> Result<String, DeckError> {
        if !self.is_alive() {
            return Err(DeckError::PipeDead);
        }
        let mut channel = self.channel.lock().await;

        while channel.responses.try_recv().is_ok() {}

        channel
            .stdin
            .write_all(format!("{cmd}\n").as_bytes())
            .await
            .map_err(|_| DeckError::PipeDead)?;
        channel
            .stdin
            .flush()
            .await
            .map_err(|_| DeckError::PipeDead)?;

        match tokio::time::timeout(COMMAND_TIMEOUT, channel.responses.recv()).await {
            Ok(Some(resp)) if resp.ok => Ok(resp.text),
            Ok(Some(resp)) => Err(DeckError::Tmux(resp.text)),
            Ok(None) => Err(DeckError::PipeDead),
            Err(_) => Err(DeckError::PipeTimeout),
        }
    }

    /// Capture this session's visible pane over the pipe.
    pub async fn capture_pane(&self) -> Result<String, DeckError> {
        self.send_command(&format!("capture-pane -t {} -p -J", self.target))
            .await
    }

    pub async fn get_window_activity(&self) -> Result<i64, DeckError> {
        let out = self
            .send_command(&format!(
                "display-message -p -t {} \"#{{window_activity}}\"",
                self.target
            ))
            .await?;
        out.trim()
            .parse()
            .map_err(|_| DeckError::Tmux(format!("bad window_activity: {out}")))
    }

    /// Take the coalescing output-event stream. Yields once per burst of
    /// `%output` lines; can only be taken once.
    pub fn output_events(&self) -> Option<mpsc::Receiver<()>> {
        self.output_rx.lock().unwrap().take()
    }

    /// Wall-clock nanos of the last `%output` line, 0 if none seen.
    pub fn last_output_ns(&self) -> i64 {
        self.last_output_ns.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Resolves once the reader has exited (pipe death or close).
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Idempotent shutdown: close stdin (polite detach), then kill the
    /// child's whole process group and reap it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut channel = self.channel.lock().await;
            let _ = channel.stdin.shutdown().await;
        }
        if self.child_pid != 0 {
            unsafe {
                libc::killpg(self.child_pid as i32, libc::SIGTERM);
            }
        }
        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            match tokio::time::timeout(Duration::from_secs(1), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        debug!(session = %self.target, "control pipe closed");
    }
}

async fn reader_loop<R: tokio::io::AsyncRead + Unpin>(
    stdout: R,
    response_tx: mpsc::Sender<Response>,
    output_tx: mpsc::Sender<()>,
    last_output_ns: Arc<AtomicI64>,
) {
    let mut reader = BufReader::with_capacity(READER_BUFFER, stdout);
    let mut line = String::new();
    let mut in_block = false;
    let mut body = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);

        match parse_control_line(trimmed) {
            ControlLine::Begin => {
                in_block = true;
                body.clear();
            }
            ControlLine::End => {
                if in_block {
                    in_block = false;
                    let _ = response_tx
                        .send(Response {
                            ok: true,
                            text: std::mem::take(&mut body),
                        })
                        .await;
                }
            }
            // Delivered even outside a block: some servers emit the
            // attach failure before any %begin.
            ControlLine::Error(msg) => {
                in_block = false;
                let text = if msg.is_empty() {
                    std::mem::take(&mut body)
                } else {
                    body.clear();
                    msg
                };
                let _ = response_tx.send(Response { ok: false, text }).await;
            }
            ControlLine::Output => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                last_output_ns.store(now, Ordering::Relaxed);
                // Coalesce: a full channel means the consumer already has
                // a pending wakeup.
                let _ = output_tx.try_send(());
            }
            // %session-changed etc. interleave with capture bodies; they
            // must never be appended to one.
            ControlLine::Notification => {}
            ControlLine::Data(data) => {
                if in_block {
                    if !body.is_empty() {
                        body.push('\n');
                    }
                    body.push_str(data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_begin_end_error() {
        assert_eq!(parse_control_line("%begin 1700000000 42 1"), ControlLine::Begin);
        assert_eq!(parse_control_line("%end 1700000000 42 1"), ControlLine::End);
        assert_eq!(
            parse_control_line("%error 1700000000 42 can't find session: x"),
            ControlLine::Error("can't find session: x".into())
        );
    }

    #[test]
    fn test_parse_error_message_from_fourth_token() {
        // Message is tokens from index 3 onward.
        assert_eq!(
            parse_control_line("%error 1 2 bad command"),
            ControlLine::Error("bad command".into())
        );
        assert_eq!(parse_control_line("%error 1 2"), ControlLine::Error(String::new()));
    }

    #[test]
    fn test_parse_output_and_notifications() {
        assert_eq!(parse_control_line("%output %5 aGVsbG8="), ControlLine::Output);
        assert_eq!(
            parse_control_line("%session-changed $1 main"),
            ControlLine::Notification
        );
        assert_eq!(parse_control_line("%exit"), ControlLine::Notification);
    }

    #[test]
    fn test_parse_prefix_requires_trailing_space() {
        // "%endless" must not terminate a block.
        assert_eq!(parse_control_line("%endless"), ControlLine::Notification);
        assert_eq!(parse_control_line("plain text"), ControlLine::Data("plain text"));
        assert_eq!(parse_control_line(""), ControlLine::Data(""));
    }

    #[tokio::test]
    async fn test_reader_loop_brackets_responses() {
        let (response_tx, mut response_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(OUTPUT_EVENTS);
        let last_output = Arc::new(AtomicI64::new(0));

        // %output and %session-changed interleaved inside a block must
        // not leak into the body.
        let script = "%begin 1 0 1\n%end 1 0 1\n\
                      %begin 1 1 1\nline one\n%output %0 noise\n\
                      %session-changed $1 main\nline two\n%end 1 1 1\n\
                      %begin 1 2 1\n%error 1 2 oops here\n";
        let (mut tx, rx) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut tx, script.as_bytes())
            .await
            .unwrap();
        drop(tx);

        reader_loop(rx, response_tx, output_tx, last_output.clone()).await;

        let handshake = response_rx.recv().await.unwrap();
        assert!(handshake.ok);
        assert_eq!(handshake.text, "");

        let capture = response_rx.recv().await.unwrap();
        assert!(capture.ok);
        assert_eq!(capture.text, "line one\nline two");

        let err = response_rx.recv().await.unwrap();
        assert!(!err.ok);
        assert_eq!(err.text, "oops here");

        assert!(output_rx.try_recv().is_ok());
        assert!(last_output.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_reader_loop_large_capture_body() {
        let (response_tx, mut response_rx) = mpsc::channel(16);
        let (output_tx, _output_rx) = mpsc::channel(OUTPUT_EVENTS);

        // A response body larger than the reader buffer must come
        // through intact.
        let big_line = "x".repeat(3 * 1024 * 1024);
        let script = format!("%begin 1 0 1\n{big_line}\n%end 1 0 1\n");
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            tokio::io::AsyncWriteExt::write_all(&mut tx, script.as_bytes())
                .await
                .unwrap();
        });

        reader_loop(rx, response_tx, output_tx, Arc::new(AtomicI64::new(0))).await;
        writer.await.unwrap();

        let resp = response_rx.recv().await.unwrap();
        assert!(resp.ok);
        assert_eq!(resp.text.len(), 3 * 1024 * 1024);
    }
}
