//! Owns the child process: write-one-frame, read-frame-stream, close-stdin, terminate (C3).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::wire::Frame;

/// How long `close()` waits for a polite exit before force-killing the child.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Idle,
    ShuttingDown,
    Closed,
}

/// A single classified frame received from the child, or a terminal transport error.
pub type FrameResult = Result<Frame, TransportError>;

/// Single-consumer, lazy, finite sequence of classified frames.
pub struct FrameStream {
    rx: mpsc::UnboundedReceiver<FrameResult>,
}

impl FrameStream {
    pub async fn next(&mut self) -> Option<FrameResult> {
        self.rx.recv().await
    }

    /// Test-only seam: builds a `FrameStream` from a raw channel so the session
    /// message loop can be driven with a scripted frame sequence instead of a real
    /// child's stdout, decoupling loop-semantics tests from process-pipe timing.
    #[cfg(test)]
    pub(crate) fn from_parts(rx: mpsc::UnboundedReceiver<FrameResult>) -> Self {
        FrameStream { rx }
    }
}

/// The subprocess transport.
pub struct Transport {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    shutdown: Mutex<ShutdownState>,
    frames_rx: Mutex<Option<mpsc::UnboundedReceiver<FrameResult>>>,
    subscribed: AtomicBool,
    connected: AtomicBool,
}

impl Transport {
    /// Spawns `binary args...` with piped stdio and starts the background reader task.
    pub async fn spawn(
        binary: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut command = Command::new(binary);
        command.args(args);
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = spawn_with_retry(&mut command, binary)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::LaunchFailed("child stdout pipe unavailable".to_string())
        })?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::unbounded_channel();

        let transport = Transport {
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            shutdown: Mutex::new(ShutdownState::Idle),
            frames_rx: Mutex::new(Some(rx)),
            subscribed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        };

        tokio::spawn(reader_loop(stdout, tx));
        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(stderr));
        }

        Ok(transport)
    }

    /// Delivers one framed write to the child's stdin, appending `\n` if absent.
    pub async fn write(&self, payload: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::NotConnected)?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| TransportError::WriteFailed(err.to_string()))?;
        if !payload.ends_with('\n') {
            stdin
                .write_all(b"\n")
                .await
                .map_err(|err| TransportError::WriteFailed(err.to_string()))?;
        }
        stdin
            .flush()
            .await
            .map_err(|err| TransportError::WriteFailed(err.to_string()))?;
        Ok(())
    }

    /// Returns the single-consumer frame stream. A second call fails deterministically.
    pub fn read_frames(&self) -> Result<FrameStream, TransportError> {
        if self
            .subscribed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransportError::AlreadySubscribed);
        }
        let mut guard = self.frames_rx.try_lock().map_err(|_| TransportError::AlreadySubscribed)?;
        let rx = guard.take().ok_or(TransportError::AlreadySubscribed)?;
        Ok(FrameStream { rx })
    }

    /// Closes the child's stdin half. Idempotent.
    pub async fn end_input(&self) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        if let Some(mut stdin) = guard.take() {
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }

    /// Terminates the child and tears down all pipes. Idempotent and concurrency-safe.
    pub async fn close(&self) {
        {
            let mut state = self.shutdown.lock().await;
            if *state != ShutdownState::Idle {
                return;
            }
            *state = ShutdownState::ShuttingDown;
        }

        let _ = self.end_input().await;

        let mut child_guard = self.child.lock().await;
        if let Some(child) = child_guard.as_mut() {
            match time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(?status, "child exited within grace period"),
                Ok(Err(err)) => warn!(%err, "error waiting for child during close"),
                Err(_) => {
                    warn!("child did not exit within grace period, force-killing");
                    if let Err(err) = child.start_kill() {
                        warn!(%err, "failed to force-kill child");
                    }
                    let _ = child.wait().await;
                }
            }
        }
        *child_guard = None;
        self.connected.store(false, Ordering::SeqCst);

        let mut state = self.shutdown.lock().await;
        *state = ShutdownState::Closed;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn reader_loop(stdout: tokio::process::ChildStdout, tx: mpsc::UnboundedSender<FrameResult>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Frame::classify(&line) {
                    Ok(frame) => {
                        if tx.send(Ok(frame)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(%err, "dropping undecodable frame");
                        if tx.send(Err(err)).is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                let _ = tx.send(Err(TransportError::ProcessTerminated(None)));
                return;
            }
            Err(err) => {
                let _ = tx.send(Err(TransportError::Decode(err.to_string())));
                return;
            }
        }
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "claude_cli_stderr", "{line}");
    }
}

fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, TransportError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(TransportError::LaunchFailed(format!(
                    "failed to spawn {}: {source}",
                    binary.display()
                )));
            }
        }
    }
    Err(TransportError::LaunchFailed(format!(
        "failed to spawn {} after retries",
        binary.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_read_frames_call_fails() {
        let (_tx, rx) = mpsc::unbounded_channel::<FrameResult>();
        let transport = Transport {
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            shutdown: Mutex::new(ShutdownState::Idle),
            frames_rx: Mutex::new(Some(rx)),
            subscribed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        };
        assert!(transport.read_frames().is_ok());
        assert!(matches!(
            transport.read_frames(),
            Err(TransportError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_without_a_child() {
        let transport = Transport {
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            shutdown: Mutex::new(ShutdownState::Idle),
            frames_rx: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        };
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_connected());
    }
}
