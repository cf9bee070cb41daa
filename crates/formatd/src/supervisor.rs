//! Daemon process supervisor - owns the child process and its pipes.
//!
//! Flow:
//! 1. Spawn `<exe> --serve` with piped stdio (no shell, no window)
//! 2. Reader task frames stdout into lines and forwards them as events
//! 3. Stderr task logs diagnostics under `formatd::daemon`
//! 4. Exit watcher owns the child handle; it reports the exit exactly once,
//!    after giving the reader a grace period to deliver final replies
//!
//! Writes go through [`DaemonProcess::write_line`], serialized by an async
//! mutex so concurrent requests never interleave within a line.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{LineCodec, LineFrame};

/// Argument that switches the formatter into daemon mode.
pub const SERVE_ARG: &str = "--serve";

/// Identifies one spawned daemon process for the lifetime of the session.
///
/// UUID v4 rather than the pid: pids are recycled, and fake daemons have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaemonId(uuid::Uuid);

impl DaemonId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for DaemonId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a daemon process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl DaemonExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for DaemonExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for DaemonExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code={code}"),
            (None, Some(signal)) => write!(f, "signal={}", signal_name(signal)),
            (None, None) => f.write_str("status unknown"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match nix::sys::signal::Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => signal.to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    signal.to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("formatter executable not found: {}", path.display())]
    ExecutableNotFound { path: PathBuf },
    #[error("failed to launch {}: {source}", path.display())]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("write to daemon failed: {0}")]
    WriteFailed(#[source] io::Error),
    #[error("daemon is not running")]
    Exited,
}

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to a running child that can be awaited and killed.
///
/// Implemented for `tokio::process::Child`; tests provide in-process fakes.
#[async_trait]
pub trait DaemonChild: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to end. Called at most once to completion.
    async fn wait(&mut self) -> io::Result<DaemonExit>;

    /// Begin termination without waiting for it.
    fn start_kill(&mut self) -> io::Result<()>;
}

#[async_trait]
impl DaemonChild for Child {
    fn pid(&self) -> Option<u32> {
        Child::id(self)
    }

    async fn wait(&mut self) -> io::Result<DaemonExit> {
        Child::wait(self).await.map(DaemonExit::from)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        Child::start_kill(self)
    }
}

/// Pipes and handle of a freshly spawned daemon.
pub struct SpawnedDaemon {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Box<dyn DaemonChild>,
}

/// What to launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: vec![SERVE_ARG.to_string()],
            envs: Vec::new(),
        }
    }
}

/// Extension point for different daemon spawn strategies.
pub trait DaemonSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedDaemon, SpawnError>;
}

/// Spawns the daemon as a real OS process.
pub struct CommandSpawner;

impl DaemonSpawner for CommandSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedDaemon, SpawnError> {
        if !spec.executable.exists() {
            return Err(SpawnError::ExecutableNotFound {
                path: spec.executable.clone(),
            });
        }

        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(|source| SpawnError::LaunchFailed {
            path: spec.executable.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child.stderr.take();

        Ok(SpawnedDaemon {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Box::new(child),
        })
    }
}

/// Events from a daemon, in the order they happened.
///
/// `Exited` is always last and always sent exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    Line(String),
    OversizedLine { len: usize },
    Exited(DaemonExit),
}

/// Tunables for [`DaemonProcess::start`].
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub max_line_bytes: usize,
    /// How long to wait for stdout to drain after the process exits.
    pub exit_grace: Duration,
}

/// A running daemon: the write side plus kill/liveness control.
///
/// The read side is delivered through the event receiver returned by `start`.
pub struct DaemonProcess {
    id: DaemonId,
    pid: Option<u32>,
    writer: Mutex<FramedWrite<BoxedWriter, LineCodec>>,
    kill: CancellationToken,
    exited: Arc<AtomicBool>,
}

impl DaemonProcess {
    /// Spawn a daemon and start its reader, stderr, and exit-watcher tasks.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(
        spawner: &dyn DaemonSpawner,
        spec: &LaunchSpec,
        options: SupervisorOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DaemonEvent>), SpawnError> {
        let SpawnedDaemon {
            stdin,
            stdout,
            stderr,
            mut child,
        } = spawner.spawn(spec)?;

        let id = DaemonId::new();
        let pid = child.pid();
        tracing::info!(
            daemon_id = %id,
            pid,
            executable = %spec.executable.display(),
            args = ?spec.args,
            "Daemon started"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));

        let mut reader = tokio::spawn(read_stdout(
            id,
            stdout,
            options.max_line_bytes,
            event_tx.clone(),
        ));

        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(id, stderr, options.max_line_bytes));
        }

        let kill_for_watcher = kill.clone();
        let exited_for_watcher = Arc::clone(&exited);
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_for_watcher.cancelled() => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(daemon_id = %id, error = %e, "Kill failed (already exited?)");
                    }
                    child.wait().await
                }
            };
            let exit = status.unwrap_or_else(|e| {
                tracing::error!(daemon_id = %id, error = %e, "Failed to wait for daemon");
                DaemonExit::default()
            });
            exited_for_watcher.store(true, Ordering::Release);

            // Replies written just before exit are still in the pipe.
            if tokio::time::timeout(options.exit_grace, &mut reader)
                .await
                .is_err()
            {
                tracing::debug!(daemon_id = %id, "Stdout still open after exit, abandoning reader");
                reader.abort();
            }

            if exit.success() {
                tracing::info!(daemon_id = %id, %exit, "Daemon exited");
            } else {
                tracing::warn!(daemon_id = %id, %exit, "Daemon exited");
            }
            let _ = event_tx.send(DaemonEvent::Exited(exit));
        });

        let process = Self {
            id,
            pid,
            writer: Mutex::new(FramedWrite::new(
                stdin,
                LineCodec::with_max_length(options.max_line_bytes),
            )),
            kill,
            exited,
        };
        Ok((process, event_rx))
    }

    pub fn id(&self) -> DaemonId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::Acquire) && !self.kill.is_cancelled()
    }

    /// Write one line (a `\n` is appended) and flush.
    ///
    /// Whole lines are serialized: concurrent callers never interleave.
    pub async fn write_line(&self, line: &str) -> Result<(), SupervisorError> {
        let mut writer = self.writer.lock().await;
        if !self.is_alive() {
            return Err(SupervisorError::Exited);
        }
        writer
            .send(line)
            .await
            .map_err(SupervisorError::WriteFailed)
    }

    /// Best-effort termination. Never fails; repeated calls are no-ops.
    pub fn kill(&self) {
        if !self.kill.is_cancelled() {
            tracing::debug!(daemon_id = %self.id, pid = self.pid, "Killing daemon");
        }
        self.kill.cancel();
    }
}

async fn read_stdout(
    id: DaemonId,
    stdout: BoxedReader,
    max_line_bytes: usize,
    events: mpsc::UnboundedSender<DaemonEvent>,
) {
    let mut lines = FramedRead::new(stdout, LineCodec::with_max_length(max_line_bytes));
    while let Some(frame) = lines.next().await {
        let event = match frame {
            Ok(LineFrame::Line(line)) => DaemonEvent::Line(line),
            Ok(LineFrame::Oversized { len }) => DaemonEvent::OversizedLine { len },
            Err(e) => {
                tracing::warn!(daemon_id = %id, error = %e, "Daemon stdout read error");
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
    tracing::debug!(daemon_id = %id, "Stdout reader exiting");
}

async fn log_stderr(id: DaemonId, stderr: BoxedReader, max_line_bytes: usize) {
    let mut lines = FramedRead::new(stderr, LineCodec::with_max_length(max_line_bytes));
    while let Some(frame) = lines.next().await {
        match frame {
            Ok(LineFrame::Line(line)) => {
                tracing::info!(target: "formatd::daemon", daemon_id = %id, "{}", line);
            }
            Ok(LineFrame::Oversized { len }) => {
                tracing::warn!(target: "formatd::daemon", daemon_id = %id, len, "Oversized stderr line dropped");
            }
            Err(e) => {
                tracing::debug!(daemon_id = %id, error = %e, "Daemon stderr read error");
                break;
            }
        }
    }
}
