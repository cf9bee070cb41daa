//! Session - owns one formatter daemon and the requests in flight to it.
//!
//! Flow:
//! 1. `ensure_started()` spawns the daemon (Unstarted/Terminated -> Starting -> Running)
//! 2. `format()` registers an id, writes the request, and waits for the first of
//!    reply / cancel / timeout / daemon exit
//! 3. A dispatcher task per daemon decodes stdout lines and resolves table entries
//! 4. On daemon exit: the session goes Terminated and that daemon's requests fail
//!    with `DaemonExited`. Restart happens only when a caller asks again.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Inbound, ReplyOutcome, Request, RequestId, WireCodec};
use crate::config::SessionConfig;
use crate::supervisor::{
    DaemonEvent, DaemonExit, DaemonId, DaemonProcess, SpawnError, SupervisorError,
};
use crate::table::{Completion, PendingGuard, RequestTable, Routed};

/// How long `shutdown()` waits for the shutdown envelope to be written.
const SHUTDOWN_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Longest daemon output echoed into a log line.
const LOG_LINE_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No daemon has been started yet.
    #[default]
    Unstarted,
    Starting,
    Running,
    /// The daemon exited, failed to start, or was shut down.
    Terminated,
}

/// Point-in-time view of a session, for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon_id: Option<DaemonId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Number of daemons spawned over the session's life.
    pub starts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<DaemonExit>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("formatter daemon unavailable: {0}")]
    DaemonUnavailable(#[source] Arc<SpawnError>),
    #[error("failed to send request to daemon: {0}")]
    SendFailed(#[source] Arc<SupervisorError>),
    #[error("{0}")]
    DaemonError(String),
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("request canceled")]
    Canceled,
    #[error("daemon exited ({0})")]
    DaemonExited(String),
    #[error("request of {len} bytes exceeds the {max} byte limit")]
    RequestTooLarge { len: usize, max: usize },
    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl SessionError {
    /// Cancellation is a user action, not a failure worth reporting.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// True when the daemon is gone and a retry would start a new one.
    pub fn is_daemon_down(&self) -> bool {
        matches!(
            self,
            Self::DaemonUnavailable(_) | Self::SendFailed(_) | Self::DaemonExited(_)
        )
    }
}

struct Lifecycle {
    state: SessionState,
    daemon: Option<Arc<DaemonProcess>>,
    starts: u64,
    last_exit: Option<DaemonExit>,
}

type SharedLifecycle = Arc<StdMutex<Lifecycle>>;

fn lock_lifecycle(lifecycle: &StdMutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Session lifecycle mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

/// One formatter daemon plus the requests in flight to it.
///
/// Share it as `Arc<Session>`; every method takes `&self`. Dropping the
/// session kills its daemon.
pub struct Session {
    config: SessionConfig,
    codec: WireCodec,
    table: Arc<RequestTable>,
    lifecycle: SharedLifecycle,
    /// Serializes spawn/shutdown so only one daemon is ever being started.
    start_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let codec = WireCodec::new(config.encoding);
        Self {
            config,
            codec,
            table: Arc::new(RequestTable::new()),
            lifecycle: Arc::new(StdMutex::new(Lifecycle {
                state: SessionState::Unstarted,
                daemon: None,
                starts: 0,
                last_exit: None,
            })),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        lock_lifecycle(&self.lifecycle).state
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let pending = self.table.len();
        let lifecycle = lock_lifecycle(&self.lifecycle);
        SessionSnapshot {
            state: lifecycle.state,
            pending,
            daemon_id: lifecycle.daemon.as_ref().map(|d| d.id()),
            pid: lifecycle.daemon.as_ref().and_then(|d| d.pid()),
            starts: lifecycle.starts,
            last_exit: lifecycle.last_exit,
        }
    }

    /// Start the daemon unless one is already running.
    pub async fn ensure_started(&self) -> Result<(), SessionError> {
        self.ensure_running().await.map(|_| ())
    }

    /// Format `text` with the configured default timeout.
    pub async fn format_default(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<String, SessionError> {
        self.format(text, cancel, self.config.effective_timeout())
            .await
    }

    /// Send `text` to the daemon and wait for the formatted result.
    ///
    /// Resolves with whichever happens first: the reply, `cancel` firing,
    /// `timeout` elapsing (`None` waits indefinitely), or the daemon exiting.
    /// Never retried internally.
    pub async fn format(
        &self,
        text: &str,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<String, SessionError> {
        let max = self.config.max_request_bytes;
        if text.len() > max {
            return Err(SessionError::RequestTooLarge {
                len: text.len(),
                max,
            });
        }

        if cancel.is_cancelled() {
            return Err(SessionError::Canceled);
        }

        let daemon = self.ensure_running().await?;
        let (id, completion) = self.table.register(daemon.id());
        let _pending = PendingGuard::new(&self.table, id);

        let line = self
            .codec
            .encode_format(id, text)
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        tracing::debug!(
            request_id = %id,
            daemon_id = %daemon.id(),
            text_bytes = text.len(),
            "Sending format request"
        );
        let started = Instant::now();
        let result = self
            .exchange(&daemon, id, &line, completion, cancel, timeout)
            .await;

        match &result {
            Ok(formatted) => tracing::debug!(
                request_id = %id,
                elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                changed = formatted != text,
                "Format request succeeded"
            ),
            Err(e) if e.is_canceled() => {
                tracing::debug!(request_id = %id, "Format request canceled")
            }
            Err(e) => tracing::info!(request_id = %id, error = %e, "Format request failed"),
        }
        result
    }

    /// Round-trip a `ping` through the daemon, starting it if needed.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Duration, SessionError> {
        let daemon = self.ensure_running().await?;
        let (id, completion) = self.table.register(daemon.id());
        let _pending = PendingGuard::new(&self.table, id);

        let line = self
            .codec
            .encode(&Request::Ping { id })
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        let started = Instant::now();
        self.exchange(
            &daemon,
            id,
            &line,
            completion,
            &CancellationToken::new(),
            timeout,
        )
        .await?;
        Ok(started.elapsed())
    }

    /// Stop the daemon: best-effort shutdown envelope, then kill.
    ///
    /// Never fails. Safe to call repeatedly and before anything was started.
    /// Outstanding requests fail with `DaemonExited`.
    pub async fn shutdown(&self) {
        let _guard = self.start_lock.lock().await;

        let daemon = {
            let mut lifecycle = lock_lifecycle(&self.lifecycle);
            if lifecycle.state != SessionState::Unstarted {
                lifecycle.state = SessionState::Terminated;
            }
            lifecycle.daemon.take()
        };

        if let Some(daemon) = daemon {
            tracing::info!(daemon_id = %daemon.id(), pid = daemon.pid(), "Shutting down daemon");
            match tokio::time::timeout(
                SHUTDOWN_WRITE_TIMEOUT,
                daemon.write_line(WireCodec::shutdown_line()),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Shutdown envelope not delivered"),
                Err(_) => tracing::debug!("Shutdown envelope write timed out"),
            }
            daemon.kill();
        }

        let drained = self
            .table
            .drain_all(SessionError::DaemonExited("session shut down".to_string()));
        if drained > 0 {
            tracing::info!(drained, "Failed pending requests on shutdown");
        }
    }

    fn running_daemon(&self) -> Option<Arc<DaemonProcess>> {
        let lifecycle = lock_lifecycle(&self.lifecycle);
        match (&lifecycle.state, &lifecycle.daemon) {
            (SessionState::Running, Some(daemon)) if daemon.is_alive() => Some(Arc::clone(daemon)),
            _ => None,
        }
    }

    async fn ensure_running(&self) -> Result<Arc<DaemonProcess>, SessionError> {
        if let Some(daemon) = self.running_daemon() {
            return Ok(daemon);
        }
        self.start_daemon()
            .await
            .map_err(|e| SessionError::DaemonUnavailable(Arc::new(e)))
    }

    async fn start_daemon(&self) -> Result<Arc<DaemonProcess>, SpawnError> {
        let _guard = self.start_lock.lock().await;
        // Another caller may have started it while we waited.
        if let Some(daemon) = self.running_daemon() {
            return Ok(daemon);
        }

        let stale = {
            let mut lifecycle = lock_lifecycle(&self.lifecycle);
            lifecycle.state = SessionState::Starting;
            lifecycle.daemon.take()
        };
        if let Some(stale) = stale {
            // Dead but its exit not yet reported; make sure it is really gone.
            stale.kill();
        }

        let spec = self.config.launch_spec();
        match DaemonProcess::start(
            self.config.spawner.as_ref(),
            &spec,
            self.config.supervisor_options(),
        ) {
            Ok((daemon, events)) => {
                let daemon = Arc::new(daemon);
                {
                    let mut lifecycle = lock_lifecycle(&self.lifecycle);
                    lifecycle.daemon = Some(Arc::clone(&daemon));
                    lifecycle.state = SessionState::Running;
                    lifecycle.starts += 1;
                }
                tokio::spawn(dispatch_events(
                    daemon.id(),
                    events,
                    self.codec,
                    Arc::clone(&self.table),
                    Arc::clone(&self.lifecycle),
                ));
                Ok(daemon)
            }
            Err(e) => {
                tracing::error!(
                    executable = %spec.executable.display(),
                    error = %e,
                    "Failed to start daemon"
                );
                lock_lifecycle(&self.lifecycle).state = SessionState::Terminated;
                Err(e)
            }
        }
    }

    /// Write `line` and wait for `id` to resolve, racing cancel and timeout.
    async fn exchange(
        &self,
        daemon: &DaemonProcess,
        id: RequestId,
        line: &str,
        mut completion: oneshot::Receiver<Completion>,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Completion {
        let interrupted = {
            let send_and_wait = async {
                if let Err(e) = daemon.write_line(line).await {
                    tracing::warn!(request_id = %id, error = %e, "Failed to send request");
                    self.table
                        .cancel_with(id, SessionError::SendFailed(Arc::new(e)));
                }
                (&mut completion).await
            };
            let deadline = async {
                match timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                result = send_and_wait => return flatten(result),
                _ = cancel.cancelled() => SessionError::Canceled,
                _ = deadline => SessionError::Timeout(timeout.unwrap_or_default()),
            }
        };

        // If a reply (or exit) got there first this is a no-op and `completion`
        // already holds the winner.
        self.table.cancel_with(id, interrupted);
        flatten(completion.await)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(daemon) = lock_lifecycle(&self.lifecycle).daemon.take() {
            daemon.kill();
        }
    }
}

fn flatten(received: Result<Completion, oneshot::error::RecvError>) -> Completion {
    received.unwrap_or_else(|_| Err(SessionError::DaemonExited("request abandoned".to_string())))
}

fn preview(line: &str) -> String {
    let mut chars = line.chars();
    let head: String = chars.by_ref().take(LOG_LINE_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Route one daemon's events until it exits, then fail what it left behind.
async fn dispatch_events(
    daemon_id: DaemonId,
    mut events: mpsc::UnboundedReceiver<DaemonEvent>,
    codec: WireCodec,
    table: Arc<RequestTable>,
    lifecycle: SharedLifecycle,
) {
    let mut exit = DaemonExit::default();
    while let Some(event) = events.recv().await {
        match event {
            DaemonEvent::Line(line) => route_line(daemon_id, &codec, &table, &line),
            DaemonEvent::OversizedLine { len } => {
                tracing::warn!(
                    target: "formatd::protocol",
                    %daemon_id,
                    len,
                    "Oversized reply line dropped"
                );
            }
            DaemonEvent::Exited(status) => {
                exit = status;
                break;
            }
        }
    }

    {
        let mut lifecycle = lock_lifecycle(&lifecycle);
        let current = lifecycle.daemon.as_ref().map(|d| d.id()) == Some(daemon_id);
        if current {
            lifecycle.daemon = None;
            lifecycle.state = SessionState::Terminated;
        }
        lifecycle.last_exit = Some(exit);
    }

    let drained = table.drain_daemon(daemon_id, SessionError::DaemonExited(exit.to_string()));
    if drained > 0 {
        tracing::warn!(%daemon_id, drained, %exit, "Failed pending requests: daemon exited");
    }
}

fn route_line(daemon_id: DaemonId, codec: &WireCodec, table: &RequestTable, line: &str) {
    match codec.decode(line) {
        Ok(Inbound::Reply(reply)) => {
            let id = reply.id;
            let result = match reply.outcome {
                ReplyOutcome::Ok(text) => Ok(text),
                ReplyOutcome::Err(message) => Err(SessionError::DaemonError(message)),
            };
            match table.resolve(id, result) {
                Routed::Delivered => tracing::trace!(
                    request_id = %id,
                    daemon_ms = reply.elapsed_ms,
                    "Reply routed"
                ),
                Routed::Late => tracing::debug!(
                    target: "formatd::protocol",
                    request_id = %id,
                    "Late reply for abandoned request dropped"
                ),
                Routed::Unknown => tracing::warn!(
                    target: "formatd::protocol",
                    %daemon_id,
                    request_id = %id,
                    "Reply for unknown request dropped"
                ),
            }
        }
        Ok(Inbound::Unsolicited(unsolicited)) => match unsolicited.error {
            Some(error) => tracing::warn!(
                target: "formatd::protocol",
                %daemon_id,
                %error,
                "Unsolicited error from daemon"
            ),
            None => tracing::debug!(
                target: "formatd::protocol",
                %daemon_id,
                ok = unsolicited.ok,
                line = %preview(line),
                "Unsolicited line"
            ),
        },
        Err(e) => tracing::warn!(
            target: "formatd::protocol",
            %daemon_id,
            error = %e,
            line = %preview(line),
            "Malformed reply dropped"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use futures::{FutureExt, StreamExt};
    use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;
    use tokio_util::codec::FramedRead;

    use crate::bridge::codec::{LineCodec, LineFrame};
    use crate::bridge::protocol::PayloadEncoding;
    use crate::supervisor::{DaemonChild, DaemonSpawner, LaunchSpec, SpawnedDaemon};

    /// The daemon's side of an in-memory session.
    struct FakeIo {
        requests: FramedRead<ReadHalf<DuplexStream>, LineCodec>,
        replies: WriteHalf<DuplexStream>,
    }

    impl FakeIo {
        async fn next_request(&mut self) -> Option<serde_json::Value> {
            match self.requests.next().await? {
                Ok(LineFrame::Line(line)) => serde_json::from_str(&line).ok(),
                _ => None,
            }
        }

        async fn reply(&mut self, line: &str) {
            let _ = self.replies.write_all(line.as_bytes()).await;
            let _ = self.replies.write_all(b"\n").await;
        }

        async fn echo(&mut self, request: &serde_json::Value) {
            let reply = serde_json::json!({
                "id": request["id"],
                "ok": true,
                "text": request["text"],
            });
            self.reply(&reply.to_string()).await;
        }
    }

    type Behavior = Arc<dyn Fn(FakeIo) -> BoxFuture<'static, ()> + Send + Sync>;

    /// A daemon that lives as a tokio task; the task ending is the process exiting.
    struct FakeChild {
        task: JoinHandle<()>,
    }

    #[async_trait]
    impl DaemonChild for FakeChild {
        fn pid(&self) -> Option<u32> {
            None
        }

        async fn wait(&mut self) -> io::Result<DaemonExit> {
            match (&mut self.task).await {
                Ok(()) => Ok(DaemonExit::code(0)),
                Err(e) if e.is_cancelled() => Ok(DaemonExit::signal(9)),
                Err(e) => Err(io::Error::other(e)),
            }
        }

        fn start_kill(&mut self) -> io::Result<()> {
            self.task.abort();
            Ok(())
        }
    }

    struct FakeSpawner {
        behavior: Behavior,
        spawned: AtomicUsize,
    }

    impl FakeSpawner {
        fn new<F, Fut>(behavior: F) -> Arc<Self>
        where
            F: Fn(FakeIo) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = ()> + Send + 'static,
        {
            Arc::new(Self {
                behavior: Arc::new(move |io| behavior(io).boxed()),
                spawned: AtomicUsize::new(0),
            })
        }

        fn spawned(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    impl DaemonSpawner for FakeSpawner {
        fn spawn(&self, _spec: &LaunchSpec) -> Result<SpawnedDaemon, SpawnError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (client_read, client_write) = tokio::io::split(client);
            let (server_read, server_write) = tokio::io::split(server);
            let io = FakeIo {
                requests: FramedRead::new(server_read, LineCodec::new()),
                replies: server_write,
            };
            let task = tokio::spawn((self.behavior)(io));
            Ok(SpawnedDaemon {
                stdin: Box::new(client_write),
                stdout: Box::new(client_read),
                stderr: None,
                child: Box::new(FakeChild { task }),
            })
        }
    }

    struct FailingSpawner;

    impl DaemonSpawner for FailingSpawner {
        fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedDaemon, SpawnError> {
            Err(SpawnError::ExecutableNotFound {
                path: spec.executable.clone(),
            })
        }
    }

    /// Stdin whose every write fails as if the daemon closed its end.
    struct ClosedStdin;

    impl AsyncWrite for ClosedStdin {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// A live daemon that stopped reading stdin; the test drives its stdout.
    #[derive(Default)]
    struct ClosedStdinSpawner {
        stdout: StdMutex<Option<DuplexStream>>,
    }

    impl DaemonSpawner for ClosedStdinSpawner {
        fn spawn(&self, _spec: &LaunchSpec) -> Result<SpawnedDaemon, SpawnError> {
            let (client, server) = tokio::io::duplex(4096);
            *self.stdout.lock().unwrap() = Some(server);
            let task = tokio::spawn(std::future::pending::<()>());
            Ok(SpawnedDaemon {
                stdin: Box::new(ClosedStdin),
                stdout: Box::new(client),
                stderr: None,
                child: Box::new(FakeChild { task }),
            })
        }
    }

    fn session_with(spawner: Arc<dyn DaemonSpawner>) -> Session {
        Session::new(
            SessionConfig::new("/opt/rd-format/rd-format")
                .with_spawner(spawner)
                .with_exit_grace(Duration::from_millis(50)),
        )
    }

    fn echo_daemon() -> Arc<FakeSpawner> {
        FakeSpawner::new(|mut io: FakeIo| async move {
            while let Some(request) = io.next_request().await {
                match request["op"].as_str() {
                    Some("format") | Some("ping") => io.echo(&request).await,
                    Some("shutdown") => {
                        io.reply(r#"{"ok":true}"#).await;
                        return;
                    }
                    _ => {}
                }
            }
        })
    }

    /// Reads requests forever, never answers.
    fn silent_daemon() -> Arc<FakeSpawner> {
        FakeSpawner::new(|mut io: FakeIo| async move {
            while io.next_request().await.is_some() {}
            std::future::pending::<()>().await;
        })
    }

    async fn wait_for_pending(session: &Session, n: usize) {
        for _ in 0..200 {
            if session.pending() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} pending requests, have {}", session.pending());
    }

    async fn wait_for_state(session: &Session, state: SessionState) {
        for _ in 0..200 {
            if session.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {state:?}, have {:?}", session.state());
    }

    #[tokio::test]
    async fn echo_returns_text_unchanged() {
        let session = session_with(echo_daemon());
        assert_eq!(session.state(), SessionState::Unstarted);

        let text = "int main()\n{\treturn 0; // \"ok\" \\ \u{1}\n}\n";
        let formatted = session
            .format(text, &CancellationToken::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(formatted, text);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn b64_session_roundtrips() {
        let spawner = FakeSpawner::new(|mut io: FakeIo| async move {
            while let Some(request) = io.next_request().await {
                let reply = serde_json::json!({
                    "id": request["id"],
                    "ok": true,
                    "b64": request["b64"],
                    "ms": 0.5,
                });
                io.reply(&reply.to_string()).await;
            }
        });
        let session = Session::new(
            SessionConfig::new("/fake")
                .with_spawner(spawner)
                .with_encoding(PayloadEncoding::B64),
        );

        let text = "héllo\n\"world\"";
        let formatted = session
            .format(text, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(formatted, text);
    }

    #[tokio::test]
    async fn out_of_order_replies_route_by_id() {
        const N: usize = 5;
        let spawner = FakeSpawner::new(|mut io: FakeIo| async move {
            let mut held = Vec::new();
            while held.len() < N {
                match io.next_request().await {
                    Some(request) => held.push(request),
                    None => return,
                }
            }
            for request in held.iter().rev() {
                let reply = serde_json::json!({
                    "id": request["id"],
                    "ok": true,
                    "text": format!("formatted:{}", request["text"].as_str().unwrap_or("")),
                });
                io.reply(&reply.to_string()).await;
            }
            std::future::pending::<()>().await;
        });
        let session = Arc::new(session_with(spawner));
        session.ensure_started().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..N {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                let input = format!("request {i}");
                let output = session
                    .format(&input, &CancellationToken::new(), Some(Duration::from_secs(5)))
                    .await;
                (input, output)
            }));
        }

        for task in tasks {
            let (input, output) = task.await.unwrap();
            assert_eq!(output.unwrap(), format!("formatted:{input}"));
        }
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_then_late_reply_is_dropped() {
        // Holds the first request until the second arrives, then answers both.
        let spawner = FakeSpawner::new(|mut io: FakeIo| async move {
            let Some(first) = io.next_request().await else {
                return;
            };
            let Some(second) = io.next_request().await else {
                return;
            };
            io.echo(&first).await;
            io.echo(&second).await;
            std::future::pending::<()>().await;
        });
        let session = Arc::new(session_with(spawner));

        let cancel = CancellationToken::new();
        let canceled = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            tokio::spawn(async move { session.format("first", &cancel, None).await })
        };
        wait_for_pending(&session, 1).await;
        cancel.cancel();
        assert!(matches!(
            canceled.await.unwrap(),
            Err(SessionError::Canceled)
        ));
        assert_eq!(session.pending(), 0);

        // The late reply for "first" arrives before this one; it must not leak in.
        let second = session
            .format("second", &CancellationToken::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(second, "second");
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn exit_fails_every_outstanding_request() {
        const K: usize = 4;
        let spawner = FakeSpawner::new(|mut io: FakeIo| async move {
            for _ in 0..K {
                if io.next_request().await.is_none() {
                    return;
                }
            }
            // Returning ends the task: the fake process exits.
        });
        let session = Arc::new(session_with(spawner));
        session.ensure_started().await.unwrap();

        let tasks: Vec<_> = (0..K)
            .map(|i| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    session
                        .format(&format!("t{i}"), &CancellationToken::new(), None)
                        .await
                })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, SessionError::DaemonExited(_)), "{err}");
            assert!(err.is_daemon_down());
        }
        assert_eq!(session.pending(), 0);
        wait_for_state(&session, SessionState::Terminated).await;
        assert_eq!(session.snapshot().last_exit, Some(DaemonExit::code(0)));
    }

    #[tokio::test]
    async fn malformed_lines_do_not_resolve_or_crash() {
        let spawner = FakeSpawner::new(|mut io: FakeIo| async move {
            while let Some(request) = io.next_request().await {
                io.reply("garbage \u{7}\u{1b}[0m").await;
                io.reply(r#"{"ok":true,"text":"no id"}"#).await;
                io.reply(r#"{"id":"#).await;
                io.reply(r#"{"id":999,"ok":true,"text":"unknown"}"#).await;
                io.reply("[]").await;
                // Positionally a well-formed reply for this very request.
                io.reply(&format!(r#"[{},true,"from an array"]"#, request["id"]))
                    .await;
                io.echo(&request).await;
            }
        });
        let session = session_with(spawner);

        for text in ["a", "b"] {
            let formatted = session
                .format(text, &CancellationToken::new(), Some(Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(formatted, text);
        }
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn daemon_error_reply_is_surfaced() {
        let spawner = FakeSpawner::new(|mut io: FakeIo| async move {
            while let Some(request) = io.next_request().await {
                let reply = serde_json::json!({
                    "id": request["id"],
                    "ok": false,
                    "error": "internal error",
                });
                io.reply(&reply.to_string()).await;
            }
        });
        let session = session_with(spawner);

        let err = session
            .format("x", &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DaemonError(ref m) if m == "internal error"));
        assert_eq!(err.to_string(), "internal error");
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn timeout_removes_entry() {
        let session = session_with(silent_daemon());
        let started = Instant::now();

        let err = session
            .format("slow", &CancellationToken::new(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Timeout(d) if d == Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(session.pending(), 0);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn dropped_future_does_not_leak_entry() {
        let session = Arc::new(session_with(silent_daemon()));
        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .format("abandoned", &CancellationToken::new(), None)
                    .await
            })
        };
        wait_for_pending(&session, 1).await;
        task.abort();
        let _ = task.await;
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn shutdown_then_restart_uses_new_process() {
        let spawner = echo_daemon();
        let session = session_with(spawner.clone());

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Unstarted);

        assert_eq!(
            session
                .format("one", &CancellationToken::new(), Some(Duration::from_secs(5)))
                .await
                .unwrap(),
            "one"
        );
        let first_daemon = session.snapshot().daemon_id;

        session.shutdown().await;
        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Terminated);

        session.ensure_started().await.unwrap();
        assert_eq!(
            session
                .format("two", &CancellationToken::new(), Some(Duration::from_secs(5)))
                .await
                .unwrap(),
            "two"
        );

        let snapshot = session.snapshot();
        assert_eq!(spawner.spawned(), 2);
        assert_eq!(snapshot.starts, 2);
        assert_ne!(snapshot.daemon_id, first_daemon);
        assert_eq!(snapshot.state, SessionState::Running);
    }

    #[tokio::test]
    async fn shutdown_fails_outstanding_requests() {
        let session = Arc::new(session_with(silent_daemon()));
        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.format("x", &CancellationToken::new(), None).await })
        };
        wait_for_pending(&session, 1).await;

        session.shutdown().await;

        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::DaemonExited(_))
        ));
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn exit_is_not_restarted_automatically() {
        let spawner = FakeSpawner::new(|mut io: FakeIo| async move {
            if let Some(request) = io.next_request().await {
                io.echo(&request).await;
            }
        });
        let session = session_with(spawner.clone());

        assert_eq!(
            session
                .format("once", &CancellationToken::new(), Some(Duration::from_secs(5)))
                .await
                .unwrap(),
            "once"
        );
        wait_for_state(&session, SessionState::Terminated).await;
        assert_eq!(spawner.spawned(), 1);

        // The next call restarts on demand.
        assert_eq!(
            session
                .format("again", &CancellationToken::new(), Some(Duration::from_secs(5)))
                .await
                .unwrap(),
            "again"
        );
        assert_eq!(spawner.spawned(), 2);
    }

    #[tokio::test]
    async fn spawn_failure_is_daemon_unavailable() {
        let session = session_with(Arc::new(FailingSpawner));

        let err = session
            .format("x", &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DaemonUnavailable(_)));
        assert!(err.to_string().contains("not found"));
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn write_failure_is_send_failed() {
        let spawner = Arc::new(ClosedStdinSpawner::default());
        let session = session_with(spawner.clone());

        let err = session
            .format("x", &CancellationToken::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SendFailed(_)), "{err}");
        assert!(err.is_daemon_down());
        assert_eq!(session.pending(), 0);

        // A reply for the failed request still shows up later.
        let mut stdout = spawner.stdout.lock().unwrap().take().unwrap();
        stdout
            .write_all(b"{\"id\":1,\"ok\":true,\"text\":\"late\"}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The dispatcher consumed it as late; nothing was resolved by it.
        assert_eq!(session.pending(), 0);
        assert_eq!(
            session.table.resolve(RequestId::new(1), Ok(String::new())),
            Routed::Unknown
        );
    }

    #[tokio::test]
    async fn already_canceled_request_never_starts_daemon() {
        let spawner = echo_daemon();
        let session = session_with(spawner.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = session.format("x", &cancel, None).await.unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(spawner.spawned(), 0);
        assert_eq!(session.state(), SessionState::Unstarted);
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_before_sending() {
        let spawner = echo_daemon();
        let session = Session::new(
            SessionConfig::new("/fake")
                .with_spawner(spawner.clone())
                .with_max_request_bytes(8),
        );

        let err = session
            .format("0123456789", &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::RequestTooLarge { len: 10, max: 8 }));
        assert_eq!(spawner.spawned(), 0);
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let session = session_with(echo_daemon());
        let rtt = session.ping(Some(Duration::from_secs(5))).await.unwrap();
        assert!(rtt < Duration::from_secs(5));
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn ids_continue_across_restart() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let spawner = {
            let seen = Arc::clone(&seen);
            FakeSpawner::new(move |mut io: FakeIo| {
                let seen = Arc::clone(&seen);
                async move {
                    while let Some(request) = io.next_request().await {
                        if let Some(id) = request["id"].as_u64() {
                            seen.lock().unwrap().push(id);
                        }
                        io.echo(&request).await;
                    }
                }
            })
        };
        let session = session_with(spawner);
        let timeout = Some(Duration::from_secs(5));

        session.format("a", &CancellationToken::new(), timeout).await.unwrap();
        session.shutdown().await;
        session.format("b", &CancellationToken::new(), timeout).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn snapshot_serializes() {
        let snapshot = SessionSnapshot {
            state: SessionState::Terminated,
            pending: 0,
            daemon_id: None,
            pid: None,
            starts: 1,
            last_exit: Some(DaemonExit::code(1)),
        };
        insta::assert_snapshot!(
            serde_json::to_string(&snapshot).unwrap(),
            @r#"{"state":"TERMINATED","pending":0,"starts":1,"last_exit":{"code":1,"signal":null}}"#
        );
    }

    #[test]
    fn preview_truncates_long_lines() {
        let long = "x".repeat(LOG_LINE_PREVIEW_CHARS + 5);
        let shown = preview(&long);
        assert_eq!(shown.len(), LOG_LINE_PREVIEW_CHARS + 3);
        assert!(shown.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }
}
