use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use beach_lookout_core::{ClientEnvelope, ServerEnvelope, DEFAULT_MAX_FRAME_BYTES};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::supervisor::{ExecutionRequest, ExecutionState, ExecutionSupervisor, OutputSink};
use crate::telemetry;
use crate::transport::Target;

const DEFAULT_QUEUE_DEPTH: usize = 4096;

pub const BUSY_NOTICE: &str =
    "a command is already running; only one command can be executed at a time";

/// What happens when a command arrives while another is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// Refuse the newcomer with an `error` notice; the running command keeps
    /// streaming.
    #[default]
    RejectWhileBusy,
    /// Cancel the running command; the newcomer starts once the old one has
    /// sent its terminal envelope.
    ReplaceRunning,
}

/// What happens to frames that are not a `command` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownMessagePolicy {
    #[default]
    Warn,
    Close,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_depth: usize,
    pub max_frame_bytes: usize,
    pub ping_interval: Duration,
    pub read_deadline: Duration,
    pub write_timeout: Duration,
    pub concurrency: ConcurrencyPolicy,
    pub unknown_messages: UnknownMessagePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            ping_interval: Duration::from_secs(9),
            read_deadline: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            concurrency: ConcurrencyPolicy::RejectWhileBusy,
            unknown_messages: UnknownMessagePolicy::Warn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    Close,
}

/// One browser connection. Cheap to clone; every clone is the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    target: Target,
    config: SessionConfig,
    supervisor: ExecutionSupervisor,
    lifecycle: CancellationToken,
    closed: AtomicBool,
    outbound: RwLock<Option<mpsc::Sender<ServerEnvelope>>>,
    dropped: AtomicU64,
    active: Mutex<Option<ActiveExecution>>,
}

struct ActiveExecution {
    id: Uuid,
    token: CancellationToken,
    done: Arc<AtomicBool>,
    state: Arc<Mutex<ExecutionState>>,
    handle: JoinHandle<()>,
}

impl ActiveExecution {
    fn is_running(&self) -> bool {
        !self.done.load(Ordering::Acquire) && !self.handle.is_finished()
    }
}

impl Session {
    pub fn new(
        target: Target,
        config: SessionConfig,
        supervisor: ExecutionSupervisor,
    ) -> (Self, mpsc::Receiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let session = Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                target,
                config,
                supervisor,
                lifecycle: CancellationToken::new(),
                closed: AtomicBool::new(false),
                outbound: RwLock::new(Some(tx)),
                dropped: AtomicU64::new(0),
                active: Mutex::new(None),
            }),
        };
        (session, rx)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn dropped_messages(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn lifecycle(&self) -> &CancellationToken {
        &self.inner.lifecycle
    }

    pub fn has_running_execution(&self) -> bool {
        self.inner
            .active
            .lock()
            .as_ref()
            .is_some_and(ActiveExecution::is_running)
    }

    /// State of the most recent execution, if this session ever ran one.
    pub fn execution_state(&self) -> Option<ExecutionState> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| *active.state.lock())
    }

    /// Enqueues without waiting. A full queue drops `envelope`.
    pub fn send(&self, envelope: ServerEnvelope) -> bool {
        if self.is_closed() {
            return false;
        }
        let outbound = self.inner.outbound.read();
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                counter!(
                    telemetry::OUTBOUND_DROPPED,
                    1,
                    "kind" => envelope.kind().as_str()
                );
                if dropped == 1 || dropped % 1024 == 0 {
                    warn!(
                        session_id = %self.inner.id,
                        dropped,
                        "outbound queue full; dropping messages"
                    );
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Tears the session down. Returns `true` only for the call that actually
    /// closed it.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.lifecycle.cancel();
        self.inner.outbound.write().take();
        counter!(telemetry::SESSIONS_CLOSED, 1);
        info!(
            session_id = %self.inner.id,
            dropped = self.dropped_messages(),
            "session closed"
        );
        true
    }

    /// Parses one inbound text frame and acts on it.
    pub fn handle_text(&self, text: &str) -> FrameAction {
        let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(err) => return self.reject_frame(format!("malformed message: {err}")),
        };
        if !envelope.is_command() {
            return self.reject_frame(format!("unsupported message type: {}", envelope.kind));
        }
        self.start_command(envelope.command);
        FrameAction::Continue
    }

    fn reject_frame(&self, notice: String) -> FrameAction {
        counter!(telemetry::FRAMES_REJECTED, 1);
        match self.inner.config.unknown_messages {
            UnknownMessagePolicy::Warn => {
                debug!(session_id = %self.inner.id, %notice, "rejecting frame");
                self.send(ServerEnvelope::Error(notice));
                FrameAction::Continue
            }
            UnknownMessagePolicy::Close => {
                info!(session_id = %self.inner.id, %notice, "closing on unsupported frame");
                FrameAction::Close
            }
        }
    }

    /// Starts `encoded` in the background under the session's concurrency
    /// policy. Returns `false` when the command was refused.
    pub fn start_command(&self, encoded: String) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut slot = self.inner.active.lock();
        let existing = slot.take();
        let previous = match existing {
            Some(active) if active.is_running() => match self.inner.config.concurrency {
                ConcurrencyPolicy::RejectWhileBusy => {
                    *slot = Some(active);
                    drop(slot);
                    counter!(telemetry::COMMANDS_REJECTED_BUSY, 1);
                    self.send(ServerEnvelope::Error(BUSY_NOTICE.to_string()));
                    return false;
                }
                ConcurrencyPolicy::ReplaceRunning => {
                    debug!(
                        session_id = %self.inner.id,
                        execution_id = %active.id,
                        "replacing running command"
                    );
                    active.token.cancel();
                    Some(active.handle)
                }
            },
            _ => None,
        };

        let execution_id = Uuid::new_v4();
        let token = self.inner.lifecycle.child_token();
        let done = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(ExecutionState::Pending));
        let sink: Arc<dyn OutputSink> = Arc::new(ExecutionSink {
            session: self.clone(),
            done: Arc::clone(&done),
            state: Arc::clone(&state),
        });
        let request = ExecutionRequest {
            encoded,
            target: self.inner.target.clone(),
        };
        let supervisor = self.inner.supervisor.clone();
        let exec_token = token.clone();
        let span = info_span!(
            "execution",
            session_id = %self.inner.id,
            execution_id = %execution_id,
        );

        let handle = tokio::spawn(
            async move {
                if let Some(previous) = previous {
                    // The old execution sends its terminal envelope first.
                    let _ = previous.await;
                }
                let _ = supervisor.run(exec_token, request, sink).await;
            }
            .instrument(span),
        );

        *slot = Some(ActiveExecution {
            id: execution_id,
            token,
            done,
            state,
            handle,
        });
        true
    }

    /// Waits for the current execution, if any, to finish.
    pub async fn join_execution(&self) {
        let active = self.inner.active.lock().take();
        if let Some(active) = active {
            let _ = active.handle.await;
        }
    }

    /// Drives the connection until either side goes away, then closes the
    /// session and waits for its execution to wind down.
    pub async fn serve(self, socket: WebSocket, outbound: mpsc::Receiver<ServerEnvelope>) {
        let (ws_tx, ws_rx) = socket.split();
        let writer = tokio::spawn(write_loop(self.clone(), ws_tx, outbound));

        self.read_loop(ws_rx).await;
        self.close();

        if let Err(err) = writer.await {
            warn!(session_id = %self.inner.id, error = %err, "writer task failed");
        }
        self.join_execution().await;
    }

    async fn read_loop(&self, mut ws_rx: SplitStream<WebSocket>) {
        let read_deadline = self.inner.config.read_deadline;
        let mut deadline = Instant::now() + read_deadline;

        loop {
            let next = tokio::select! {
                _ = self.inner.lifecycle.cancelled() => break,
                next = timeout_at(deadline, ws_rx.next()) => next,
            };
            let message = match next {
                Err(_) => {
                    info!(session_id = %self.inner.id, "read deadline expired");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    warn!(session_id = %self.inner.id, error = %err, "websocket read failed");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            let action = match message {
                Message::Text(text) => self.handle_text(&text),
                Message::Binary(_) => self.reject_frame("binary frames are not supported".into()),
                Message::Pong(_) => {
                    deadline = Instant::now() + read_deadline;
                    FrameAction::Continue
                }
                Message::Ping(_) => FrameAction::Continue,
                Message::Close(frame) => {
                    info!(
                        session_id = %self.inner.id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    FrameAction::Close
                }
            };
            if action == FrameAction::Close {
                break;
            }
        }
    }
}

async fn write_loop(
    session: Session,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerEnvelope>,
) {
    let config = session.config().clone();
    let lifecycle = session.lifecycle().clone();
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        let frame = tokio::select! {
            biased;
            _ = lifecycle.cancelled() => break,
            envelope = outbound.recv() => match envelope {
                Some(envelope) => match serde_json::to_string(&envelope) {
                    Ok(text) => Message::Text(text),
                    Err(err) => {
                        warn!(session_id = %session.id(), error = %err, "failed to encode envelope");
                        continue;
                    }
                },
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(config.write_timeout, ws_tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(session_id = %session.id(), error = %err, "websocket write failed");
                break;
            }
            Err(_) => {
                warn!(session_id = %session.id(), "websocket write stalled");
                counter!(telemetry::WRITE_STALLS, 1);
                break;
            }
        }
    }

    session.close();
    let _ = timeout(config.write_timeout, ws_tx.send(Message::Close(None))).await;
}

/// Routes one execution's envelopes into the session queue and marks the
/// execution done just before its terminal envelope is queued, so a client
/// reacting to that envelope is never told the session is still busy.
struct ExecutionSink {
    session: Session,
    done: Arc<AtomicBool>,
    state: Arc<Mutex<ExecutionState>>,
}

impl OutputSink for ExecutionSink {
    fn deliver(&self, envelope: ServerEnvelope) {
        if envelope.is_terminal() {
            self.done.store(true, Ordering::Release);
        }
        self.session.send(envelope);
    }

    fn transition(&self, state: ExecutionState) {
        debug!(session_id = %self.session.id(), state = state.as_str(), "execution state");
        *self.state.lock() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CommandPolicy;
    use crate::supervisor::ExecutionLimits;
    use crate::transport::HostTransports;
    use beach_lookout_core::encode_command;

    fn supervisor() -> ExecutionSupervisor {
        let policy = CommandPolicy::new(["echo", "sleep", "printf"], ["rm", "sudo"]);
        ExecutionSupervisor::new(
            Arc::new(policy),
            Arc::new(HostTransports::local_only("/bin/sh")),
            ExecutionLimits::default(),
        )
    }

    fn session(config: SessionConfig) -> (Session, mpsc::Receiver<ServerEnvelope>) {
        Session::new(Target::Local, config, supervisor())
    }

    async fn next_terminal(rx: &mut mpsc::Receiver<ServerEnvelope>) -> Vec<ServerEnvelope> {
        let mut seen = Vec::new();
        while let Some(envelope) = rx.recv().await {
            let terminal = envelope.is_terminal();
            seen.push(envelope);
            if terminal {
                break;
            }
        }
        seen
    }

    #[test_timeout::timeout]
    fn full_queue_drops_the_newest_message() {
        let (session, mut rx) = session(SessionConfig {
            queue_depth: 2,
            ..SessionConfig::default()
        });

        assert!(session.send(ServerEnvelope::Output("1".into())));
        assert!(session.send(ServerEnvelope::Output("2".into())));
        assert!(!session.send(ServerEnvelope::Output("3".into())));
        assert!(!session.send(ServerEnvelope::Output("4".into())));
        assert_eq!(session.dropped_messages(), 2);

        assert_eq!(rx.try_recv().unwrap(), ServerEnvelope::Output("1".into()));
        assert_eq!(rx.try_recv().unwrap(), ServerEnvelope::Output("2".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn close_happens_exactly_once() {
        let (session, mut rx) = session(SessionConfig::default());
        let closers: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.close())
            })
            .collect();
        let winners = closers
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|closed| *closed)
            .count();

        assert_eq!(winners, 1);
        assert!(session.is_closed());
        assert!(session.lifecycle().is_cancelled());
        assert!(!session.close());
        assert!(!session.send(ServerEnvelope::Output("late".into())));
        // Queue is closed once the sender is gone.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test_timeout::timeout]
    fn unknown_frames_warn_or_close() {
        let (warn_session, mut rx) = session(SessionConfig::default());
        assert_eq!(
            warn_session.handle_text(r#"{"type":"resize","cols":80}"#),
            FrameAction::Continue
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEnvelope::Error("unsupported message type: resize".into())
        );
        assert_eq!(warn_session.handle_text("not json"), FrameAction::Continue);
        assert!(rx.try_recv().unwrap().data().starts_with("malformed message"));

        let (close_session, mut rx) = session(SessionConfig {
            unknown_messages: UnknownMessagePolicy::Close,
            ..SessionConfig::default()
        });
        assert_eq!(close_session.handle_text(r#"{"type":"resize"}"#), FrameAction::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn busy_session_rejects_second_command() {
        let (session, mut rx) = session(SessionConfig::default());
        assert!(session.start_command(encode_command("echo first; sleep 30")));
        assert_eq!(rx.recv().await.unwrap(), ServerEnvelope::Output("first".into()));
        assert!(session.has_running_execution());
        assert_eq!(session.execution_state(), Some(ExecutionState::Running));

        assert!(!session.start_command(encode_command("echo second")));
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerEnvelope::Error(BUSY_NOTICE.to_string())
        );

        session.close();
        session.join_execution().await;
        assert!(!session.has_running_execution());
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn replacement_cancels_then_starts_the_newcomer() {
        let (session, mut rx) = session(SessionConfig {
            concurrency: ConcurrencyPolicy::ReplaceRunning,
            ..SessionConfig::default()
        });
        assert!(session.start_command(encode_command("echo first; sleep 30")));
        assert_eq!(rx.recv().await.unwrap(), ServerEnvelope::Output("first".into()));

        assert!(session.start_command(encode_command("echo second")));
        let old = next_terminal(&mut rx).await;
        match old.last() {
            Some(ServerEnvelope::Error(message)) => assert!(message.contains("cancelled")),
            other => panic!("expected the old command's error, got {other:?}"),
        }

        let new = next_terminal(&mut rx).await;
        assert_eq!(
            new,
            vec![
                ServerEnvelope::Output("second".into()),
                ServerEnvelope::Finished("command finished successfully on localhost".into()),
            ]
        );
        session.join_execution().await;
        assert!(!session.has_running_execution());
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn commands_after_completion_are_accepted() {
        let (session, mut rx) = session(SessionConfig::default());
        assert_eq!(session.execution_state(), None);
        assert!(session.start_command(encode_command("echo one")));
        let first = next_terminal(&mut rx).await;
        assert!(matches!(first.last(), Some(ServerEnvelope::Finished(_))));
        assert_eq!(session.execution_state(), Some(ExecutionState::Completed));

        // The terminal envelope is only queued once the slot reads idle.
        assert!(session.start_command(encode_command("echo two")));
        let second = next_terminal(&mut rx).await;
        assert_eq!(second[0], ServerEnvelope::Output("two".into()));
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn closing_cancels_the_running_execution() {
        let (session, _rx) = session(SessionConfig::default());
        assert!(session.start_command(encode_command("sleep 30")));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(session.close());
        tokio::time::timeout(Duration::from_secs(10), session.join_execution())
            .await
            .expect("execution should wind down after close");
        assert!(!session.start_command(encode_command("echo again")));
    }
}
