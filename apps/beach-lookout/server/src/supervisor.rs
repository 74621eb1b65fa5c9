//! Runs one command from decode to terminal envelope.
//!
//! The supervisor is the only place that decides how an execution ends. It
//! races the transport's exit against cancellation and the hard ceiling, and
//! whichever trigger fires first, it joins every reader before the single
//! `finished`/`error` envelope goes out.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beach_lookout_core::{decode_command, CommandCodecError, ServerEnvelope};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::policy::{CommandPolicy, Denial, Verdict};
use crate::telemetry;
use crate::transport::{
    CommandHandle, ExitOutcome, OutputStream, ProcessControl, Target, Transport, TransportError,
    TransportProvider,
};

/// Longest single output line; longer lines are split.
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

/// How long readers may keep draining after the command is gone. Covers
/// background children that inherited the pipes.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Bound on the wait that follows a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub grace: Duration,
    pub hard_ceiling: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            hard_ceiling: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Base64 command exactly as it arrived on the wire.
    pub encoded: String,
    pub target: Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Pending,
    Validating,
    Running,
    Completed,
    Failed,
    GracefullyTerminated,
    ForciblyTerminated,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Validating => "validating",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::GracefullyTerminated => "gracefully_terminated",
            ExecutionState::ForciblyTerminated => "forcibly_terminated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::GracefullyTerminated
                | ExecutionState::ForciblyTerminated
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    Cancelled,
    HardCeiling,
}

impl fmt::Display for StopTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopTrigger::Cancelled => f.write_str("cancelled"),
            StopTrigger::HardCeiling => f.write_str("exceeded the execution time limit"),
        }
    }
}

/// Summary of an execution that reached `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub state: ExecutionState,
    pub exit: Option<ExitOutcome>,
    pub trigger: Option<StopTrigger>,
    pub pid: Option<u32>,
    pub lines_forwarded: u64,
}

/// Failures before the command ever ran. Each one is reported to the client
/// as a single `error` envelope.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Decode(#[from] CommandCodecError),
    #[error("{0}")]
    Policy(Denial),
    #[error("{0}")]
    TransportAcquire(TransportError),
    #[error("{0}")]
    Start(TransportError),
    #[error("cancelled before start")]
    Cancelled,
}

impl ExecutionError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ExecutionError::Decode(_) => "decode_error",
            ExecutionError::Policy(_) => "policy_denied",
            ExecutionError::TransportAcquire(_) => "transport_error",
            ExecutionError::Start(_) => "start_error",
            ExecutionError::Cancelled => "cancelled",
        }
    }
}

/// Where envelopes for one execution go. Delivery never blocks; a sink that
/// cannot keep up drops.
pub trait OutputSink: Send + Sync {
    fn deliver(&self, envelope: ServerEnvelope);

    /// Observes lifecycle transitions. The terminal state is reported just
    /// before the terminal envelope is delivered.
    fn transition(&self, _state: ExecutionState) {}
}

#[derive(Clone)]
pub struct ExecutionSupervisor {
    policy: Arc<CommandPolicy>,
    transports: Arc<dyn TransportProvider>,
    limits: ExecutionLimits,
}

impl ExecutionSupervisor {
    pub fn new(
        policy: Arc<CommandPolicy>,
        transports: Arc<dyn TransportProvider>,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            policy,
            transports,
            limits,
        }
    }

    pub fn policy(&self) -> &Arc<CommandPolicy> {
        &self.policy
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Executes `request` and sends exactly one terminal envelope to `sink`
    /// after every output line. `cancel` is the execution's own token.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        request: ExecutionRequest,
        sink: Arc<dyn OutputSink>,
    ) -> Result<ExecutionReport, ExecutionError> {
        let started = Instant::now();
        let (command, result) = match decode_command(&request.encoded) {
            Ok(command) => {
                let result = self
                    .execute(&cancel, &command, &request.target, &sink)
                    .await;
                (Some(command), result)
            }
            Err(err) => (None, Err(ExecutionError::Decode(err))),
        };

        let target = request.target.to_string();
        let shown = command.as_deref().map(flatten_newlines);
        let shown = shown.as_deref().unwrap_or("<undecodable>");

        match &result {
            Ok(report) => {
                counter!(telemetry::EXECUTIONS, 1, "outcome" => report.state.as_str());
                histogram!(
                    telemetry::EXECUTION_DURATION_MS,
                    started.elapsed().as_secs_f64() * 1000.0,
                    "outcome" => report.state.as_str()
                );
                info!(
                    command = %shown,
                    target = %target,
                    state = report.state.as_str(),
                    exit = ?report.exit,
                    lines = report.lines_forwarded,
                    "execution finished"
                );
                sink.transition(report.state);
                sink.deliver(terminal_envelope(shown, &target, report));
            }
            Err(err) => {
                counter!(telemetry::EXECUTIONS, 1, "outcome" => err.metric_label());
                if let ExecutionError::Policy(denial) = err {
                    counter!(
                        telemetry::COMMANDS_DENIED,
                        1,
                        "reason" => denial.metric_label()
                    );
                }
                warn!(command = %shown, target = %target, error = %err, "execution rejected");
                sink.transition(ExecutionState::Failed);
                sink.deliver(ServerEnvelope::Error(failure_message(
                    shown,
                    &target,
                    &err.to_string(),
                )));
            }
        }

        result
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        command: &str,
        target: &Target,
        sink: &Arc<dyn OutputSink>,
    ) -> Result<ExecutionReport, ExecutionError> {
        sink.transition(ExecutionState::Validating);
        if let Verdict::Deny(denial) = self.policy.evaluate(command) {
            return Err(ExecutionError::Policy(denial));
        }
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let mut transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            acquired = self.transports.acquire(target) => {
                acquired.map_err(ExecutionError::TransportAcquire)?
            }
        };
        debug!(target = %target, kind = transport.kind().as_str(), "transport acquired");

        let result = self.drive(transport.as_mut(), command, cancel, sink).await;
        transport.release().await;
        result
    }

    async fn drive(
        &self,
        transport: &mut dyn Transport,
        command: &str,
        cancel: &CancellationToken,
        sink: &Arc<dyn OutputSink>,
    ) -> Result<ExecutionReport, ExecutionError> {
        let CommandHandle {
            stdout,
            stderr,
            mut control,
        } = transport
            .start(command)
            .await
            .map_err(ExecutionError::Start)?;
        let pid = control.pid();
        let deadline = Instant::now() + self.limits.hard_ceiling;
        sink.transition(ExecutionState::Running);
        let forwarded = Arc::new(AtomicU64::new(0));
        let readers_token = cancel.child_token();
        let readers: Vec<JoinHandle<()>> = [("stdout", stdout), ("stderr", stderr)]
            .into_iter()
            .filter_map(|(name, stream)| stream.map(|stream| (name, stream)))
            .map(|(name, stream)| {
                tokio::spawn(forward_lines(
                    name,
                    stream,
                    Arc::clone(sink),
                    Arc::clone(&forwarded),
                    readers_token.clone(),
                ))
            })
            .collect();

        let raced = tokio::select! {
            exit = control.wait() => Ok(exit),
            _ = cancel.cancelled() => Err(StopTrigger::Cancelled),
            _ = sleep_until(deadline) => Err(StopTrigger::HardCeiling),
        };

        let (state, exit, trigger) = match raced {
            Ok(Ok(exit)) => {
                let state = if exit.success() {
                    ExecutionState::Completed
                } else {
                    ExecutionState::Failed
                };
                (state, Some(exit), None)
            }
            Ok(Err(err)) => {
                warn!(error = %err, "lost track of running command");
                (ExecutionState::Failed, None, None)
            }
            Err(trigger) => {
                info!(%trigger, ?pid, "stopping command");
                let (state, exit) = self.escalate(control.as_mut()).await;
                (state, exit, Some(trigger))
            }
        };

        // Background jobs may still hold the pipes; they go with the command.
        if let Err(err) = control.teardown().await {
            warn!(error = %err, ?pid, "failed to tear down command");
        }
        join_readers(readers, &readers_token).await;
        drop(control);

        Ok(ExecutionReport {
            state,
            exit,
            trigger,
            pid,
            lines_forwarded: forwarded.load(Ordering::Relaxed),
        })
    }

    /// Graceful signal, grace window, then forced kill.
    async fn escalate(
        &self,
        control: &mut dyn ProcessControl,
    ) -> (ExecutionState, Option<ExitOutcome>) {
        if let Err(err) = control.terminate().await {
            warn!(error = %err, "graceful termination failed");
        }
        match timeout(self.limits.grace, control.wait()).await {
            Ok(Ok(exit)) => return (ExecutionState::GracefullyTerminated, Some(exit)),
            Ok(Err(err)) => {
                warn!(error = %err, "wait failed during grace window");
            }
            Err(_) => debug!("grace window elapsed"),
        }

        if let Err(err) = control.kill().await {
            warn!(error = %err, "forced kill failed");
        }
        let exit = match timeout(KILL_WAIT, control.wait()).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(err)) => {
                warn!(error = %err, "wait failed after forced kill");
                None
            }
            Err(_) => {
                warn!("command still running after forced kill");
                None
            }
        };
        (ExecutionState::ForciblyTerminated, exit)
    }
}

async fn forward_lines(
    stream_name: &'static str,
    stream: OutputStream,
    sink: Arc<dyn OutputSink>,
    forwarded: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    // Tail of a split line that stopped inside a UTF-8 sequence.
    let mut carry = Vec::new();
    let mut after_split = false;
    loop {
        buf.clear();
        buf.append(&mut carry);
        let mut limited = (&mut reader).take(MAX_LINE_BYTES - buf.len() as u64);
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = limited.read_until(b'\n', &mut buf) => read,
        };
        let read = match read {
            Ok(read) => read,
            Err(err) => {
                warn!(stream = stream_name, error = %err, "output stream failed");
                break;
            }
        };
        if buf.is_empty() {
            break;
        }

        let terminated = buf.last() == Some(&b'\n');
        let split = !terminated && read > 0 && buf.len() as u64 >= MAX_LINE_BYTES;
        if split {
            let cut = char_boundary(&buf);
            carry.extend_from_slice(&buf[cut..]);
            buf.truncate(cut);
        } else if after_split && matches!(buf.as_slice(), b"\n" | b"\r\n") {
            // Terminator of a line that was already sent in pieces.
            after_split = false;
            continue;
        }
        after_split = split;

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        sink.deliver(ServerEnvelope::Output(line.to_string()));
        forwarded.fetch_add(1, Ordering::Relaxed);
        // Let the session's writer run between lines of a chatty command.
        tokio::task::yield_now().await;
    }
}

/// Largest prefix length of `buf` that does not end inside a UTF-8 sequence.
fn char_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(4) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

async fn join_readers(readers: Vec<JoinHandle<()>>, cancel: &CancellationToken) {
    let drain_until = Instant::now() + READER_DRAIN;
    for mut reader in readers {
        if timeout_at(drain_until, &mut reader).await.is_err() {
            cancel.cancel();
            let _ = reader.await;
        }
    }
}

fn terminal_envelope(command: &str, target: &str, report: &ExecutionReport) -> ServerEnvelope {
    match (report.state, &report.exit, report.trigger) {
        (ExecutionState::Completed, _, _) => {
            ServerEnvelope::Finished(format!("command finished successfully on {target}"))
        }
        (_, _, Some(trigger)) => {
            let reason = match report.state {
                ExecutionState::ForciblyTerminated => format!("{trigger}, killed"),
                _ => format!("{trigger}, terminated"),
            };
            ServerEnvelope::Error(failure_message(command, target, &reason))
        }
        (_, Some(exit), None) => {
            ServerEnvelope::Error(failure_message(command, target, &exit.to_string()))
        }
        (_, None, None) => {
            ServerEnvelope::Error(failure_message(command, target, "exit status unknown"))
        }
    }
}

fn failure_message(command: &str, target: &str, reason: &str) -> String {
    format!("Error executing command '{command}' on {target}: {reason}")
}

/// Log- and wire-safe rendering of command text.
pub fn flatten_newlines(command: &str) -> String {
    command.replace(['\r', '\n'], " ")
}
