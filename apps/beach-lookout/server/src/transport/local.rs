use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{
    CommandHandle, ExitOutcome, OutputStream, ProcessControl, Transport, TransportError,
    TransportKind,
};

/// Runs commands as `<shell> -c <command>` on the gateway host, each in its
/// own process group so signals reach everything the shell spawned.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    shell: PathBuf,
}

impl LocalTransport {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalProcess
    }

    async fn start(&mut self, command: &str) -> Result<CommandHandle, TransportError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(TransportError::Spawn)?;
        let pid = child.id();
        debug!(?pid, shell = %self.shell.display(), "spawned local command");

        let stdout = child
            .stdout
            .take()
            .map(|stream| Box::new(stream) as OutputStream);
        let stderr = child
            .stderr
            .take()
            .map(|stream| Box::new(stream) as OutputStream);

        Ok(CommandHandle {
            stdout,
            stderr,
            control: Box::new(LocalControl {
                child,
                pid,
                exit: None,
                torn_down: false,
            }),
        })
    }

    async fn release(self: Box<Self>) {}
}

struct LocalControl {
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitOutcome>,
    torn_down: bool,
}

impl LocalControl {
    /// True once the leader has been reaped; its pid may belong to someone
    /// else from then on.
    fn reaped(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(outcome_from_status(status));
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "failed to poll local command");
                false
            }
        }
    }
}

#[async_trait]
impl ProcessControl for LocalControl {
    async fn wait(&mut self) -> Result<ExitOutcome, TransportError> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| TransportError::Wait(err.to_string()))?;
        let outcome = outcome_from_status(status);
        self.exit = Some(outcome.clone());
        Ok(outcome)
    }

    async fn terminate(&mut self) -> Result<(), TransportError> {
        if self.reaped() {
            return Ok(());
        }
        match self.pid {
            Some(pid) => signal_group(pid, GroupSignal::Terminate),
            None => Ok(()),
        }
    }

    async fn kill(&mut self) -> Result<(), TransportError> {
        if self.reaped() {
            return Ok(());
        }
        let group = match self.pid {
            Some(pid) => signal_group(pid, GroupSignal::Kill),
            None => Ok(()),
        };
        match self.child.start_kill() {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
            Err(err) => return Err(TransportError::Signal(err.to_string())),
        }
        group
    }

    /// The group id stays reserved while any member lives, so the group can
    /// still be signalled after the leader has been reaped.
    async fn teardown(&mut self) -> Result<(), TransportError> {
        self.torn_down = true;
        match self.pid {
            Some(pid) => signal_group(pid, GroupSignal::Kill),
            None => Ok(()),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for LocalControl {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        // kill_on_drop only reaches the shell; take the rest of the group too.
        if let Some(pid) = self.pid {
            if let Err(err) = signal_group(pid, GroupSignal::Kill) {
                warn!(pid, error = %err, "failed to kill abandoned process group");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> Result<(), TransportError> {
    let signo = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };
    let pgid = pid as libc::pid_t;
    // SAFETY: kill(2) with a negative pid signals the process group and
    // touches no memory owned by this process.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(TransportError::Signal(format!(
        "{signal:?} process group {pid}: {err}"
    )))
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) -> Result<(), TransportError> {
    Ok(())
}

fn outcome_from_status(status: ExitStatus) -> ExitOutcome {
    if let Some(code) = status.code() {
        return ExitOutcome::code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signo) = status.signal() {
            return ExitOutcome::signalled(signal_name(signo));
        }
    }
    ExitOutcome::default()
}

#[cfg(unix)]
fn signal_name(signo: i32) -> String {
    match signo {
        libc::SIGTERM => "TERM".to_string(),
        libc::SIGKILL => "KILL".to_string(),
        libc::SIGINT => "INT".to_string(),
        libc::SIGHUP => "HUP".to_string(),
        libc::SIGPIPE => "PIPE".to_string(),
        other => other.to_string(),
    }
}
