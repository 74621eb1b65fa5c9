//! Where a command actually runs.
//!
//! A [`Transport`] starts one command and hands back its two output streams
//! plus a [`ProcessControl`] for waiting and signalling. The supervisor only
//! ever talks to these traits, so the local and SSH implementations never
//! leak into session code.

pub mod local;
pub mod ssh;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::inventory::Inventory;

pub use local::LocalTransport;
pub use ssh::{HostKeyPolicy, SshOptions, SshTransport};

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Where an execution should run. An empty target identifier means local.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Local,
    Remote(String),
}

impl Target {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Target::Local,
            Some(host) => Target::Remote(host.to_string()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => f.write_str("localhost"),
            Target::Remote(host) => f.write_str(host),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    LocalProcess,
    RemoteShell,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::LocalProcess => "local",
            TransportKind::RemoteShell => "ssh",
        }
    }
}

/// How a command ended, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signalled(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (_, Some(signal)) => write!(f, "terminated by signal {signal}"),
            (Some(code), None) => write!(f, "exit status {code}"),
            (None, None) => f.write_str("exited without a status"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown target host: {0}")]
    UnknownTarget(String),
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("host key for {0} was rejected")]
    HostKeyRejected(String),
    #[error("authentication failed for {user}@{target}")]
    AuthenticationFailed { user: String, target: String },
    #[error("failed to load private key {path}: {reason}")]
    PrivateKey { path: String, reason: String },
    #[error("failed to open remote session: {0}")]
    SessionOpen(String),
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to signal command: {0}")]
    Signal(String),
    #[error("failed to wait for command: {0}")]
    Wait(String),
}

/// A started command.
pub struct CommandHandle {
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
    pub control: Box<dyn ProcessControl>,
}

#[async_trait]
pub trait ProcessControl: Send {
    /// Resolves once the command has exited. Cancel-safe: dropping the future
    /// and calling again keeps waiting for the same exit, and every call after
    /// the first resolution returns the same outcome.
    async fn wait(&mut self) -> Result<ExitOutcome, TransportError>;

    /// Polite stop request. A no-op once the command has exited.
    async fn terminate(&mut self) -> Result<(), TransportError>;

    /// Forced stop. A no-op once the command has exited.
    async fn kill(&mut self) -> Result<(), TransportError>;

    /// Stops anything the command left running behind it, such as
    /// background jobs. Called once the command itself has ended.
    async fn teardown(&mut self) -> Result<(), TransportError>;

    fn pid(&self) -> Option<u32>;
}

#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    async fn start(&mut self, command: &str) -> Result<CommandHandle, TransportError>;

    /// Releases whatever the transport holds open. Called exactly once.
    async fn release(self: Box<Self>);
}

#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn acquire(&self, target: &Target) -> Result<Box<dyn Transport>, TransportError>;
}

/// Local shell for [`Target::Local`], SSH through the inventory otherwise.
#[derive(Debug, Clone)]
pub struct HostTransports {
    shell: PathBuf,
    inventory: Arc<Inventory>,
    ssh: SshOptions,
}

impl HostTransports {
    pub fn new(shell: impl Into<PathBuf>, inventory: Arc<Inventory>, ssh: SshOptions) -> Self {
        Self {
            shell: shell.into(),
            inventory,
            ssh,
        }
    }

    pub fn local_only(shell: impl Into<PathBuf>) -> Self {
        Self::new(shell, Arc::new(Inventory::default()), SshOptions::default())
    }
}

#[async_trait]
impl TransportProvider for HostTransports {
    async fn acquire(&self, target: &Target) -> Result<Box<dyn Transport>, TransportError> {
        match target {
            Target::Local => Ok(Box::new(LocalTransport::new(self.shell.clone()))),
            Target::Remote(host) => {
                let entry = self
                    .inventory
                    .get(host)
                    .ok_or_else(|| TransportError::UnknownTarget(host.clone()))?;
                let transport = SshTransport::connect(entry, &self.ssh).await?;
                Ok(Box::new(transport))
            }
        }
    }
}
