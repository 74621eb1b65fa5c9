use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::{self, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect, Pty, Sig};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    CommandHandle, ExitOutcome, OutputStream, ProcessControl, Transport, TransportError,
    TransportKind,
};
use crate::inventory::{Credential, HostEntry};

/// Buffer between the channel pump and the line readers, per stream.
const PIPE_CAPACITY: usize = 64 * 1024;

const PTY_TERM: &str = "xterm";
const PTY_COLUMNS: u32 = 80;
const PTY_ROWS: u32 = 40;
const PTY_BAUD: u32 = 14_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept only keys already recorded in `~/.ssh/known_hosts`.
    #[default]
    KnownHosts,
    /// Accept any host key. Development only.
    Insecure,
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host_keys: HostKeyPolicy,
    pub request_pty: bool,
    pub connect_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            host_keys: HostKeyPolicy::KnownHosts,
            request_pty: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct HostKeyCheck {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::Insecure => {
                warn!(host = %self.host, "accepting ssh host key without verification");
                Ok(true)
            }
            HostKeyPolicy::KnownHosts => match keys::check_known_hosts(&self.host, self.port, key)
            {
                Ok(true) => Ok(true),
                Ok(false) => {
                    warn!(host = %self.host, port = self.port, "ssh host key not in known_hosts");
                    Ok(false)
                }
                Err(err) => {
                    warn!(host = %self.host, port = self.port, error = %err, "ssh host key check failed");
                    Ok(false)
                }
            },
        }
    }
}

/// An authenticated SSH connection to one inventory host. Each started
/// command gets its own session channel.
pub struct SshTransport {
    handle: Handle<HostKeyCheck>,
    target: String,
    request_pty: bool,
}

impl SshTransport {
    pub async fn connect(entry: &HostEntry, options: &SshOptions) -> Result<Self, TransportError> {
        let limit = entry.connect_timeout.unwrap_or(options.connect_timeout);
        match tokio::time::timeout(limit, Self::dial(entry, options)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout(entry.host.clone())),
        }
    }

    async fn dial(entry: &HostEntry, options: &SshOptions) -> Result<Self, TransportError> {
        let target = format!("{}:{}", entry.host, entry.port);
        let config = Arc::new(client::Config::default());
        let handler = HostKeyCheck {
            host: entry.host.clone(),
            port: entry.port,
            policy: options.host_keys,
        };

        let mut handle = client::connect(config, (entry.host.as_str(), entry.port), handler)
            .await
            .map_err(|err| match err {
                russh::Error::UnknownKey => TransportError::HostKeyRejected(target.clone()),
                other => TransportError::Connect {
                    target: target.clone(),
                    reason: other.to_string(),
                },
            })?;

        let auth = match &entry.credential {
            Credential::Password(password) => handle
                .authenticate_password(entry.user.as_str(), password.as_str())
                .await
                .map_err(|err| TransportError::Connect {
                    target: target.clone(),
                    reason: err.to_string(),
                })?,
            Credential::PrivateKey(path) => {
                let key = keys::load_secret_key(path, None).map_err(|err| {
                    TransportError::PrivateKey {
                        path: path.display().to_string(),
                        reason: err.to_string(),
                    }
                })?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|err| TransportError::Connect {
                        target: target.clone(),
                        reason: err.to_string(),
                    })?
                    .flatten();
                handle
                    .authenticate_publickey(
                        entry.user.as_str(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
                    .map_err(|err| TransportError::Connect {
                        target: target.clone(),
                        reason: err.to_string(),
                    })?
            }
        };

        if !auth.success() {
            return Err(TransportError::AuthenticationFailed {
                user: entry.user.clone(),
                target,
            });
        }

        info!(target = %target, user = %entry.user, "ssh connection established");
        Ok(Self {
            handle,
            target,
            request_pty: options.request_pty,
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RemoteShell
    }

    async fn start(&mut self, command: &str) -> Result<CommandHandle, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| TransportError::SessionOpen(err.to_string()))?;

        if self.request_pty {
            channel
                .request_pty(
                    false,
                    PTY_TERM,
                    PTY_COLUMNS,
                    PTY_ROWS,
                    0,
                    0,
                    &[
                        (Pty::ECHO, 0),
                        (Pty::TTY_OP_ISPEED, PTY_BAUD),
                        (Pty::TTY_OP_OSPEED, PTY_BAUD),
                    ],
                )
                .await
                .map_err(|err| TransportError::SessionOpen(format!("pty request: {err}")))?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(|err| TransportError::SessionOpen(format!("exec: {err}")))?;
        debug!(target = %self.target, pty = self.request_pty, "remote command started");

        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(pump_channel(
            channel,
            stdout_writer,
            stderr_writer,
            control_rx,
            exit_tx,
        ));

        Ok(CommandHandle {
            stdout: Some(Box::new(stdout_reader) as OutputStream),
            stderr: Some(Box::new(stderr_reader) as OutputStream),
            control: Box::new(RemoteControl {
                control: control_tx,
                exit_rx,
                exit: None,
            }),
        })
    }

    async fn release(self: Box<Self>) {
        if let Err(err) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(target = %self.target, error = %err, "ssh disconnect failed");
        }
    }
}

#[derive(Debug)]
enum ChannelControl {
    Signal(Sig),
    Close,
}

/// Owns the channel for the life of the command: copies data into the
/// stream pipes, applies signal requests, and reports the exit once the
/// channel closes.
async fn pump_channel(
    mut channel: Channel<Msg>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    mut control: mpsc::Receiver<ChannelControl>,
    exit: oneshot::Sender<ExitOutcome>,
) {
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut outcome = ExitOutcome::default();
    let mut control_open = true;

    loop {
        tokio::select! {
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => forward(&mut stdout, &data).await,
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => forward(&mut stderr, &data).await,
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    outcome.code = Some(exit_status as i32);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    outcome.signal = Some(sig_name(&signal_name));
                }
                Some(ChannelMsg::Eof) => {
                    stdout = None;
                    stderr = None;
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            request = control.recv(), if control_open => match request {
                Some(ChannelControl::Signal(sig)) => {
                    if let Err(err) = channel.signal(sig).await {
                        debug!(error = %err, "failed to deliver remote signal");
                    }
                }
                Some(ChannelControl::Close) => {
                    let _ = channel.close().await;
                }
                None => {
                    // Controller dropped without waiting: abandon the command.
                    control_open = false;
                    let _ = channel.close().await;
                }
            },
        }
    }

    drop(stdout);
    drop(stderr);
    let _ = exit.send(outcome);
}

async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8]) {
    if let Some(writer) = pipe {
        if writer.write_all(data).await.is_err() {
            *pipe = None;
        }
    }
}

fn sig_name(sig: &Sig) -> String {
    match sig {
        Sig::Custom(name) => name.clone(),
        other => format!("{other:?}"),
    }
}

struct RemoteControl {
    control: mpsc::Sender<ChannelControl>,
    exit_rx: oneshot::Receiver<ExitOutcome>,
    exit: Option<ExitOutcome>,
}

impl RemoteControl {
    async fn request(&self, request: ChannelControl) {
        // A closed pump means the channel is already gone.
        let _ = self.control.send(request).await;
    }
}

#[async_trait]
impl ProcessControl for RemoteControl {
    async fn wait(&mut self) -> Result<ExitOutcome, TransportError> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        match (&mut self.exit_rx).await {
            Ok(outcome) => {
                self.exit = Some(outcome.clone());
                Ok(outcome)
            }
            Err(_) => {
                self.exit = Some(ExitOutcome::default());
                Err(TransportError::Wait("remote channel pump stopped".into()))
            }
        }
    }

    async fn terminate(&mut self) -> Result<(), TransportError> {
        if self.exit.is_none() {
            self.request(ChannelControl::Signal(Sig::TERM)).await;
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), TransportError> {
        if self.exit.is_none() {
            self.request(ChannelControl::Signal(Sig::KILL)).await;
            self.request(ChannelControl::Close).await;
        }
        Ok(())
    }

    /// Closing the channel ends the remote session and whatever it still
    /// runs.
    async fn teardown(&mut self) -> Result<(), TransportError> {
        self.request(ChannelControl::Close).await;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}
