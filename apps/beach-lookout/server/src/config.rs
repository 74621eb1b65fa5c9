use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use beach_lookout_core::{max_command_len, DEFAULT_MAX_FRAME_BYTES};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::inventory::Inventory;
use crate::policy::CommandPolicy;
use crate::session::{ConcurrencyPolicy, SessionConfig, UnknownMessagePolicy};
use crate::supervisor::ExecutionLimits;
use crate::transport::{HostKeyPolicy, SshOptions};

#[derive(Debug, Parser)]
#[command(
    name = "beach-lookout-server",
    author,
    version,
    about = "Remote diagnostics gateway: streams allow-listed shell commands over WebSocket"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one command to a running gateway and print its output.
    Send(SendArgs),
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// WebSocket endpoint of the gateway.
    #[arg(long, env = "BEACH_LOOKOUT_URL", default_value = "ws://127.0.0.1:8080/ws")]
    pub url: String,

    /// Inventory host to run on; omit for the gateway host.
    #[arg(long)]
    pub target: Option<String>,

    /// How long to wait for the command to finish.
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,

    /// Command line to run.
    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_LOOKOUT_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// JSON file with `allowed_cmds` and `blacklist_cmds`.
    #[arg(long, env = "BEACH_LOOKOUT_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Extra base commands to allow (repeatable or comma separated).
    #[arg(long, env = "BEACH_LOOKOUT_ALLOW", value_delimiter = ',')]
    pub allow: Vec<String>,

    /// Inventory of SSH targets.
    #[arg(long, env = "BEACH_LOOKOUT_INVENTORY")]
    pub inventory: Option<PathBuf>,

    /// Shell used for local commands.
    #[arg(long, env = "BEACH_LOOKOUT_SHELL", default_value = "/bin/sh")]
    pub shell: PathBuf,

    /// Largest inbound WebSocket frame in bytes.
    #[arg(long, env = "BEACH_LOOKOUT_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Outbound messages buffered per session before new ones are dropped.
    #[arg(long, env = "BEACH_LOOKOUT_QUEUE_DEPTH", default_value_t = 4096)]
    pub queue_depth: usize,

    #[arg(long, env = "BEACH_LOOKOUT_PING_INTERVAL_SECS", default_value_t = 9)]
    pub ping_interval_secs: u64,

    /// Session closes if no pong arrives within this window.
    #[arg(long, env = "BEACH_LOOKOUT_READ_DEADLINE_SECS", default_value_t = 60)]
    pub read_deadline_secs: u64,

    #[arg(long, env = "BEACH_LOOKOUT_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// Time between the polite stop signal and the forced kill.
    #[arg(long, env = "BEACH_LOOKOUT_GRACE_SECS", default_value_t = 5)]
    pub grace_secs: u64,

    /// Longest a single command may run.
    #[arg(long, env = "BEACH_LOOKOUT_HARD_CEILING_SECS", default_value_t = 600)]
    pub hard_ceiling_secs: u64,

    #[arg(
        long,
        env = "BEACH_LOOKOUT_CONCURRENCY_POLICY",
        value_enum,
        default_value_t = ConcurrencyArg::Reject
    )]
    pub concurrency_policy: ConcurrencyArg,

    #[arg(
        long,
        env = "BEACH_LOOKOUT_UNKNOWN_MESSAGE_POLICY",
        value_enum,
        default_value_t = UnknownMessageArg::Warn
    )]
    pub unknown_message_policy: UnknownMessageArg,

    #[arg(
        long,
        env = "BEACH_LOOKOUT_SSH_HOST_KEYS",
        value_enum,
        default_value_t = HostKeyArg::KnownHosts
    )]
    pub ssh_host_keys: HostKeyArg,

    /// Do not request a PTY for remote commands.
    #[arg(long, env = "BEACH_LOOKOUT_SSH_NO_PTY", default_value_t = false)]
    pub ssh_no_pty: bool,

    #[arg(long, env = "BEACH_LOOKOUT_SSH_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub ssh_connect_timeout_secs: u64,

    /// Mount the allow-list mutation routes.
    #[arg(long, env = "BEACH_LOOKOUT_ENABLE_ADMIN", default_value_t = false)]
    pub enable_admin: bool,

    /// How long shutdown waits for sessions to wind down.
    #[arg(long, env = "BEACH_LOOKOUT_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConcurrencyArg {
    Reject,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UnknownMessageArg {
    Warn,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HostKeyArg {
    KnownHosts,
    Insecure,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub policy_file: Option<PathBuf>,
    pub extra_allowed: Vec<String>,
    pub inventory: Option<PathBuf>,
    pub shell: PathBuf,
    pub session: SessionConfig,
    pub limits: ExecutionLimits,
    pub ssh: SshOptions,
    pub enable_admin: bool,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;

        if max_command_len(args.max_frame_bytes) == 0 {
            bail!(
                "max frame size of {} bytes cannot carry a command",
                args.max_frame_bytes
            );
        }
        if args.queue_depth == 0 {
            bail!("queue depth must be greater than zero");
        }
        if args.ping_interval_secs == 0 || args.ping_interval_secs >= args.read_deadline_secs {
            bail!(
                "ping interval ({}s) must be non-zero and shorter than the read deadline ({}s)",
                args.ping_interval_secs,
                args.read_deadline_secs
            );
        }
        if args.hard_ceiling_secs == 0 || args.write_timeout_secs == 0 {
            bail!("hard ceiling and write timeout must be greater than zero");
        }

        let session = SessionConfig {
            queue_depth: args.queue_depth,
            max_frame_bytes: args.max_frame_bytes,
            ping_interval: Duration::from_secs(args.ping_interval_secs),
            read_deadline: Duration::from_secs(args.read_deadline_secs),
            write_timeout: Duration::from_secs(args.write_timeout_secs),
            concurrency: match args.concurrency_policy {
                ConcurrencyArg::Reject => ConcurrencyPolicy::RejectWhileBusy,
                ConcurrencyArg::Replace => ConcurrencyPolicy::ReplaceRunning,
            },
            unknown_messages: match args.unknown_message_policy {
                UnknownMessageArg::Warn => UnknownMessagePolicy::Warn,
                UnknownMessageArg::Close => UnknownMessagePolicy::Close,
            },
        };

        Ok(ServerConfig {
            listen_addr,
            policy_file: args.policy_file,
            extra_allowed: args.allow,
            inventory: args.inventory,
            shell: args.shell,
            session,
            limits: ExecutionLimits {
                grace: Duration::from_secs(args.grace_secs),
                hard_ceiling: Duration::from_secs(args.hard_ceiling_secs),
            },
            ssh: SshOptions {
                host_keys: match args.ssh_host_keys {
                    HostKeyArg::KnownHosts => HostKeyPolicy::KnownHosts,
                    HostKeyArg::Insecure => HostKeyPolicy::Insecure,
                },
                request_pty: !args.ssh_no_pty,
                connect_timeout: Duration::from_secs(args.ssh_connect_timeout_secs),
            },
            enable_admin: args.enable_admin,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

impl ServerConfig {
    /// Built-in sets unless a policy file is configured, plus `--allow`.
    pub fn load_policy(&self) -> Result<CommandPolicy> {
        let policy = match &self.policy_file {
            Some(path) => CommandPolicy::from_file(path)?,
            None => CommandPolicy::default(),
        };
        for command in &self.extra_allowed {
            policy.allow(command);
        }
        Ok(policy)
    }

    pub fn load_inventory(&self) -> Result<Inventory> {
        match &self.inventory {
            Some(path) => Ok(Inventory::load(path)?),
            None => Ok(Inventory::default()),
        }
    }
}
