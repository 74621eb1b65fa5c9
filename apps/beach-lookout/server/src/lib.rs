//! Remote diagnostics gateway.
//!
//! A WebSocket client sends a base64 command, the [`policy`] gate vets it,
//! the [`supervisor`] runs it through a [`transport`] and each output line
//! flows back as an `output` envelope until exactly one `finished` or `error`.

pub mod config;
pub mod inventory;
pub mod policy;
pub mod registry;
pub mod routes;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

pub use config::{Cli, Command, SendArgs, ServeArgs, ServerConfig};
pub use policy::{CommandPolicy, Denial, Verdict};
pub use registry::{SessionRegistry, SessionSnapshot};
pub use routes::{router, AppState};
pub use session::{ConcurrencyPolicy, Session, SessionConfig, UnknownMessagePolicy};
pub use supervisor::{ExecutionLimits, ExecutionReport, ExecutionState, ExecutionSupervisor};
pub use transport::{HostTransports, Target};
