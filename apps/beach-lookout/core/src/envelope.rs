use serde::{Deserialize, Serialize};

/// `type` value of the only actionable inbound envelope.
pub const COMMAND_ENVELOPE_TYPE: &str = "command";

/// Frame sent by the browser. Only `type == "command"` is actionable; any
/// other type is parsed successfully so the server can report what it saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    /// Base64 encoded shell command.
    #[serde(default)]
    pub command: String,
}

impl ClientEnvelope {
    pub fn command(encoded: &str) -> Self {
        Self {
            kind: COMMAND_ENVELOPE_TYPE.to_string(),
            command: encoded.to_string(),
        }
    }

    pub fn is_command(&self) -> bool {
        self.kind == COMMAND_ENVELOPE_TYPE
    }
}

/// Frame sent by the gateway.
///
/// Serialized as `{"type": "output" | "finished" | "error", "data": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// One line of command output, without its line terminator.
    Output(String),
    /// Terminal marker of a command that exited successfully.
    Finished(String),
    /// Terminal marker of a failed, denied or terminated command, or a
    /// rejection notice for a frame the session could not act on.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Output,
    Finished,
    Error,
}

impl ServerEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            ServerEnvelope::Output(_) => EnvelopeKind::Output,
            ServerEnvelope::Finished(_) => EnvelopeKind::Finished,
            ServerEnvelope::Error(_) => EnvelopeKind::Error,
        }
    }

    pub fn data(&self) -> &str {
        match self {
            ServerEnvelope::Output(data)
            | ServerEnvelope::Finished(data)
            | ServerEnvelope::Error(data) => data,
        }
    }

    /// `finished` and `error` close out an execution; `output` never does.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ServerEnvelope::Output(_))
    }
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Output => "output",
            EnvelopeKind::Finished => "finished",
            EnvelopeKind::Error => "error",
        }
    }
}
