//! Shared primitives for the beach-lookout remote diagnostics gateway.
//!
//! The server, the debug client and the integration tests all speak the same
//! two JSON envelopes over a WebSocket text frame; keeping them here means the
//! message shapes are never copied across crates.

pub mod codec;
pub mod envelope;

pub use codec::{decode_bytes, decode_command, encode_bytes, encode_command, CommandCodecError};
pub use envelope::{ClientEnvelope, EnvelopeKind, ServerEnvelope, COMMAND_ENVELOPE_TYPE};

/// Largest inbound frame the gateway accepts by default.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 512;

/// Fixed JSON framing around the base64 payload of a command envelope:
/// `{"type":"command","command":""}`.
const COMMAND_ENVELOPE_OVERHEAD: usize = 31;

/// Longest raw command (in bytes, before base64) that fits in a single
/// command envelope of `max_frame_bytes`.
///
/// With the default 512 byte frame this is 360 bytes.
pub fn max_command_len(max_frame_bytes: usize) -> usize {
    let payload = max_frame_bytes.saturating_sub(COMMAND_ENVELOPE_OVERHEAD);
    // base64 emits 4 output characters for every 3 input bytes.
    (payload / 4) * 3
}
