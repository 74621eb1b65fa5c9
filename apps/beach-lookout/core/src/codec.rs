use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandCodecError {
    #[error("invalid base64 command: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("command is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

pub fn encode_bytes(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, CommandCodecError> {
    Ok(STANDARD.decode(encoded.trim())?)
}

pub fn encode_command(command: &str) -> String {
    encode_bytes(command.as_bytes())
}

/// Decodes the `command` field of a command envelope into shell text.
pub fn decode_command(encoded: &str) -> Result<String, CommandCodecError> {
    let raw = decode_bytes(encoded)?;
    Ok(String::from_utf8(raw)?)
}
