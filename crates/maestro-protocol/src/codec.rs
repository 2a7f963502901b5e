// ABOUTME: Encoding and permissive decoding of newline-delimited protocol messages.
// ABOUTME: Unknown or missing `type` tags surface as ProtocolError, never as a panic.

use crate::{Command, Event};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Failure to turn a protocol line into a message (or a message into a line).
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The line was not valid JSON, or a known variant had ill-typed fields.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The object has no string `type` field.
    #[error("message has no type field")]
    MissingType,

    /// The `type` tag is not part of this direction's vocabulary.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Serialize a message as a single JSON object (no trailing newline).
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Serialize a message as one protocol line, terminated by `\n`.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = encode(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one frontend line into a [`Command`].
pub fn decode_command(line: &str) -> Result<Command, ProtocolError> {
    decode_tagged(line, Command::TYPES)
}

/// Decode one agent line into an [`Event`].
pub fn decode_event(line: &str) -> Result<Event, ProtocolError> {
    decode_tagged(line, Event::TYPES)
}

fn decode_tagged<T: DeserializeOwned>(line: &str, known: &[&str]) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_str(line.trim())?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    if !known.contains(&tag) {
        return Err(ProtocolError::UnknownType(tag.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}
