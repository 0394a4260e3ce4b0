//! Serialization and deserialization for the `FinChat` wire protocol.
//!
//! Frames are JSON text. Decoding is strict about the `kind` discriminant
//! and permissive about everything else: unknown fields are ignored, and
//! an unrecognized `kind` is reported as [`DecodeError::UnknownKind`] so
//! callers can drop the frame without treating it as corruption.

use crate::envelope::Envelope;
use crate::handshake::HandshakeFrame;

/// Envelope discriminants this protocol revision understands.
const KNOWN_KINDS: &[&str] = &["message", "typing", "system", "clear_history", "error"];

/// Error type for encoding an envelope into a frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Error type for decoding a frame into an envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not valid JSON, lacks a `kind` discriminant, or its
    /// fields do not match the declared kind.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The `kind` discriminant is well-formed but not one this protocol
    /// revision understands. Dropped, never fatal.
    #[error("unknown envelope kind: {0}")]
    UnknownKind(String),
}

/// Encodes an [`Envelope`] into a JSON text frame.
///
/// # Errors
///
/// Returns [`EncodeError::Serialization`] if the envelope cannot be
/// serialized.
pub fn encode(envelope: &Envelope) -> Result<String, EncodeError> {
    serde_json::to_string(envelope).map_err(|e| EncodeError::Serialization(e.to_string()))
}

/// Decodes a JSON text frame into an [`Envelope`].
///
/// # Errors
///
/// Returns [`DecodeError::MalformedFrame`] if the frame is not valid JSON,
/// has no string `kind` field, or fails structural validation for its
/// declared kind. Returns [`DecodeError::UnknownKind`] for a well-formed
/// frame whose `kind` is not recognized.
pub fn decode(frame: &str) -> Result<Envelope, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(frame).map_err(|e| DecodeError::MalformedFrame(e.to_string()))?;

    let Some(kind) = value.get("kind").and_then(serde_json::Value::as_str) else {
        return Err(DecodeError::MalformedFrame(
            "missing kind discriminant".into(),
        ));
    };
    if !KNOWN_KINDS.contains(&kind) {
        return Err(DecodeError::UnknownKind(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::MalformedFrame(e.to_string()))
}

/// Encodes a [`HandshakeFrame`] into a JSON text frame.
///
/// # Errors
///
/// Returns [`EncodeError::Serialization`] if the frame cannot be serialized.
pub fn encode_handshake(frame: &HandshakeFrame) -> Result<String, EncodeError> {
    serde_json::to_string(frame).map_err(|e| EncodeError::Serialization(e.to_string()))
}

/// Decodes a JSON text frame into a [`HandshakeFrame`].
///
/// # Errors
///
/// Returns [`DecodeError::MalformedFrame`] if the frame is not a valid
/// handshake frame.
pub fn decode_handshake(frame: &str) -> Result<HandshakeFrame, DecodeError> {
    serde_json::from_str(frame).map_err(|e| DecodeError::MalformedFrame(e.to_string()))
}
