//! Wire format envelope types for the `FinChat` protocol.
//!
//! All types in this module represent the on-the-wire JSON format for
//! envelopes exchanged between a `FinChat` client and the chat backend.
//! Every frame is one envelope; the `kind` field is the discriminant and
//! unknown fields are ignored for forward compatibility.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message text size in bytes (64 KB).
pub const MAX_TEXT_SIZE: usize = 64 * 1024;

/// Client-generated correlation id for user-authored messages, based on
/// UUID v7 for time-ordering.
///
/// The id is attached to every outbound `message` envelope and echoed back
/// by the server acknowledgment, which is how an optimistic local entry is
/// matched with its eventual delivery outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginId(Uuid);

impl OriginId {
    /// Creates a new time-ordered origin identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an `OriginId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OriginId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OriginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of a `message` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Client correlation id. Present only on user-authored messages and
    /// their server acknowledgments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<OriginId>,
    /// The message text.
    pub text: String,
    /// Whether the message was authored by the user (as opposed to the
    /// assistant responder).
    #[serde(default)]
    pub sender_is_user: bool,
    /// ISO-8601 timestamp, present only on server-authored envelopes.
    /// Opaque to the client: conversation ordering is arrival order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<String>,
}

/// Payload of a `typing` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    /// Whether the remote party is currently composing.
    pub is_typing: bool,
}

/// Payload of a `system` envelope (server-authored notices).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPayload {
    /// The notice text.
    pub text: String,
    /// ISO-8601 timestamp of the notice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<String>,
}

/// Payload of an `error` envelope.
///
/// An error carrying an `origin_id` reports the failure of that specific
/// user message; an error without one is a responder-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// The user message this error refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<OriginId>,
    /// Human-readable failure description.
    pub text: String,
    /// ISO-8601 timestamp of the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<String>,
}

/// Error returned when a message payload fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message text is empty.
    #[error("message text is empty")]
    Empty,
    /// Message text exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

impl MessagePayload {
    /// Builds a user-authored message payload with a fresh [`OriginId`].
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            origin_id: Some(OriginId::new()),
            text: text.into(),
            sender_is_user: true,
            server_timestamp: None,
        }
    }

    /// Validates this payload for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if the text is empty, or
    /// [`ValidationError::TooLarge`] if it exceeds [`MAX_TEXT_SIZE`].
    pub const fn validate(&self) -> Result<(), ValidationError> {
        if self.text.is_empty() {
            return Err(ValidationError::Empty);
        }
        let size = self.text.len();
        if size > MAX_TEXT_SIZE {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_TEXT_SIZE,
            });
        }
        Ok(())
    }
}

/// Top-level envelope wrapping all chat-level protocol traffic.
///
/// The `kind` field is strict: frames with an unrecognized discriminant are
/// dropped before reaching the session model. All other fields are
/// permissive — unknown fields are ignored, not rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// A chat message (user-authored or responder-authored).
    Message(MessagePayload),
    /// A transient typing indicator.
    Typing(TypingPayload),
    /// A server-authored notice.
    System(SystemPayload),
    /// An instruction to clear the conversation transcript.
    ClearHistory,
    /// A failure report from the backend or responder.
    Error(ErrorPayload),
}
