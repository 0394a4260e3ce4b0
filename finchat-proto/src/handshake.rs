//! Authentication handshake frames.
//!
//! On transport open the client sends an `auth` frame carrying its session
//! token; the server must answer with `auth_ok` before any chat envelope is
//! accepted, or `auth_rejected` to refuse the session.

use serde::{Deserialize, Serialize};

/// Frames exchanged during connection authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HandshakeFrame {
    /// Client → server: authenticate this connection.
    Auth {
        /// The session token obtained at login.
        token: String,
    },
    /// Server → client: connection authenticated.
    AuthOk {
        /// The identity the token resolved to.
        user_id: String,
    },
    /// Server → client: token invalid or expired. The connection will not
    /// accept chat envelopes and should not be retried with the same token.
    AuthRejected {
        /// Human-readable rejection reason.
        reason: String,
    },
}
