//! Session management: authentication state and credential lifecycle.
//!
//! The [`SessionManager`] owns the one optional [`SessionCredentials`]
//! record. It restores persisted credentials at startup, exchanges
//! username/password for a token at login, and clears everything at
//! logout. The connection supervisor only ever reads credential
//! snapshots — it never mutates them.
//!
//! The identity endpoints themselves (login, token confirmation) are
//! external collaborators behind the [`AuthBackend`] trait.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use store::CredentialStore;

/// An authenticated identity as confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// Stable backend identifier for the user.
    pub user_id: String,
}

/// The session's authentication material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// Bearer token presented in the connection handshake.
    pub token: String,
    /// The identity the token was issued to.
    pub user_id: String,
    /// Expiry, if the issuer communicated one.
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionCredentials {
    /// Whether the token is expired at the given instant. Tokens without
    /// an expiry never expire locally; the backend remains the authority.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// Result of [`SessionManager::restore`]. Never an error: startup always
/// resolves into one of these two signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSignal {
    /// Persisted credentials were confirmed by the backend.
    Authenticated(UserIdentity),
    /// No usable credentials; the user must sign in.
    Unauthenticated {
        /// Human-readable reason, when there is something to say.
        reason: Option<String>,
    },
}

/// Taxonomized login failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    /// The backend rejected the username/password pair.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The backend could not be reached.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    /// The backend failed internally.
    #[error("server error: {0}")]
    ServerError(String),
}

/// Failure of a token confirmation call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// The token is invalid or expired; the stored record must go.
    #[error("token rejected: {0}")]
    Rejected(String),
    /// The backend could not be reached; the token's standing is unknown.
    #[error("network unavailable: {0}")]
    Network(String),
}

/// Successful login response from the identity backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    /// The issued session token.
    pub token: String,
    /// The identity the token was issued to.
    pub user_id: String,
    /// Expiry, if the issuer communicated one.
    pub expires_at: Option<DateTime<Utc>>,
}

/// The external identity service: a login endpoint that exchanges
/// credentials for a token, and a confirmation endpoint that exchanges a
/// token for the user profile or rejects it.
pub trait AuthBackend: Send + Sync {
    /// Exchange username/password for a session token.
    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> impl std::future::Future<Output = Result<LoginResponse, LoginError>> + Send;

    /// Confirm a token and return the identity it belongs to.
    fn verify(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<UserIdentity, VerifyError>> + Send;
}

/// Owns authentication state for one session.
pub struct SessionManager<B: AuthBackend, S: CredentialStore> {
    backend: B,
    store: S,
    credentials: parking_lot::Mutex<Option<SessionCredentials>>,
    /// Serializes concurrent `login` calls: a second caller waits for the
    /// first to resolve instead of issuing a duplicate request.
    login_serial: tokio::sync::Mutex<()>,
}

impl<B: AuthBackend, S: CredentialStore> SessionManager<B, S> {
    /// Creates a manager with no credentials in memory.
    pub fn new(backend: B, store: S) -> Self {
        Self {
            backend,
            store,
            credentials: parking_lot::Mutex::new(None),
            login_serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Restore a persisted session, confirming the token with the backend.
    ///
    /// Resolution rules:
    /// - no stored record → `Unauthenticated`
    /// - locally expired token → cleared, `Unauthenticated`, no backend call
    /// - backend confirms → `Authenticated`
    /// - backend rejects → stored record cleared, `Unauthenticated`
    /// - backend unreachable → `Unauthenticated`, stored record kept so a
    ///   later startup can try again
    pub async fn restore(&self) -> AuthSignal {
        let stored = match self.store.load() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(err = %e, "failed to read stored credentials");
                return AuthSignal::Unauthenticated {
                    reason: Some(format!("credential storage unreadable: {e}")),
                };
            }
        };
        let Some(credentials) = stored else {
            return AuthSignal::Unauthenticated { reason: None };
        };

        if credentials.is_expired(Utc::now()) {
            tracing::info!(user_id = %credentials.user_id, "stored token expired");
            self.clear_store();
            return AuthSignal::Unauthenticated {
                reason: Some("session expired, please sign in again".into()),
            };
        }

        match self.backend.verify(&credentials.token).await {
            Ok(identity) => {
                tracing::info!(user_id = %identity.user_id, "session restored");
                *self.credentials.lock() = Some(credentials);
                AuthSignal::Authenticated(identity)
            }
            Err(VerifyError::Rejected(reason)) => {
                tracing::info!(reason = %reason, "stored token rejected");
                self.clear_store();
                AuthSignal::Unauthenticated {
                    reason: Some(reason),
                }
            }
            Err(VerifyError::Network(reason)) => {
                tracing::warn!(reason = %reason, "could not confirm stored token");
                AuthSignal::Unauthenticated {
                    reason: Some(reason),
                }
            }
        }
    }

    /// Exchange username/password for a session, storing the credentials
    /// in memory and durable storage on success.
    ///
    /// Concurrent calls are serialized; a caller that finds credentials
    /// already present when its turn comes returns them without a second
    /// request.
    ///
    /// # Errors
    ///
    /// Returns [`LoginError`] without storing any partial state.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserIdentity, LoginError> {
        let _turn = self.login_serial.lock().await;

        if let Some(existing) = self.credentials.lock().clone() {
            return Ok(UserIdentity {
                user_id: existing.user_id,
            });
        }

        let response = self.backend.login(username, password).await?;
        let credentials = SessionCredentials {
            token: response.token,
            user_id: response.user_id.clone(),
            expires_at: response.expires_at,
        };
        self.adopt(credentials);
        tracing::info!(user_id = %response.user_id, "logged in");
        Ok(UserIdentity {
            user_id: response.user_id,
        })
    }

    /// Clear credentials from memory and durable storage. Synchronous and
    /// idempotent: calling twice is a no-op the second time.
    pub fn logout(&self) {
        let had = self.credentials.lock().take().is_some();
        self.clear_store();
        if had {
            tracing::info!("logged out");
        }
    }

    /// Adopt externally-issued credentials (memory + durable storage).
    /// Token issuance is outside this crate; possession is not.
    pub fn adopt(&self, credentials: SessionCredentials) {
        if let Err(e) = self.store.save(&credentials) {
            // A failed durable write must not fail the session itself.
            tracing::warn!(err = %e, "failed to persist credentials");
        }
        *self.credentials.lock() = Some(credentials);
    }

    /// Handle a server-reported authentication failure (handshake
    /// rejection): credentials are cleared exactly as on logout.
    pub fn invalidate(&self) {
        self.logout();
    }

    /// A snapshot of the current credentials, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<SessionCredentials> {
        self.credentials.lock().clone()
    }

    /// Whether credentials are present in memory.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.credentials.lock().is_some()
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            tracing::warn!(err = %e, "failed to clear stored credentials");
        }
    }
}

impl<B: AuthBackend, S: CredentialStore> SessionManager<B, S> {
    /// Read-only access to the credential store (for diagnostics).
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Read-only access to the identity backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
