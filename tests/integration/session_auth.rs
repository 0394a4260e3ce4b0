// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for the authentication lifecycle end to end:
//! restore → connect, login serialization under concurrency, and the
//! boundary between the session manager and the connection supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use finchat::config::{ChatConfig, ClientConfig, ReconnectConfig};
use finchat::connection::{BackoffPolicy, ConnectionPhase};
use finchat::net::{self, SessionCommand, SessionEvent};
use finchat::session::store::{CredentialStore, MemoryStore};
use finchat::session::{
    AuthBackend, AuthSignal, LoginError, LoginResponse, SessionCredentials, SessionManager,
    UserIdentity, VerifyError,
};
use finchat_testserver::{ServerOptions, start};

// =============================================================================
// Helpers
// =============================================================================

/// Backend that issues one fixed token and counts its calls, with an
/// artificial delay so concurrent callers genuinely overlap.
struct CountingAuth {
    login_calls: AtomicU32,
}

impl CountingAuth {
    const fn new() -> Self {
        Self {
            login_calls: AtomicU32::new(0),
        }
    }
}

impl AuthBackend for CountingAuth {
    async fn login(&self, _username: &str, _password: &str) -> Result<LoginResponse, LoginError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(LoginResponse {
            token: "issued-token".into(),
            user_id: "user-1".into(),
            expires_at: None,
        })
    }

    async fn verify(&self, token: &str) -> Result<UserIdentity, VerifyError> {
        if token == "issued-token" {
            Ok(UserIdentity {
                user_id: "user-1".into(),
            })
        } else {
            Err(VerifyError::Rejected("unknown token".into()))
        }
    }
}

fn test_config(url: String) -> ClientConfig {
    ClientConfig {
        server_url: Some(url),
        connect_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(2),
        reconnect: ReconnectConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
            },
            heartbeat_interval: Duration::from_secs(30),
        },
        chat: ChatConfig {
            pending_send_cap: 50,
            typing_timeout: Duration::from_millis(300),
        },
        ..ClientConfig::default()
    }
}

async fn wait_for_phase(
    rx: &mut mpsc::Receiver<SessionEvent>,
    phase: ConnectionPhase,
) -> SessionEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(SessionEvent::StateChanged(state))) if state.phase == phase => {
                return SessionEvent::StateChanged(state);
            }
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("channel closed while waiting for {phase}"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {phase}");
}

// =============================================================================
// Tests
// =============================================================================

/// The full happy path: login issues a token, the supervisor connects with
/// it, and the stub backend accepts the handshake.
#[tokio::test]
async fn login_then_connect_end_to_end() {
    let server = start(ServerOptions {
        required_token: Some("issued-token".into()),
        ..ServerOptions::default()
    })
    .await
    .expect("server start");

    let session = Arc::new(SessionManager::new(CountingAuth::new(), MemoryStore::new()));
    let identity = session.login("alice", "hunter2").await.expect("login");
    assert_eq!(identity.user_id, "user-1");

    let mut handle = net::spawn_session(test_config(server.url()), Arc::clone(&session));
    handle.commands.send(SessionCommand::Connect).await.unwrap();
    wait_for_phase(&mut handle.events, ConnectionPhase::Connected).await;
    assert_eq!(server.handshake_count(), 1);
}

/// Restore confirms a persisted token and the session can connect with it;
/// a second process-start with a rejected token lands unauthenticated with
/// the store wiped.
#[tokio::test]
async fn restore_round_trip_and_rejection() {
    // First run: persisted token is the one the backend recognizes.
    let store = MemoryStore::with_credentials(SessionCredentials {
        token: "issued-token".into(),
        user_id: "user-1".into(),
        expires_at: None,
    });
    let session = SessionManager::new(CountingAuth::new(), store);
    match session.restore().await {
        AuthSignal::Authenticated(identity) => assert_eq!(identity.user_id, "user-1"),
        AuthSignal::Unauthenticated { reason } => panic!("expected restore to succeed: {reason:?}"),
    }

    // Second run: a stale token gets rejected and wiped.
    let store = MemoryStore::with_credentials(SessionCredentials {
        token: "stale-token".into(),
        user_id: "user-1".into(),
        expires_at: None,
    });
    let session = SessionManager::new(CountingAuth::new(), store);
    match session.restore().await {
        AuthSignal::Unauthenticated { reason } => assert!(reason.is_some()),
        AuthSignal::Authenticated(_) => panic!("stale token must not restore"),
    }
    assert!(session.store().load().unwrap().is_none());
    assert!(!session.is_authenticated());
}

/// Concurrent logins overlap on the wire at most once: the second caller
/// waits for the first and reuses its credentials.
#[tokio::test]
async fn concurrent_logins_are_serialized() {
    let session = Arc::new(SessionManager::new(CountingAuth::new(), MemoryStore::new()));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let session = Arc::clone(&session);
        tasks.spawn(async move { session.login("alice", "pw").await });
    }
    while let Some(result) = tasks.join_next().await {
        let identity = result.expect("task").expect("login");
        assert_eq!(identity.user_id, "user-1");
    }

    // One backend request total, despite four callers.
    assert_eq!(session.backend().login_calls.load(Ordering::SeqCst), 1);
}

/// Logout mid-session: the supervisor disconnects without retry, and a
/// fresh login afterwards can connect again through the same supervisor.
#[tokio::test]
async fn logout_then_relogin_reconnects() {
    let server = start(ServerOptions {
        required_token: Some("issued-token".into()),
        ..ServerOptions::default()
    })
    .await
    .expect("server start");

    let session = Arc::new(SessionManager::new(CountingAuth::new(), MemoryStore::new()));
    session.login("alice", "pw").await.expect("login");

    let mut handle = net::spawn_session(test_config(server.url()), Arc::clone(&session));
    handle.commands.send(SessionCommand::Connect).await.unwrap();
    wait_for_phase(&mut handle.events, ConnectionPhase::Connected).await;

    handle.commands.send(SessionCommand::Logout).await.unwrap();
    wait_for_phase(&mut handle.events, ConnectionPhase::Disconnected).await;
    assert!(!session.is_authenticated());

    // Sign back in and reconnect through the same session supervisor.
    session.login("alice", "pw").await.expect("re-login");
    handle.commands.send(SessionCommand::Connect).await.unwrap();
    wait_for_phase(&mut handle.events, ConnectionPhase::Connected).await;
    assert_eq!(server.handshake_count(), 2);
}
