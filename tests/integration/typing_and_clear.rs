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

//! Integration tests for the ephemeral typing indicator and history clear.
//!
//! Validates that the typing flag auto-clears when the "stopped typing"
//! signal is lost, that a message implicitly ends the composing state, and
//! that clearing the transcript touches neither the connection nor the
//! credentials.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use finchat::config::{ChatConfig, ClientConfig, ReconnectConfig};
use finchat::connection::{BackoffPolicy, ConnectionPhase};
use finchat::conversation::DeliveryState;
use finchat::net::{self, SessionCommand, SessionEvent};
use finchat::session::store::MemoryStore;
use finchat::session::{
    AuthBackend, LoginError, LoginResponse, SessionCredentials, SessionManager, UserIdentity,
    VerifyError,
};
use finchat_proto::envelope::{Envelope, MessagePayload, SystemPayload, TypingPayload};
use finchat_testserver::{ServerOptions, start};

// =============================================================================
// Helpers
// =============================================================================

struct TokenAuth;

impl AuthBackend for TokenAuth {
    async fn login(&self, _username: &str, _password: &str) -> Result<LoginResponse, LoginError> {
        Ok(LoginResponse {
            token: "tok".into(),
            user_id: "user-tok".into(),
            expires_at: None,
        })
    }

    async fn verify(&self, token: &str) -> Result<UserIdentity, VerifyError> {
        Ok(UserIdentity {
            user_id: format!("user-{token}"),
        })
    }
}

fn authenticated_session() -> Arc<SessionManager<TokenAuth, MemoryStore>> {
    Arc::new(SessionManager::new(
        TokenAuth,
        MemoryStore::with_credentials(SessionCredentials {
            token: "tok".into(),
            user_id: "user-tok".into(),
            expires_at: None,
        }),
    ))
}

/// Typing timeout shortened to 300ms so the auto-clear is observable.
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

async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    timeout: Duration,
    description: &str,
    pred: F,
) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(evt)) if pred(&evt) => return evt,
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("channel closed while waiting for {description}"),
            Err(_) => break,
        }
    }
    panic!("timeout waiting for {description}");
}

async fn wait_for_phase(
    rx: &mut mpsc::Receiver<SessionEvent>,
    phase: ConnectionPhase,
) -> SessionEvent {
    wait_for_event(
        rx,
        Duration::from_secs(10),
        &format!("StateChanged({phase})"),
        |evt| matches!(evt, SessionEvent::StateChanged(state) if state.phase == phase),
    )
    .await
}

async fn connect(handle: &mut net::SessionHandle) {
    handle.commands.send(SessionCommand::Connect).await.unwrap();
    wait_for_phase(&mut handle.events, ConnectionPhase::Connected).await;
}

// =============================================================================
// Tests
// =============================================================================

/// A typing indicator with no follow-up reverts on its own after the
/// configured window — a lost "stopped typing" signal must not leave a
/// stale indicator forever.
#[tokio::test]
async fn dangling_typing_indicator_auto_clears() {
    let server = start(ServerOptions::default()).await.expect("server start");
    let mut handle = net::spawn_session(test_config(server.url()), authenticated_session());
    connect(&mut handle).await;

    server.inject(Envelope::Typing(TypingPayload { is_typing: true }));

    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "RemoteTyping(true)",
        |evt| matches!(evt, SessionEvent::RemoteTyping { active: true }),
    )
    .await;
    let set_at = Instant::now();

    // No follow-up arrives; the flag reverts after ~300ms.
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "RemoteTyping(false)",
        |evt| matches!(evt, SessionEvent::RemoteTyping { active: false }),
    )
    .await;
    let elapsed = set_at.elapsed();
    assert!(
        elapsed >= Duration::from_millis(250),
        "typing cleared too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(2),
        "typing cleared far too late: {elapsed:?}"
    );
}

/// An explicit "stopped typing" clears the flag immediately.
#[tokio::test]
async fn explicit_typing_stop_clears_immediately() {
    let server = start(ServerOptions::default()).await.expect("server start");
    let mut handle = net::spawn_session(test_config(server.url()), authenticated_session());
    connect(&mut handle).await;

    server.inject(Envelope::Typing(TypingPayload { is_typing: true }));
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "RemoteTyping(true)",
        |evt| matches!(evt, SessionEvent::RemoteTyping { active: true }),
    )
    .await;

    let set_at = Instant::now();
    server.inject(Envelope::Typing(TypingPayload { is_typing: false }));
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "RemoteTyping(false)",
        |evt| matches!(evt, SessionEvent::RemoteTyping { active: false }),
    )
    .await;
    assert!(
        set_at.elapsed() < Duration::from_millis(250),
        "explicit stop should not wait for the timeout"
    );
}

/// A message arriving while the indicator is up ends the composing state.
#[tokio::test]
async fn incoming_message_ends_composing_state() {
    let server = start(ServerOptions {
        reply_text: None,
        ..ServerOptions::default()
    })
    .await
    .expect("server start");
    let mut handle = net::spawn_session(test_config(server.url()), authenticated_session());
    connect(&mut handle).await;

    server.inject(Envelope::Typing(TypingPayload { is_typing: true }));
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "RemoteTyping(true)",
        |evt| matches!(evt, SessionEvent::RemoteTyping { active: true }),
    )
    .await;

    server.inject(Envelope::Message(MessagePayload {
        origin_id: None,
        text: "here it comes".into(),
        sender_is_user: false,
        server_timestamp: None,
    }));

    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "RemoteTyping(false)",
        |evt| matches!(evt, SessionEvent::RemoteTyping { active: false }),
    )
    .await;
    let entries = handle.log_snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "here it comes");
}

/// Clearing history empties the log and nothing else: the connection stays
/// Connected and the credentials stay put.
#[tokio::test]
async fn clear_history_leaves_connection_and_credentials_alone() {
    let server = start(ServerOptions::default()).await.expect("server start");
    let session = authenticated_session();
    let mut handle = net::spawn_session(test_config(server.url()), Arc::clone(&session));
    connect(&mut handle).await;

    // Build up a short transcript.
    handle
        .commands
        .send(SessionCommand::SendMessage { text: "Hi".into() })
        .await
        .unwrap();
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "EntryAppended(assistant)",
        |evt| matches!(evt, SessionEvent::EntryAppended(entry) if !entry.is_user),
    )
    .await;
    assert!(!handle.log_snapshot().is_empty());

    handle
        .commands
        .send(SessionCommand::ClearHistory)
        .await
        .unwrap();
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "HistoryCleared",
        |evt| matches!(evt, SessionEvent::HistoryCleared),
    )
    .await;

    assert_eq!(handle.log_snapshot().len(), 0);
    assert!(session.is_authenticated(), "credentials must be untouched");

    // Still connected: a new exchange works.
    handle
        .commands
        .send(SessionCommand::SendMessage {
            text: "after clear".into(),
        })
        .await
        .unwrap();
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "EntryUpdated(Delivered)",
        |evt| {
            matches!(
                evt,
                SessionEvent::EntryUpdated {
                    delivery: DeliveryState::Delivered,
                    ..
                }
            )
        },
    )
    .await;
}

/// A server-initiated `clear_history` envelope empties the local log too.
#[tokio::test]
async fn inbound_clear_history_empties_log() {
    let server = start(ServerOptions {
        reply_text: None,
        ..ServerOptions::default()
    })
    .await
    .expect("server start");
    let mut handle = net::spawn_session(test_config(server.url()), authenticated_session());
    connect(&mut handle).await;

    server.inject(Envelope::System(SystemPayload {
        text: "welcome".into(),
        server_timestamp: None,
    }));
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "EntryAppended",
        |evt| matches!(evt, SessionEvent::EntryAppended(_)),
    )
    .await;

    server.inject(Envelope::ClearHistory);
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "HistoryCleared",
        |evt| matches!(evt, SessionEvent::HistoryCleared),
    )
    .await;
    assert!(handle.log_snapshot().is_empty());
}

/// Unknown envelope kinds and malformed frames are dropped without
/// disturbing the session; traffic after them still flows and nothing
/// enters the log.
#[tokio::test]
async fn unknown_and_malformed_frames_are_dropped() {
    let server = start(ServerOptions {
        reply_text: None,
        ..ServerOptions::default()
    })
    .await
    .expect("server start");
    let mut handle = net::spawn_session(test_config(server.url()), authenticated_session());
    connect(&mut handle).await;

    // Forward-compatible kind the client does not know.
    server.inject_raw(r#"{"kind":"presence","userId":"u1","online":true}"#);
    // Structurally broken traffic.
    server.inject_raw("{ not json at all");
    server.inject_raw(r#"{"kind":"message"}"#);

    // The session survives: a normal exchange still completes.
    handle
        .commands
        .send(SessionCommand::SendMessage {
            text: "ping".into(),
        })
        .await
        .unwrap();
    wait_for_event(
        &mut handle.events,
        Duration::from_secs(5),
        "EntryUpdated(Delivered)",
        |evt| {
            matches!(
                evt,
                SessionEvent::EntryUpdated {
                    delivery: DeliveryState::Delivered,
                    ..
                }
            )
        },
    )
    .await;

    // Nothing but the user's own message entered the log.
    let entries = handle.log_snapshot();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_user);
}
