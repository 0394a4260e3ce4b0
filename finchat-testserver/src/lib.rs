//! In-process stub chat backend for `FinChat` integration tests.
//!
//! Plays the role of the real backend: authenticates connections via the
//! handshake, echoes user messages back as delivery acknowledgments, and
//! answers with a scripted responder reply. Tests steer edge cases
//! through [`ServerOptions`] (rejected tokens, duplicate echoes, scripted
//! failures) and [`ServerHandle`] directives (inject envelopes, kick all
//! connections to simulate a network drop).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use finchat_proto::codec;
use finchat_proto::envelope::{Envelope, ErrorPayload, MessagePayload, TypingPayload};
use finchat_proto::handshake::HandshakeFrame;

/// Scripted behavior for the stub backend.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Token the handshake must carry. `None` accepts any non-empty token.
    pub required_token: Option<String>,
    /// Echo user messages back (the delivery acknowledgment).
    pub echo_ack: bool,
    /// Send every echo twice, as a duplicated delivery after reconnection
    /// would.
    pub duplicate_echo: bool,
    /// Responder reply sent after the echo. `None` keeps the responder
    /// silent.
    pub reply_text: Option<String>,
    /// Send a `typing` indicator before the reply (and leave it dangling
    /// when there is no reply).
    pub typing_before_reply: bool,
    /// Answer user messages with an `error` envelope instead of an echo.
    pub fail_messages: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            required_token: None,
            echo_ack: true,
            duplicate_echo: false,
            reply_text: Some("Hello, how can I help?".into()),
            typing_before_reply: false,
            fail_messages: false,
        }
    }
}

/// Out-of-band instructions tests push at connected clients.
#[derive(Debug, Clone)]
pub enum Directive {
    /// Deliver an envelope to every connected client.
    Send(Envelope),
    /// Deliver a raw text frame verbatim (malformed or unknown-kind
    /// traffic for codec-resilience tests).
    SendRaw(String),
    /// Close every connection, as a network drop would.
    Kick,
}

/// A running stub backend.
pub struct ServerHandle {
    /// Address the server is bound to.
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    directives: broadcast::Sender<Directive>,
    handshakes: Arc<AtomicUsize>,
}

impl ServerHandle {
    /// WebSocket URL clients should dial.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/ws/chat", self.addr)
    }

    /// Deliver an envelope to every connected client.
    pub fn inject(&self, envelope: Envelope) {
        let _ = self.directives.send(Directive::Send(envelope));
    }

    /// Deliver a raw text frame verbatim to every connected client.
    pub fn inject_raw(&self, frame: impl Into<String>) {
        let _ = self.directives.send(Directive::SendRaw(frame.into()));
    }

    /// Close every connection, as a network drop would.
    pub fn kick_all(&self) {
        let _ = self.directives.send(Directive::Kick);
    }

    /// Total number of successful handshakes since startup. Increases on
    /// every (re)connection, which is how tests observe reconnects.
    #[must_use]
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Stop accepting connections entirely.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

struct ServerState {
    options: ServerOptions,
    directives: broadcast::Sender<Directive>,
    handshakes: Arc<AtomicUsize>,
}

/// Start the stub backend on `127.0.0.1:0` (OS-assigned port).
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start(
    options: ServerOptions,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    start_on("127.0.0.1:0", options).await
}

/// Start the stub backend on an explicit address. Used by tests that
/// restart the server on a port a client is already reconnecting to.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind.
pub async fn start_on(
    addr: &str,
    options: ServerOptions,
) -> Result<ServerHandle, Box<dyn std::error::Error + Send + Sync>> {
    let (directives, _) = broadcast::channel(64);
    let handshakes = Arc::new(AtomicUsize::new(0));
    let state = Arc::new(ServerState {
        options,
        directives: directives.clone(),
        handshakes: Arc::clone(&handshakes),
    });

    let app = axum::Router::new()
        .route("/ws/chat", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "stub backend server error");
        }
    });

    Ok(ServerHandle {
        addr,
        handle,
        directives,
        handshakes,
    })
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One client connection: handshake first, then the chat loop.
async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sender, mut receiver) = socket.split();

    let Some(token) = wait_for_auth(&mut receiver).await else {
        tracing::debug!("connection closed before handshake");
        return;
    };

    let accepted = match &state.options.required_token {
        Some(required) => token == *required,
        None => !token.is_empty(),
    };
    if !accepted {
        tracing::info!("rejecting handshake");
        let _ = send_handshake(
            &mut sender,
            &HandshakeFrame::AuthRejected {
                reason: "invalid or expired token".into(),
            },
        )
        .await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let user_id = format!("user-{token}");
    if send_handshake(&mut sender, &HandshakeFrame::AuthOk { user_id }).await.is_err() {
        return;
    }
    state.handshakes.fetch_add(1, Ordering::SeqCst);
    tracing::info!("client authenticated");

    let mut directives = state.directives.subscribe();
    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(&mut sender, &state, text.as_str()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {
                        // Ping/pong are answered by axum; binary is not
                        // part of this protocol.
                    }
                }
            }
            directive = directives.recv() => {
                match directive {
                    Ok(Directive::Send(envelope)) => {
                        if send_envelope(&mut sender, &envelope).await.is_err() {
                            break;
                        }
                    }
                    Ok(Directive::SendRaw(frame)) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Directive::Kick) => {
                        tracing::info!("kicking client");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::debug!("client connection closed");
}

/// Wait for the first text frame and extract the auth token from it.
async fn wait_for_auth(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match codec::decode_handshake(text.as_str()) {
                Ok(HandshakeFrame::Auth { token }) => return Some(token),
                Ok(other) => {
                    tracing::warn!(?other, "expected auth frame, got something else");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed handshake frame");
                    return None;
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {
                // Skip non-text frames during the handshake.
            }
            Err(_) => return None,
        }
    }
    None
}

/// React to one chat frame from the client per the scripted behavior.
async fn handle_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &Arc<ServerState>,
    frame: &str,
) -> Result<(), axum::Error> {
    let envelope = match codec::decode(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed client frame");
            return Ok(());
        }
    };

    match envelope {
        Envelope::Message(payload) if payload.sender_is_user => {
            let options = &state.options;

            if options.fail_messages {
                let error = Envelope::Error(ErrorPayload {
                    origin_id: payload.origin_id,
                    text: "responder failed to process the message".into(),
                    server_timestamp: Some(now_iso()),
                });
                return send_envelope(sender, &error).await;
            }

            if options.echo_ack {
                let echo = Envelope::Message(MessagePayload {
                    origin_id: payload.origin_id.clone(),
                    text: payload.text.clone(),
                    sender_is_user: true,
                    server_timestamp: Some(now_iso()),
                });
                send_envelope(sender, &echo).await?;
                if options.duplicate_echo {
                    send_envelope(sender, &echo).await?;
                }
            }

            if options.typing_before_reply {
                let typing = Envelope::Typing(TypingPayload { is_typing: true });
                send_envelope(sender, &typing).await?;
            }

            if let Some(reply) = &options.reply_text {
                let reply = Envelope::Message(MessagePayload {
                    origin_id: None,
                    text: reply.clone(),
                    sender_is_user: false,
                    server_timestamp: Some(now_iso()),
                });
                send_envelope(sender, &reply).await?;
            }
            Ok(())
        }
        Envelope::ClearHistory => {
            tracing::info!("client cleared its transcript");
            Ok(())
        }
        Envelope::Typing(t) => {
            tracing::debug!(is_typing = t.is_typing, "client typing state");
            Ok(())
        }
        other => {
            tracing::debug!(?other, "ignoring client envelope");
            Ok(())
        }
    }
}

async fn send_envelope(
    sender: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), axum::Error> {
    match codec::encode(envelope) {
        Ok(frame) => sender.send(Message::Text(frame.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode envelope");
            Ok(())
        }
    }
}

async fn send_handshake(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &HandshakeFrame,
) -> Result<(), axum::Error> {
    match codec::encode_handshake(frame) {
        Ok(frame) => sender.send(Message::Text(frame.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode handshake frame");
            Ok(())
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
