//! WebSocket connection wrapper.
//!
//! [`WsConn::connect`] dials the chat backend, authenticates the connection
//! with the session token, and spawns a background reader task that
//! forwards raw frames to the owner over a channel. The session supervisor
//! owns at most one `WsConn` at a time and must [`close`](WsConn::close)
//! it before dialing again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use finchat_proto::codec;
use finchat_proto::handshake::HandshakeFrame;

use super::{ConnEvent, TransportError};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Capacity of the channel between the reader task and the owner.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An authenticated WebSocket connection to the chat backend.
///
/// Created via [`WsConn::connect`], which performs the full handshake:
/// dial, send the `auth` frame, await `auth_ok`. Raw frames arrive on the
/// [`ConnEvent`] receiver returned alongside the connection, so the owner
/// can select over them without borrowing the connection itself.
pub struct WsConn {
    /// Write half of the WebSocket connection (shared for concurrent sends).
    ws_sender: Arc<Mutex<WsSender>>,
    /// Whether the connection is still believed to be open.
    connected: Arc<AtomicBool>,
    /// Handle to the background reader task.
    reader_handle: tokio::task::JoinHandle<()>,
    /// Identity confirmed by the server during the handshake.
    user_id: String,
}

impl WsConn {
    /// Dial the backend and authenticate the connection.
    ///
    /// Steps:
    /// 1. Open the WebSocket to `url` (bounded by `connect_timeout`)
    /// 2. Send an `auth` handshake frame carrying `token`
    /// 3. Await `auth_ok` or `auth_rejected` (bounded by `handshake_timeout`)
    /// 4. Spawn the background reader task
    ///
    /// Returns the connection and the raw-event receiver fed by the
    /// reader task; the server-confirmed identity is available via
    /// [`user_id`](Self::user_id).
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the dial or the handshake ack times out.
    /// - [`TransportError::Unreachable`] if the server cannot be reached.
    /// - [`TransportError::HandshakeRejected`] if the server refuses the token.
    /// - [`TransportError::ConnectionClosed`] / [`TransportError::Io`] otherwise.
    pub async fn connect(
        url: &str,
        token: &str,
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<ConnEvent>), TransportError> {
        let (ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "websocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "websocket connect failed");
                map_ws_connect_error(&e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = HandshakeFrame::Auth {
            token: token.to_string(),
        };
        let frame = codec::encode_handshake(&hello)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        ws_sender
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send auth frame");
                TransportError::ConnectionClosed
            })?;

        let user_id = tokio::time::timeout(handshake_timeout, wait_for_auth_ack(&mut ws_reader))
            .await
            .map_err(|_| {
                tracing::warn!(url, "handshake acknowledgment timed out");
                TransportError::Timeout
            })??;

        tracing::info!(url, user_id = %user_id, "connection authenticated");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_connected = Arc::clone(&connected);
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, reader_connected));

        Ok((
            Self {
                ws_sender: Arc::new(Mutex::new(ws_sender)),
                connected,
                reader_handle,
                user_id,
            },
            rx,
        ))
    }

    /// Send a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the connection is
    /// down or the write fails.
    pub async fn send_frame(&self, frame: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut sender = self.ws_sender.lock().await;
        sender
            .send(Message::Text(frame.to_owned().into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "websocket send failed");
                self.connected.store(false, Ordering::Relaxed);
                TransportError::ConnectionClosed
            })
    }

    /// Send a liveness probe (WebSocket ping).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the write fails.
    pub async fn send_ping(&self) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut sender = self.ws_sender.lock().await;
        sender
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| {
                tracing::debug!(err = %e, "websocket ping failed");
                self.connected.store(false, Ordering::Relaxed);
                TransportError::ConnectionClosed
            })
    }

    /// Whether the connection is still believed to be open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// The identity the server confirmed at handshake time.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Tear the connection down: stop the reader task and send a
    /// best-effort close frame. Must complete before a new dial so two
    /// sockets never race to deliver duplicate envelopes.
    pub async fn close(self) {
        self.reader_handle.abort();
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        let _ = sender.send(Message::Close(None)).await;
        let _ = sender.flush().await;
        tracing::debug!("websocket connection closed");
    }
}

/// Wait for the server's answer to our `auth` frame, skipping any
/// non-text frames that arrive first.
async fn wait_for_auth_ack(reader: &mut WsReader) -> Result<String, TransportError> {
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match codec::decode_handshake(text.as_str()) {
                Ok(HandshakeFrame::AuthOk { user_id }) => return Ok(user_id),
                Ok(HandshakeFrame::AuthRejected { reason }) => {
                    tracing::warn!(reason = %reason, "handshake rejected by server");
                    return Err(TransportError::HandshakeRejected(reason));
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected frame during handshake");
                    return Err(TransportError::Io(std::io::Error::other(
                        "unexpected frame during handshake",
                    )));
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed handshake response");
                    return Err(TransportError::Io(std::io::Error::other(format!(
                        "malformed handshake response: {e}"
                    ))));
                }
            },
            Ok(Message::Close(_)) => return Err(TransportError::ConnectionClosed),
            Ok(_) => {
                // Skip ping/pong/binary frames during the handshake.
            }
            Err(e) => {
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "websocket error during handshake: {e}"
                ))));
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// Background task reading WebSocket messages and forwarding them as
/// [`ConnEvent`]s. Exactly one `Closed` event is emitted, as the final
/// event before the task exits.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ConnEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut close_reason = None;
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(ConnEvent::Frame(text.to_string())).await.is_err() {
                    // Owner dropped the receiver; stop reading.
                    break;
                }
            }
            Ok(Message::Pong(_)) => {
                if tx.send(ConnEvent::Pong).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                close_reason = frame.map(|f| f.reason.to_string());
                tracing::info!(reason = ?close_reason, "websocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Binary(_) | Message::Frame(_)) => {
                // Pings are answered by the protocol layer; binary and raw
                // frames are not part of this protocol.
            }
            Err(e) => {
                tracing::warn!(err = %e, "websocket read error");
                close_reason = Some(e.to_string());
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    let _ = tx.send(ConnEvent::Closed(close_reason)).await;
    tracing::debug!("websocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: &tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable
            } else {
                TransportError::Io(std::io::Error::new(io_err.kind(), io_err.to_string()))
            }
        }
        WsError::Url(_) => TransportError::Unreachable,
        other => TransportError::Io(std::io::Error::other(format!("connection error: {other}"))),
    }
}
