//! Session supervisor: the connection state machine and its event loop.
//!
//! [`spawn_session`] starts one background task that owns everything the
//! session touches — the transport connection, the conversation log, the
//! pending-send queue, and every timer (backoff, heartbeat, typing
//! deadline). All state transitions are serialized through this one task:
//! it consumes user commands, raw transport events, and timer expirations
//! from a single `select!` loop, so no two transitions ever interleave and
//! the in-memory model needs no locking discipline beyond snapshot reads.
//!
//! # Architecture
//!
//! ```text
//! caller  ── SessionCommand ──▶  supervisor task  ──▶ WsConn (0 or 1)
//!         ◀── SessionEvent  ──   (state machine)  ◀── reader task events
//! ```
//!
//! Tearing the session down (logout or close) happens inside the loop, so
//! every timer and transport handle is released before the next command is
//! processed — no callback can fire against a torn-down session.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use finchat_proto::codec::{self, DecodeError};
use finchat_proto::envelope::{Envelope, MAX_TEXT_SIZE, MessagePayload, OriginId, TypingPayload};

use crate::config::ClientConfig;
use crate::connection::{ConnectionPhase, ConnectionState};
use crate::conversation::{
    ConversationEntry, ConversationLog, DeliveryState, LogChange, ReconcileOutcome,
};
use crate::session::store::CredentialStore;
use crate::session::{AuthBackend, SessionManager};
use crate::transport::ws::WsConn;
use crate::transport::{ConnEvent, TransportError};

/// Commands sent from the presentation layer to the session supervisor.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Open the connection (requires credentials).
    Connect,
    /// Send a chat message. Queued when not connected.
    SendMessage {
        /// The message text.
        text: String,
    },
    /// Retry a failed message by id.
    ResendMessage {
        /// Id of the failed entry to resend.
        id: OriginId,
    },
    /// Tell the backend whether the local user is composing.
    SetTyping {
        /// True while composing.
        active: bool,
    },
    /// Clear the conversation transcript (local and backend).
    ClearHistory,
    /// Clear credentials and drop the connection without retry.
    Logout,
    /// Shut the session down for good.
    Close,
}

/// Events sent from the session supervisor to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// A new entry was appended to the conversation log.
    EntryAppended(ConversationEntry),
    /// An existing entry's delivery state changed.
    EntryUpdated {
        /// The entry that changed.
        id: OriginId,
        /// Its new delivery state.
        delivery: DeliveryState,
    },
    /// The conversation log was emptied.
    HistoryCleared,
    /// The remote party started or stopped composing.
    RemoteTyping {
        /// True while the remote party is composing.
        active: bool,
    },
    /// Credentials are missing or were rejected; the user must sign in.
    AuthRequired {
        /// Human-readable reason.
        reason: String,
    },
    /// A non-transcript diagnostic for the user.
    Notice(String),
}

/// Handles to a running session.
pub struct SessionHandle {
    /// Command channel into the supervisor.
    pub commands: mpsc::Sender<SessionCommand>,
    /// Event stream from the supervisor.
    pub events: mpsc::Receiver<SessionEvent>,
    log: Arc<Mutex<ConversationLog>>,
}

impl SessionHandle {
    /// A point-in-time copy of the conversation log for rendering.
    #[must_use]
    pub fn log_snapshot(&self) -> Vec<ConversationEntry> {
        self.log.lock().snapshot()
    }
}

/// Spawn the session supervisor task and return its handles.
///
/// The session starts `Disconnected`; send [`SessionCommand::Connect`]
/// once credentials are in place. Dropping all command senders shuts the
/// supervisor down as if [`SessionCommand::Close`] had been sent.
pub fn spawn_session<B, S>(
    config: ClientConfig,
    session: Arc<SessionManager<B, S>>,
) -> SessionHandle
where
    B: AuthBackend + 'static,
    S: CredentialStore + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
    let (evt_tx, evt_rx) = mpsc::channel(config.channel_capacity);
    let log = Arc::new(Mutex::new(ConversationLog::new()));

    let supervisor = Supervisor {
        config,
        session,
        log: Arc::clone(&log),
        cmd_rx,
        evt_tx,
        state: ConnectionState::new(),
        pending: VecDeque::new(),
        typing_deadline: None,
    };
    tokio::spawn(supervisor.run());

    SessionHandle {
        commands: cmd_tx,
        events: evt_rx,
        log,
    }
}

/// An outbound user message awaiting server acknowledgment. Kept until
/// the echo with the same origin id arrives, so reconnection can resend
/// exactly the unacknowledged tail and nothing that was already accepted.
#[derive(Debug, Clone)]
struct PendingSend {
    id: OriginId,
    text: String,
}

/// Why the connected loop handed control back to the state machine.
enum ConnectedFlow {
    /// Keep processing.
    Continue,
    /// The transport failed mid-command; reconnect.
    Lost(String),
    /// The phase was changed by the command (logout/close); stop.
    Stop,
}

struct Supervisor<B: AuthBackend, S: CredentialStore> {
    config: ClientConfig,
    session: Arc<SessionManager<B, S>>,
    log: Arc<Mutex<ConversationLog>>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    evt_tx: mpsc::Sender<SessionEvent>,
    state: ConnectionState,
    pending: VecDeque<PendingSend>,
    typing_deadline: Option<Instant>,
}

impl<B: AuthBackend, S: CredentialStore> Supervisor<B, S> {
    async fn run(mut self) {
        tracing::debug!("session supervisor started");
        loop {
            match self.state.phase {
                ConnectionPhase::Disconnected => self.run_disconnected().await,
                ConnectionPhase::Connecting => self.run_connecting().await,
                ConnectionPhase::Reconnecting => self.run_reconnecting().await,
                ConnectionPhase::Connected => {
                    // The connected loop runs inside run_connecting and
                    // always leaves a different phase behind.
                    tracing::error!("connected phase reached outside the connect flow");
                    self.set_phase(ConnectionPhase::Disconnected, None);
                }
                ConnectionPhase::Closed => break,
            }
        }
        tracing::debug!("session supervisor exited");
    }

    /// Disconnected: no transport, no timers. Wait for commands.
    async fn run_disconnected(&mut self) {
        let Some(cmd) = self.cmd_rx.recv().await else {
            self.set_phase(ConnectionPhase::Closed, None);
            return;
        };
        self.handle_offline_command(cmd);
    }

    /// Connecting: one dial and handshake in flight. Commands keep being
    /// served so optimistic sends appear immediately; logout or close
    /// aborts the dial by dropping its future.
    async fn run_connecting(&mut self) {
        let Some(credentials) = self.session.credentials() else {
            // Credentials disappeared between scheduling and dialing.
            self.set_phase(ConnectionPhase::Disconnected, None);
            return;
        };
        let Some(url) = self.config.server_url.clone() else {
            self.emit(SessionEvent::Notice("no server URL configured".into()));
            self.set_phase(
                ConnectionPhase::Disconnected,
                Some("no server URL configured".into()),
            );
            return;
        };

        tracing::info!(url = %url, attempt = self.state.retry_count, "connecting");
        let connect = WsConn::connect(
            &url,
            &credentials.token,
            self.config.connect_timeout,
            self.config.handshake_timeout,
        );
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    match result {
                        Ok((conn, events)) => {
                            self.run_connected(conn, events).await;
                        }
                        Err(TransportError::HandshakeRejected(reason)) => {
                            tracing::warn!(reason = %reason, "authentication rejected by server");
                            self.session.invalidate();
                            self.emit(SessionEvent::AuthRequired {
                                reason: reason.clone(),
                            });
                            self.set_phase(ConnectionPhase::Disconnected, Some(reason));
                        }
                        Err(e) => {
                            tracing::warn!(err = %e, "connect attempt failed");
                            self.set_phase(ConnectionPhase::Reconnecting, Some(e.to_string()));
                        }
                    }
                    return;
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.set_phase(ConnectionPhase::Closed, None);
                        return;
                    };
                    self.handle_offline_command(cmd);
                    if self.state.phase != ConnectionPhase::Connecting {
                        // Logout or close aborted the dial.
                        return;
                    }
                }
            }
        }
    }

    /// Reconnecting: a jittered backoff timer is running. Commands keep
    /// being served; the timer firing moves us back to Connecting with
    /// the retry counter bumped.
    async fn run_reconnecting(&mut self) {
        let delay = self.config.reconnect.backoff.delay(self.state.retry_count);
        tracing::info!(
            retry = self.state.retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        let deadline = Instant::now() + delay;

        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    self.state.retry_count += 1;
                    let last_error = self.state.last_error.clone();
                    self.set_phase(ConnectionPhase::Connecting, last_error);
                    return;
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.set_phase(ConnectionPhase::Closed, None);
                        return;
                    };
                    self.handle_offline_command(cmd);
                    if self.state.phase != ConnectionPhase::Reconnecting {
                        return;
                    }
                }
            }
        }
    }

    /// Connected: envelopes flow. One loop selects over transport events,
    /// commands, the heartbeat, and the typing deadline. Every exit path
    /// closes the transport before the phase changes, so a stale socket
    /// can never race a new one.
    async fn run_connected(&mut self, conn: WsConn, mut events: mpsc::Receiver<ConnEvent>) {
        self.state.retry_count = 0;
        self.set_phase(ConnectionPhase::Connected, None);
        tracing::info!(user_id = %conn.user_id(), "connected");

        // Transparent reconnection: resend the unacknowledged tail, oldest
        // first, before serving anything else.
        let backlog: Vec<PendingSend> = self.pending.iter().cloned().collect();
        for item in backlog {
            if let Err(e) = self.send_message_envelope(&conn, &item).await {
                tracing::warn!(err = %e, "resend failed, reconnecting");
                conn.close().await;
                self.set_phase(ConnectionPhase::Reconnecting, Some(e.to_string()));
                return;
            }
        }

        let hb = self.config.reconnect.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + hb, hb);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_traffic = Instant::now();

        loop {
            let typing_deadline = self.typing_deadline;
            let typing_expiry = async move {
                match typing_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                ev = events.recv() => {
                    match ev {
                        Some(ConnEvent::Frame(frame)) => {
                            last_traffic = Instant::now();
                            self.handle_frame(&frame);
                        }
                        Some(ConnEvent::Pong) => {
                            last_traffic = Instant::now();
                        }
                        Some(ConnEvent::Closed(reason)) => {
                            tracing::warn!(reason = ?reason, "connection closed unexpectedly");
                            conn.close().await;
                            self.set_phase(
                                ConnectionPhase::Reconnecting,
                                reason.or_else(|| Some("connection closed".into())),
                            );
                            return;
                        }
                        None => {
                            conn.close().await;
                            self.set_phase(
                                ConnectionPhase::Reconnecting,
                                Some("connection closed".into()),
                            );
                            return;
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.fail_pending();
                        conn.close().await;
                        self.set_phase(ConnectionPhase::Closed, None);
                        return;
                    };
                    match self.handle_connected_command(cmd, &conn).await {
                        ConnectedFlow::Continue => {}
                        ConnectedFlow::Lost(reason) => {
                            conn.close().await;
                            self.set_phase(ConnectionPhase::Reconnecting, Some(reason));
                            return;
                        }
                        ConnectedFlow::Stop => {
                            conn.close().await;
                            return;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if last_traffic.elapsed() >= hb * 2 {
                        // Silently dead connection: not an error to surface,
                        // just a reason to reconnect.
                        tracing::warn!("no traffic for two heartbeat intervals");
                        conn.close().await;
                        self.set_phase(
                            ConnectionPhase::Reconnecting,
                            Some("heartbeat lost".into()),
                        );
                        return;
                    }
                    if conn.send_ping().await.is_err() {
                        conn.close().await;
                        self.set_phase(
                            ConnectionPhase::Reconnecting,
                            Some("liveness probe failed".into()),
                        );
                        return;
                    }
                }
                () = typing_expiry => {
                    // Lost "stopped typing" signal: auto-clear the flag.
                    self.typing_deadline = None;
                    self.emit(SessionEvent::RemoteTyping { active: false });
                }
            }
        }
    }

    /// Serve a command while no transport is up (Disconnected, Connecting,
    /// Reconnecting). Sends queue instead of being rejected so the user
    /// gets optimistic feedback even before the socket exists.
    fn handle_offline_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect => {
                if self.state.phase != ConnectionPhase::Disconnected {
                    tracing::debug!(phase = %self.state.phase, "connect ignored");
                } else if self.session.is_authenticated() {
                    self.set_phase(ConnectionPhase::Connecting, None);
                } else {
                    self.emit(SessionEvent::AuthRequired {
                        reason: "sign in before connecting".into(),
                    });
                }
            }
            SessionCommand::SendMessage { text } => {
                self.queue_message(text);
            }
            SessionCommand::ResendMessage { id } => {
                self.requeue_failed(&id);
            }
            SessionCommand::SetTyping { .. } => {
                // Ephemeral; nothing to tell anyone while offline.
            }
            SessionCommand::ClearHistory => self.clear_history_local(),
            SessionCommand::Logout => {
                self.session.logout();
                self.fail_pending();
                if matches!(
                    self.state.phase,
                    ConnectionPhase::Connecting | ConnectionPhase::Reconnecting
                ) {
                    self.set_phase(ConnectionPhase::Disconnected, None);
                }
            }
            SessionCommand::Close => {
                self.fail_pending();
                self.set_phase(ConnectionPhase::Closed, None);
            }
        }
    }

    /// Serve a command while connected.
    async fn handle_connected_command(
        &mut self,
        cmd: SessionCommand,
        conn: &WsConn,
    ) -> ConnectedFlow {
        match cmd {
            SessionCommand::Connect => ConnectedFlow::Continue,
            SessionCommand::SendMessage { text } => {
                let Some(item) = self.queue_message(text) else {
                    return ConnectedFlow::Continue;
                };
                match self.send_message_envelope(conn, &item).await {
                    Ok(()) => ConnectedFlow::Continue,
                    Err(e) => ConnectedFlow::Lost(e.to_string()),
                }
            }
            SessionCommand::ResendMessage { id } => {
                let Some(item) = self.requeue_failed(&id) else {
                    return ConnectedFlow::Continue;
                };
                match self.send_message_envelope(conn, &item).await {
                    Ok(()) => ConnectedFlow::Continue,
                    Err(e) => ConnectedFlow::Lost(e.to_string()),
                }
            }
            SessionCommand::SetTyping { active } => {
                let envelope = Envelope::Typing(TypingPayload { is_typing: active });
                self.send_envelope(conn, &envelope).await
            }
            SessionCommand::ClearHistory => {
                self.clear_history_local();
                // The backend clears its transcript too.
                self.send_envelope(conn, &Envelope::ClearHistory).await
            }
            SessionCommand::Logout => {
                self.session.logout();
                self.fail_pending();
                self.set_phase(ConnectionPhase::Disconnected, None);
                ConnectedFlow::Stop
            }
            SessionCommand::Close => {
                self.fail_pending();
                self.set_phase(ConnectionPhase::Closed, None);
                ConnectedFlow::Stop
            }
        }
    }

    /// Decode one inbound frame and fold it into the session model.
    /// Codec failures are dropped with a diagnostic — they never reach the
    /// state machine.
    fn handle_frame(&mut self, frame: &str) {
        let envelope = match codec::decode(frame) {
            Ok(envelope) => envelope,
            Err(DecodeError::UnknownKind(kind)) => {
                tracing::debug!(kind = %kind, "ignoring unknown envelope kind");
                return;
            }
            Err(e @ DecodeError::MalformedFrame(_)) => {
                tracing::warn!(err = %e, "dropping malformed frame");
                return;
            }
        };

        if let Envelope::Typing(typing) = &envelope {
            if typing.is_typing {
                self.typing_deadline = Some(Instant::now() + self.config.chat.typing_timeout);
            } else {
                self.typing_deadline = None;
            }
            self.emit(SessionEvent::RemoteTyping {
                active: typing.is_typing,
            });
            return;
        }

        // A message arriving ends the composing state implicitly.
        if matches!(envelope, Envelope::Message(_)) && self.typing_deadline.is_some() {
            self.typing_deadline = None;
            self.emit(SessionEvent::RemoteTyping { active: false });
        }

        let change = self.log.lock().apply_remote(&envelope);
        match change {
            Some(LogChange::Appended(entry)) => self.emit(SessionEvent::EntryAppended(entry)),
            Some(LogChange::Updated { id, delivery }) => {
                // Acknowledged or failed: either way it leaves the resend queue.
                self.pending.retain(|p| p.id != id);
                self.emit(SessionEvent::EntryUpdated { id, delivery });
            }
            Some(LogChange::Cleared) => {
                self.pending.clear();
                self.emit(SessionEvent::HistoryCleared);
            }
            None => {}
        }
    }

    /// Validate, optimistically append, and queue an outbound message.
    /// Returns the queued item, or `None` if validation failed.
    fn queue_message(&mut self, text: String) -> Option<PendingSend> {
        if text.is_empty() {
            self.emit(SessionEvent::Notice("cannot send an empty message".into()));
            return None;
        }
        if text.len() > MAX_TEXT_SIZE {
            self.emit(SessionEvent::Notice(format!(
                "message too large ({} bytes, max {MAX_TEXT_SIZE})",
                text.len()
            )));
            return None;
        }

        let entry = {
            let mut log = self.log.lock();
            let id = log.append_local(text.clone());
            log.entry(&id).cloned()
        }?;
        self.emit(SessionEvent::EntryAppended(entry.clone()));

        // Bounded queue: beyond the cap the oldest is dropped, marked
        // failed so the transcript stays honest.
        while self.pending.len() >= self.config.chat.pending_send_cap {
            let Some(dropped) = self.pending.pop_front() else {
                break;
            };
            tracing::warn!(origin_id = %dropped.id, "pending-send queue full, dropping oldest");
            let change = self
                .log
                .lock()
                .reconcile(&dropped.id, ReconcileOutcome::Failed);
            if change.is_some() {
                self.emit(SessionEvent::EntryUpdated {
                    id: dropped.id,
                    delivery: DeliveryState::Failed,
                });
            }
        }

        let item = PendingSend {
            id: entry.id,
            text,
        };
        self.pending.push_back(item.clone());
        Some(item)
    }

    /// Flip a failed entry back to pending and requeue it for sending.
    fn requeue_failed(&mut self, id: &OriginId) -> Option<PendingSend> {
        let text = self.log.lock().revive(id)?;
        self.emit(SessionEvent::EntryUpdated {
            id: id.clone(),
            delivery: DeliveryState::Pending,
        });
        let item = PendingSend {
            id: id.clone(),
            text,
        };
        self.pending.push_back(item.clone());
        Some(item)
    }

    /// Encode and transmit one queued user message.
    async fn send_message_envelope(
        &mut self,
        conn: &WsConn,
        item: &PendingSend,
    ) -> Result<(), TransportError> {
        let envelope = Envelope::Message(MessagePayload {
            origin_id: Some(item.id.clone()),
            text: item.text.clone(),
            sender_is_user: true,
            server_timestamp: None,
        });
        let frame = match codec::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                // Not a transport loss: fail just this entry.
                tracing::error!(err = %e, origin_id = %item.id, "failed to encode outbound message");
                self.pending.retain(|p| p.id != item.id);
                let change = self.log.lock().reconcile(&item.id, ReconcileOutcome::Failed);
                if change.is_some() {
                    self.emit(SessionEvent::EntryUpdated {
                        id: item.id.clone(),
                        delivery: DeliveryState::Failed,
                    });
                }
                return Ok(());
            }
        };
        conn.send_frame(&frame).await
    }

    /// Encode and transmit a non-message envelope, mapping transport loss
    /// to the reconnect flow.
    async fn send_envelope(&mut self, conn: &WsConn, envelope: &Envelope) -> ConnectedFlow {
        match codec::encode(envelope) {
            Ok(frame) => match conn.send_frame(&frame).await {
                Ok(()) => ConnectedFlow::Continue,
                Err(e) => ConnectedFlow::Lost(e.to_string()),
            },
            Err(e) => {
                tracing::error!(err = %e, "failed to encode envelope");
                ConnectedFlow::Continue
            }
        }
    }

    /// Mark every queued-but-unacknowledged message as failed. Used when
    /// the session ends (logout or close) so the transcript records what
    /// never made it out.
    fn fail_pending(&mut self) {
        let ids: Vec<OriginId> = self.pending.drain(..).map(|p| p.id).collect();
        for id in ids {
            let change = self.log.lock().reconcile(&id, ReconcileOutcome::Failed);
            if change.is_some() {
                self.emit(SessionEvent::EntryUpdated {
                    id,
                    delivery: DeliveryState::Failed,
                });
            }
        }
    }

    /// Clear the transcript and the resend queue. Connection state and
    /// credentials are untouched.
    fn clear_history_local(&mut self) {
        self.log.lock().clear();
        self.pending.clear();
        self.emit(SessionEvent::HistoryCleared);
    }

    fn set_phase(&mut self, phase: ConnectionPhase, error: Option<String>) {
        self.state.phase = phase;
        self.state.last_error = error;
        tracing::debug!(
            phase = %phase,
            retry = self.state.retry_count,
            "connection state changed"
        );
        self.emit(SessionEvent::StateChanged(self.state.clone()));
    }

    fn emit(&self, event: SessionEvent) {
        if self.evt_tx.try_send(event).is_err() {
            tracing::debug!("session event dropped (receiver gone or slow)");
        }
    }
}
