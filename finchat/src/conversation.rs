//! The conversation log: an ordered, append-only record of the session.
//!
//! The log is a pure fold over envelope arrival order — no socket needed —
//! which is what makes replay and testing possible. User-authored entries
//! are echoed optimistically with `Pending` delivery and reconciled when
//! the server acknowledgment (or failure) carrying the same origin id
//! arrives. Failed entries stay visible: the log is an honest record of
//! the conversation, not just a success log.

use chrono::{DateTime, Utc};

use finchat_proto::envelope::{Envelope, OriginId};

/// Delivery lifecycle of a conversation entry.
///
/// `Pending` transitions only to `Delivered` or `Failed`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistically echoed, not yet acknowledged by the server.
    Pending,
    /// Acknowledged by the server.
    Delivered,
    /// Could not be delivered; eligible for manual resend.
    Failed,
}

/// One entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    /// The client origin id for user-authored entries; synthesized locally
    /// for remote entries. Unique within a session.
    pub id: OriginId,
    /// The entry text.
    pub text: String,
    /// Whether the entry was authored by the local user.
    pub is_user: bool,
    /// When the entry was appended, by the local clock.
    pub created_at: DateTime<Utc>,
    /// Delivery lifecycle state. Remote entries are born `Delivered`.
    pub delivery: DeliveryState,
}

/// What a remote envelope did to the log, so the supervisor can emit the
/// matching session event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChange {
    /// A new entry was appended at the end.
    Appended(ConversationEntry),
    /// An existing entry's delivery state changed.
    Updated {
        /// The entry that changed.
        id: OriginId,
        /// Its new delivery state.
        delivery: DeliveryState,
    },
    /// The whole log was emptied.
    Cleared,
}

/// Reconciliation outcome for a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The server acknowledged delivery.
    Delivered,
    /// The entry could not be delivered.
    Failed,
}

/// Ordered, append-only conversation log with de-duplication.
#[derive(Debug, Default)]
pub struct ConversationLog {
    entries: Vec<ConversationEntry>,
}

impl ConversationLog {
    /// Creates an empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an optimistic user-authored entry with `Pending` delivery
    /// and returns its origin id for later reconciliation.
    pub fn append_local(&mut self, text: impl Into<String>) -> OriginId {
        let id = OriginId::new();
        self.entries.push(ConversationEntry {
            id: id.clone(),
            text: text.into(),
            is_user: true,
            created_at: Utc::now(),
            delivery: DeliveryState::Pending,
        });
        id
    }

    /// Resolves a `Pending` entry to `Delivered` or `Failed`.
    ///
    /// Returns the change if a pending entry with the given id existed.
    /// Entries that are already resolved are left untouched — this is the
    /// de-duplication point for acknowledgments replayed after a
    /// reconnection.
    pub fn reconcile(&mut self, id: &OriginId, outcome: ReconcileOutcome) -> Option<LogChange> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == *id && e.delivery == DeliveryState::Pending)?;
        entry.delivery = match outcome {
            ReconcileOutcome::Delivered => DeliveryState::Delivered,
            ReconcileOutcome::Failed => DeliveryState::Failed,
        };
        Some(LogChange::Updated {
            id: id.clone(),
            delivery: entry.delivery,
        })
    }

    /// Flips a `Failed` entry back to `Pending` for a manual resend.
    ///
    /// Returns the entry's text if it was eligible.
    pub fn revive(&mut self, id: &OriginId) -> Option<String> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == *id && e.delivery == DeliveryState::Failed)?;
        entry.delivery = DeliveryState::Pending;
        Some(entry.text.clone())
    }

    /// Folds a remote envelope into the log.
    ///
    /// - A server echo of a user message (matching origin id) resolves the
    ///   pending entry to `Delivered`; replays of an already-resolved echo
    ///   are discarded, and echoes with no matching entry (e.g. after a
    ///   clear) are dropped rather than resurrected.
    /// - Responder and system envelopes append new `Delivered` entries in
    ///   arrival order — arrival order is what the user experienced, so the
    ///   server timestamp is never used as an ordering key.
    /// - An `error` envelope carrying an origin id fails that entry; one
    ///   without renders as a system-style entry so responder failures stay
    ///   visible in the transcript.
    /// - `clear_history` empties the log atomically.
    /// - `typing` is ephemeral and never enters the log.
    ///
    /// Returns what changed, or `None` if the envelope was discarded.
    pub fn apply_remote(&mut self, envelope: &Envelope) -> Option<LogChange> {
        match envelope {
            Envelope::Message(payload) => {
                if payload.sender_is_user {
                    let Some(id) = &payload.origin_id else {
                        tracing::debug!("user echo without origin id dropped");
                        return None;
                    };
                    let change = self.reconcile(id, ReconcileOutcome::Delivered);
                    if change.is_none() {
                        tracing::debug!(origin_id = %id, "duplicate or unmatched echo discarded");
                    }
                    return change;
                }
                Some(self.append_remote(&payload.text, false))
            }
            Envelope::System(payload) => Some(self.append_remote(&payload.text, false)),
            Envelope::Error(payload) => {
                if let Some(id) = &payload.origin_id {
                    let change = self.reconcile(id, ReconcileOutcome::Failed);
                    if change.is_none() {
                        tracing::debug!(origin_id = %id, "error for unknown or resolved entry dropped");
                    }
                    change
                } else {
                    Some(self.append_remote(&payload.text, false))
                }
            }
            Envelope::ClearHistory => {
                self.entries.clear();
                Some(LogChange::Cleared)
            }
            Envelope::Typing(_) => None,
        }
    }

    /// Empties the log atomically. Connection state and credentials are
    /// not this type's concern and are unaffected.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Looks up an entry by id.
    #[must_use]
    pub fn entry(&self, id: &OriginId) -> Option<&ConversationEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A point-in-time copy of the ordered entries for presentation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConversationEntry> {
        self.entries.clone()
    }

    fn append_remote(&mut self, text: &str, is_user: bool) -> LogChange {
        let entry = ConversationEntry {
            id: OriginId::new(),
            text: text.to_string(),
            is_user,
            created_at: Utc::now(),
            delivery: DeliveryState::Delivered,
        };
        self.entries.push(entry.clone());
        LogChange::Appended(entry)
    }
}
