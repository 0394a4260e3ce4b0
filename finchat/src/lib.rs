//! `FinChat` — resilient chat client core.
//!
//! The library owns the connection/session state machine: when to connect,
//! reconnect, authenticate, queue, and deliver. Presentation is external;
//! it consumes [`net::SessionEvent`]s and conversation log snapshots.

pub mod config;
pub mod connection;
pub mod conversation;
pub mod net;
pub mod session;
pub mod transport;
