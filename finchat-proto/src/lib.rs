//! Shared protocol definitions for the `FinChat` wire format.

pub mod codec;
pub mod envelope;
pub mod handshake;
