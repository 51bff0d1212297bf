//! Realtime session modules.

/// Websocket session client, connection state machine, and session handle.
pub mod client;
/// Pending-message outbox with at-least-once resend semantics.
pub mod outbox;
/// Wire frame construction and acknowledgment detection.
pub mod proto;

pub use client::{
    ConnectionState, RealtimeClient, RealtimeDefaults, RealtimeError, RealtimeOptions,
    RealtimeSession,
};
pub use outbox::{Outbox, PendingMessage};
