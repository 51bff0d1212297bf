//! Client-side networking core for the Courier chat application.
//!
//! The crate is organized by transport surface:
//! - `api`: authenticated HTTP client with transparent access-token refresh.
//! - `realtime`: persistent websocket session with automatic reconnects and
//!   at-least-once outbound delivery through an in-memory outbox.
//! - `auth`: token storage contract shared by both transports.
//! - `dispatch`: event sink for inbound frames and failure notifications.
//! - `retry`: shared retry and timeout utilities.

/// Authenticated request/response client and its error types.
pub mod api;
/// Token pair storage contract and an in-memory implementation.
pub mod auth;
/// Event sink contract used by both transports.
pub mod dispatch;
/// Realtime websocket session, outbox, and wire frame helpers.
pub mod realtime;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
