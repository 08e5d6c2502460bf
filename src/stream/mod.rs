//! Realtime stream modules.
//!
//! - `client`: websocket connection, login handshake, and outbound sender.
//! - `proto`: wire frames and typed payloads shared with the server.
//! - `router`: listener- and command-keyed dispatch of inbound frames.
//! - `bridge`: rewriting of posts relayed by bridge accounts.
//! - `keepalive`: periodic ping frames.
//! - `session`: callback registration on top of a connection.

/// Bridge post normalization.
pub mod bridge;
/// Websocket connection and frame sender.
pub mod client;
/// Keepalive timer.
pub mod keepalive;
/// Wire frames and payloads.
pub mod proto;
/// Inbound frame router.
pub mod router;
/// Callback-driven session wrapper.
pub mod session;
