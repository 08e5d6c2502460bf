//! Rust SDK for the Meower realtime chat service.
//!
//! The crate is organized by transport surface:
//! - `stream`: websocket connection, frame routing, bridge normalization and
//!   callback registration.
//! - `api`: REST client for publishing posts and listing chats.

/// REST client and response types.
pub mod api;
/// Realtime connection, protocol types, and session helpers.
pub mod stream;

pub use api::{ApiClient, ApiError};
pub use stream::bridge::{BridgeRegistry, PostEvent};
pub use stream::client::{ChatClient, ChatClientError, ChatConnection, ClientEvent};
pub use stream::proto::Packet;
pub use stream::session::{ChatSession, HandlerError, HandlerResult};
