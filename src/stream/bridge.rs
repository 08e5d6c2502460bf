//! Normalization of posts relayed by bridge accounts.
//!
//! Bridges post on behalf of users of another platform with the original
//! author folded into the content as `author: message`. The author is split
//! back out so bridged and native posts share one shape.
//!
//! The split is a plain `:` split with no escaping, so an author name
//! containing `:` is cut short. This matches what bridges put on the wire.

use crate::stream::proto::{FrameError, Packet, ServerFrame, DIRECT_CMD};

/// Separator between the relayed author and the message.
pub const BRIDGE_SEPARATOR: char = ':';
/// Sender whose content carries an extra leading segment before the author.
pub const WEBHOOK_SENDER: &str = "Webhooks";
/// Bridges known by default.
pub const DEFAULT_BRIDGES: &[&str] = &["Discord"];

/// Ordered set of sender names treated as bridges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeRegistry {
    names: Vec<String>,
}

impl BridgeRegistry {
    /// Creates a registry from sender names, in order.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self { names: Vec::new() };
        for name in names {
            registry.insert(name);
        }
        registry
    }

    /// Adds a bridge name; duplicates are ignored.
    pub fn insert(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.names.push(name);
        }
    }

    /// Whether `sender` is a bridge.
    pub fn contains(&self, sender: &str) -> bool {
        self.names.iter().any(|name| name == sender)
    }

    /// Returns the bridge names in insertion order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGES.iter().copied())
    }
}

/// Bridge that relayed a post, with the frame as it arrived.
#[derive(Clone, Debug, PartialEq)]
pub struct BridgeOrigin {
    pub sender: String,
    pub frame: Packet,
}

/// Canonical post delivered to hosts.
#[derive(Clone, Debug, PartialEq)]
pub struct PostEvent {
    pub author: String,
    pub content: String,
    /// Chat the post was made in (`home` for the home timeline).
    pub origin: Option<String>,
    /// Set when the post was relayed by a bridge.
    pub bridge: Option<BridgeOrigin>,
}

impl PostEvent {
    /// Whether the post was relayed by a bridge.
    pub fn is_bridged(&self) -> bool {
        self.bridge.is_some()
    }
}

/// Turns `direct` post frames into [`PostEvent`]s.
#[derive(Clone, Debug, Default)]
pub struct BridgeNormalizer {
    registry: BridgeRegistry,
}

impl BridgeNormalizer {
    /// Creates a normalizer for the given bridges.
    pub fn new(registry: BridgeRegistry) -> Self {
        Self { registry }
    }

    /// Returns the bridge registry.
    pub fn registry(&self) -> &BridgeRegistry {
        &self.registry
    }

    /// Returns the canonical post for a frame, or `None` when the frame is not
    /// a post.
    pub fn normalize(&self, packet: &Packet) -> Result<Option<PostEvent>, FrameError> {
        if packet.cmd != DIRECT_CMD {
            return Ok(None);
        }
        let ServerFrame::Post(post) = ServerFrame::classify(packet)? else {
            return Ok(None);
        };

        if !self.registry.contains(&post.sender) {
            return Ok(Some(PostEvent {
                author: post.sender,
                content: post.content,
                origin: post.post_origin,
                bridge: None,
            }));
        }

        let (author, content) = split_bridged(&post.sender, &post.content);
        Ok(Some(PostEvent {
            author,
            content,
            origin: post.post_origin,
            bridge: Some(BridgeOrigin {
                sender: post.sender,
                frame: packet.clone(),
            }),
        }))
    }
}

/// Splits bridged content into `(author, message)`.
///
/// The segment after the author has its leading whitespace trimmed and is
/// concatenated directly with the rest of the segments, which are rejoined
/// with the separator. Content without a separator yields an empty message.
pub fn split_bridged(sender: &str, content: &str) -> (String, String) {
    let mut segments: Vec<&str> = content.split(BRIDGE_SEPARATOR).collect();
    if sender == WEBHOOK_SENDER {
        segments.remove(0);
    }

    let author = segments.first().copied().unwrap_or_default().to_string();
    let message = match segments.get(1) {
        Some(first) => {
            let rest = segments[2..].join(&BRIDGE_SEPARATOR.to_string());
            format!("{}{rest}", first.trim_start())
        }
        None => String::new(),
    };
    (author, message)
}
