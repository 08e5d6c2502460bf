use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Command carrying chat posts and client control messages.
pub const DIRECT_CMD: &str = "direct";
/// Command used for keepalive frames.
pub const PING_CMD: &str = "ping";
/// Correlation id attached to the password authentication frame.
pub const LOGIN_LISTENER: &str = "mb.rs-login";
/// Status string the server may answer a login with before the real response.
pub const AUTH_ACK: &str = "I:100 | OK";
/// Client kind announced in the first handshake frame.
pub const DEFAULT_CLIENT_KIND: &str = "js";

/// One frame on the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    pub cmd: String,
    #[serde(default)]
    pub val: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,
}

impl Packet {
    /// Creates a frame without a listener id.
    pub fn new(cmd: impl Into<String>, val: Value) -> Self {
        Self {
            cmd: cmd.into(),
            val,
            listener: None,
        }
    }

    /// Attaches a correlation id so the response can be awaited on the router.
    pub fn with_listener(mut self, listener: impl Into<String>) -> Self {
        self.listener = Some(listener.into());
        self
    }

    /// Creates a `direct` frame.
    pub fn direct(val: Value) -> Self {
        Self::new(DIRECT_CMD, val)
    }

    /// First handshake frame, announcing the client kind.
    pub fn client_type(kind: &str) -> Self {
        Self::direct(json!({ "cmd": "type", "val": kind }))
    }

    /// Second handshake frame, correlated by [`LOGIN_LISTENER`].
    pub fn authenticate(username: &str, password: &SecretString) -> Self {
        Self::direct(json!({
            "cmd": "authpswd",
            "val": {
                "username": username,
                "pswd": password.expose_secret(),
            }
        }))
        .with_listener(LOGIN_LISTENER)
    }

    /// Keepalive frame, `{"cmd":"ping","val":""}`.
    pub fn ping() -> Self {
        Self::new(PING_CMD, Value::String(String::new()))
    }

    /// Frames correlated with the login carry credentials or the session
    /// token and are kept out of the logs.
    pub fn is_login_frame(&self) -> bool {
        self.listener.as_deref() == Some(LOGIN_LISTENER)
    }

    /// Parses a text frame.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encodes the frame as JSON text.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound frame that could not be parsed or handled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("subscriber for `{cmd}` failed: {reason}")]
    Subscriber { cmd: String, reason: String },
}

/// Chat post as carried in the payload of a `direct` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostPayload {
    #[serde(rename = "type")]
    pub kind: Value,
    #[serde(rename = "u")]
    pub sender: String,
    #[serde(rename = "p")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_origin: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed view of an inbound [`Packet`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// `direct` frame whose payload has a `type` key.
    Post(PostPayload),
    /// Any other `direct` payload.
    Direct(Value),
    Ping(Value),
    /// Command this client has no typed shape for.
    Unrecognized(Packet),
}

impl ServerFrame {
    /// Classifies a packet by command and payload shape.
    ///
    /// Only the presence of `type` decides whether a `direct` payload is a
    /// post; its value is never inspected. A post payload without string
    /// `u`/`p` fields is rejected as malformed.
    pub fn classify(packet: &Packet) -> Result<Self, FrameError> {
        match packet.cmd.as_str() {
            DIRECT_CMD => {
                let is_post = packet
                    .val
                    .as_object()
                    .is_some_and(|payload| payload.contains_key("type"));
                if !is_post {
                    return Ok(Self::Direct(packet.val.clone()));
                }
                serde_json::from_value(packet.val.clone())
                    .map(Self::Post)
                    .map_err(|err| FrameError::Malformed(format!("direct post payload: {err}")))
            }
            PING_CMD => Ok(Self::Ping(packet.val.clone())),
            _ => Ok(Self::Unrecognized(packet.clone())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BanState {
    #[serde(deserialize_with = "lenient")]
    pub expires: i64,
    #[serde(deserialize_with = "lenient")]
    pub reason: String,
    #[serde(deserialize_with = "lenient")]
    pub restrictions: i64,
    #[serde(deserialize_with = "lenient")]
    pub state: String,
}

/// Account snapshot returned by a successful login.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Account {
    #[serde(rename = "_id", deserialize_with = "lenient")]
    pub id: String,
    #[serde(deserialize_with = "lenient")]
    pub active_dms: Vec<Value>,
    #[serde(deserialize_with = "lenient")]
    pub avatar: String,
    #[serde(deserialize_with = "lenient")]
    pub avatar_color: String,
    #[serde(deserialize_with = "lenient")]
    pub ban: BanState,
    #[serde(deserialize_with = "lenient")]
    pub banned: bool,
    #[serde(deserialize_with = "lenient")]
    pub bgm: bool,
    #[serde(deserialize_with = "lenient")]
    pub bgm_song: i64,
    #[serde(deserialize_with = "lenient")]
    pub created: i64,
    #[serde(deserialize_with = "lenient")]
    pub debug: bool,
    #[serde(deserialize_with = "lenient")]
    pub experiments: i64,
    #[serde(deserialize_with = "lenient")]
    pub favorited_chats: Vec<Value>,
    #[serde(deserialize_with = "lenient")]
    pub flags: i64,
    #[serde(deserialize_with = "lenient")]
    pub hide_blocked_users: bool,
    #[serde(deserialize_with = "lenient")]
    pub last_seen: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    pub layout: String,
    #[serde(deserialize_with = "lenient")]
    pub lower_username: String,
    #[serde(deserialize_with = "lenient")]
    pub lvl: i64,
    #[serde(deserialize_with = "lenient")]
    pub permissions: i64,
    #[serde(deserialize_with = "lenient")]
    pub pfp_data: i64,
    #[serde(deserialize_with = "lenient")]
    pub quote: String,
    #[serde(deserialize_with = "lenient")]
    pub sfx: bool,
    #[serde(deserialize_with = "lenient")]
    pub theme: String,
    #[serde(deserialize_with = "lenient")]
    pub unread_inbox: bool,
    #[serde(deserialize_with = "lenient")]
    pub uuid: String,
}

/// Deserializes a snapshot field, falling back to its default when the
/// server sends `null` or a value of another type.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Only `username` and `token` are required; the account snapshot is
/// informational and never fails a login.
#[derive(Deserialize)]
struct SessionPayload {
    username: String,
    token: String,
    #[serde(default, deserialize_with = "lenient")]
    account: Account,
    #[serde(default, deserialize_with = "lenient")]
    relationships: Vec<Value>,
}

/// Authenticated session of one connection.
#[derive(Debug)]
pub struct Session {
    pub username: String,
    pub account: Account,
    pub relationships: Vec<Value>,
    token: SecretString,
}

impl Session {
    /// Builds a session from the `payload` of a successful login response.
    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        let parsed = SessionPayload::deserialize(payload)?;
        Ok(Self {
            username: parsed.username,
            account: parsed.account,
            relationships: parsed.relationships,
            token: SecretString::new(parsed.token),
        })
    }

    /// Token sent in the `token` header of REST calls.
    pub fn token(&self) -> &SecretString {
        &self.token
    }
}
