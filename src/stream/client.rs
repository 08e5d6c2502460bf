//! Websocket connection to the chat server.
//!
//! `ChatClient::login` spawns a task that owns the socket. The task writes the
//! handshake, keeps the connection alive, routes inbound frames through the
//! [`FrameRouter`](crate::stream::router::FrameRouter) and reports everything
//! it sees as [`ClientEvent`]s. There is no reconnect: once the socket closes
//! the connection is done.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ApiClientOptions, ApiError};
use crate::stream::bridge::{BridgeNormalizer, BridgeRegistry, PostEvent};
use crate::stream::keepalive::{liveness_frame, KeepaliveTimer, KEEPALIVE_INTERVAL};
use crate::stream::proto::{
    FrameError, Packet, Session, AUTH_ACK, DEFAULT_CLIENT_KIND, DIRECT_CMD, LOGIN_LISTENER,
};
use crate::stream::router::SharedRouter;
use crate::stream::session::HandlerError;

/// Production websocket endpoint.
pub const SERVER_ENDPOINT: &str = "wss://server.meower.org/";
/// Production REST base URL.
pub const API_BASE_URL: &str = "https://api.meower.org";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Entry point for creating chat connections.
#[derive(Clone, Debug)]
pub struct ChatClient {
    server_url: String,
    api_url: String,
    client_kind: String,
    bridges: BridgeRegistry,
    keepalive_interval: Duration,
    api_options: ApiClientOptions,
}

impl ChatClient {
    /// Creates a client for the production endpoints.
    pub fn new() -> Self {
        Self {
            server_url: SERVER_ENDPOINT.to_string(),
            api_url: API_BASE_URL.to_string(),
            client_kind: DEFAULT_CLIENT_KIND.to_string(),
            bridges: BridgeRegistry::default(),
            keepalive_interval: KEEPALIVE_INTERVAL,
            api_options: ApiClientOptions::default(),
        }
    }

    /// Overrides the websocket endpoint.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into().trim_end().to_string();
        self
    }

    /// Overrides the REST base URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end().to_string();
        self
    }

    /// Replaces the set of sender names treated as bridges.
    pub fn with_bridges(mut self, bridges: BridgeRegistry) -> Self {
        self.bridges = bridges;
        self
    }

    /// Sets the client kind announced during the handshake.
    pub fn with_client_kind(mut self, kind: impl Into<String>) -> Self {
        self.client_kind = kind.into();
        self
    }

    /// Sets the period between keepalive frames.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Sets the timeouts of the REST client handed to each connection.
    pub fn with_api_options(mut self, options: ApiClientOptions) -> Self {
        self.api_options = options;
        self
    }

    /// Returns the websocket endpoint.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Returns the REST base URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Returns the bridge registry used for new connections.
    pub fn bridges(&self) -> &BridgeRegistry {
        &self.bridges
    }

    /// Opens the websocket and sends the login handshake.
    ///
    /// Returns once both handshake frames are written. The outcome of the
    /// login arrives later as [`ClientEvent::Login`] or
    /// [`ClientEvent::AuthenticationFailed`]; a server that never answers
    /// leaves the connection pending.
    pub async fn login(
        &self,
        username: impl Into<String>,
        password: SecretString,
    ) -> Result<ChatConnection, ChatClientError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (ready_tx, ready_rx) = oneshot::channel();

        let session = SessionSlot::default();
        let api =
            ApiClient::with_options(&self.api_url, session.clone(), self.api_options.clone())?;

        let router = SharedRouter::default();
        let normalizer = BridgeNormalizer::new(self.bridges.clone());
        let posts = event_tx.clone();
        router.lock().on_command(DIRECT_CMD, move |packet| {
            if let Some(post) = normalizer.normalize(packet)? {
                let _ = posts.send(ClientEvent::Post(post));
            }
            Ok(())
        });

        let worker = ConnectionWorker {
            url: self.server_url.clone(),
            client_kind: self.client_kind.clone(),
            username: username.into(),
            password,
            keepalive_interval: self.keepalive_interval,
            router: router.clone(),
            session: session.clone(),
            state: state_tx,
            events: event_tx,
        };
        tokio::spawn(worker.run(outbound_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(ChatConnection {
                sender: FrameSender { tx: outbound_tx },
                events: event_rx,
                state: state_rx,
                session,
                router,
                api,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ChatClientError::Protocol(
                "connection task stopped before the handshake was sent".to_string(),
            )),
        }
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of one connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    /// Socket open, login not yet confirmed.
    Open,
    Authenticated,
    Closed,
}

impl ConnectionState {
    /// Whether frames can be written to the socket.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open | Self::Authenticated)
    }
}

/// Session of a connection, readable from any handle.
#[derive(Clone, Debug, Default)]
pub struct SessionSlot(Arc<RwLock<Option<Arc<Session>>>>);

impl SessionSlot {
    /// Returns the current session, if logged in.
    pub fn get(&self) -> Option<Arc<Session>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set(&self, session: Arc<Session>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub(crate) fn clear(&self) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Event produced by the connection task.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// Every inbound frame that parsed, before it is routed.
    Packet(Packet),
    /// Login confirmed; the session is also available from the connection.
    Login(Arc<Session>),
    Post(PostEvent),
    /// Frame that could not be parsed or that a subscriber rejected.
    MalformedFrame(FrameError),
    /// The server rejected the login. The connection is torn down.
    AuthenticationFailed(String),
    /// The server or the network closed the socket.
    Close,
}

enum Outbound {
    Frame(Packet),
    Close,
}

/// Cloneable sender for outbound frames.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(packet) => f.debug_tuple("Frame").field(&packet.cmd).finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

impl FrameSender {
    /// Queues a frame for the socket.
    pub fn send(&self, packet: Packet) -> Result<(), ChatClientError> {
        self.tx
            .send(Outbound::Frame(packet))
            .map_err(|_| ChatClientError::SendQueueClosed)
    }

    /// Closes the socket without emitting [`ClientEvent::Close`].
    pub fn close(&self) -> Result<(), ChatClientError> {
        self.tx
            .send(Outbound::Close)
            .map_err(|_| ChatClientError::SendQueueClosed)
    }
}

/// Handles of an open connection.
#[derive(Debug)]
pub struct ChatConnection {
    sender: FrameSender,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    session: SessionSlot,
    router: SharedRouter,
    api: ApiClient,
}

impl ChatConnection {
    /// Returns a cloneable sender for outbound frames.
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Queues a frame for the socket.
    pub fn send(&self, packet: Packet) -> Result<(), ChatClientError> {
        self.sender.send(packet)
    }

    /// Receives the next event; `None` once the connection task has ended.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel following the connection state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Current session, absent before login and after close.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.get()
    }

    /// REST client authenticated with this connection's session.
    pub fn api(&self) -> ApiClient {
        self.api.clone()
    }

    /// Waits for the next frame carrying `listener`.
    ///
    /// Register before sending the request so the response cannot be missed.
    /// The login listener id is reserved for the handshake; waiting on it, or
    /// on an id that already has a pending waiter, yields a receiver that
    /// fails immediately.
    pub fn expect_response(&self, listener: impl Into<String>) -> oneshot::Receiver<Packet> {
        let listener = listener.into();
        if listener == LOGIN_LISTENER {
            warn!(event = "reserved_listener", listener = %listener);
            let (_, rx) = oneshot::channel();
            return rx;
        }
        self.router.lock().expect_listener(listener)
    }

    /// Receives every frame with the given command.
    pub fn subscribe(&self, cmd: impl Into<String>) -> mpsc::UnboundedReceiver<Packet> {
        self.router.lock().subscribe(cmd)
    }

    /// Closes the socket. No [`ClientEvent::Close`] is emitted for it.
    pub fn close(&self) -> Result<(), ChatClientError> {
        self.sender.close()
    }
}

/// Errors produced by the connection and the event loop.
#[derive(Debug, Error)]
pub enum ChatClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    /// Outbound queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected the login.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// An event callback returned an error.
    #[error("event callback failed: {0}")]
    Handler(HandlerError),

    #[error("event callback panicked: {0}")]
    HandlerPanicked(String),
}

/// Result of matching a login response.
#[derive(Debug)]
pub(crate) enum Handshake {
    Authenticated(Session),
    /// Status acknowledgement; the real response is still to come.
    Acknowledged,
    Rejected(String),
}

/// Matches the frame answering the login listener.
///
/// A payload with a `mode` key is a successful login, the bare
/// [`AUTH_ACK`] string is ignored, anything else is a rejection.
pub(crate) fn evaluate_handshake(packet: &Packet) -> Handshake {
    if packet.val.get("mode").is_some() {
        let Some(payload) = packet.val.get("payload") else {
            return Handshake::Rejected("login response without payload".to_string());
        };
        return match Session::from_payload(payload) {
            Ok(session) => Handshake::Authenticated(session),
            Err(err) => Handshake::Rejected(format!("invalid session payload: {err}")),
        };
    }
    if packet.val.as_str() == Some(AUTH_ACK) {
        return Handshake::Acknowledged;
    }
    Handshake::Rejected(packet.val.to_string())
}

enum SessionEnd {
    /// Socket closed by the server or the network.
    TransportClosed,
    ClosedByHost,
    AuthenticationFailed,
}

struct ConnectionWorker {
    url: String,
    client_kind: String,
    username: String,
    password: SecretString,
    keepalive_interval: Duration,
    router: SharedRouter,
    session: SessionSlot,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ConnectionWorker {
    async fn run(
        self,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        ready_tx: oneshot::Sender<Result<(), ChatClientError>>,
    ) {
        let mut socket = match connect_async(self.url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(err) => {
                self.state.send_replace(ConnectionState::Closed);
                let _ = ready_tx.send(Err(err.into()));
                return;
            }
        };
        self.state.send_replace(ConnectionState::Open);

        let mut login = Some(self.router.lock().expect_listener(LOGIN_LISTENER));
        let handshake = [
            Packet::client_type(&self.client_kind),
            Packet::authenticate(&self.username, &self.password),
        ];
        for packet in &handshake {
            if let Err(err) = send_packet(&mut socket, packet).await {
                self.state.send_replace(ConnectionState::Closed);
                let _ = ready_tx.send(Err(err));
                return;
            }
        }
        let _ = ready_tx.send(Ok(()));

        let end = self.drive(&mut socket, &mut outbound_rx, &mut login).await;

        self.session.clear();
        self.state.send_replace(ConnectionState::Closed);
        self.router.lock().clear();
        match end {
            SessionEnd::TransportClosed => {
                info!(event = "connection_closed", url = %self.url);
                let _ = self.events.send(ClientEvent::Close);
            }
            SessionEnd::ClosedByHost => debug!(event = "connection_closed_by_host"),
            SessionEnd::AuthenticationFailed => {}
        }
    }

    async fn drive(
        &self,
        socket: &mut Socket,
        outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
        login: &mut Option<oneshot::Receiver<Packet>>,
    ) -> SessionEnd {
        let mut keepalive = KeepaliveTimer::new(self.keepalive_interval);

        loop {
            tokio::select! {
                maybe_outbound = outbound_rx.recv() => {
                    match maybe_outbound {
                        Some(Outbound::Frame(packet)) => {
                            if send_packet(socket, &packet).await.is_err() {
                                return SessionEnd::TransportClosed;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            let _ = socket.close(None).await;
                            return SessionEnd::ClosedByHost;
                        }
                    }
                }
                maybe_inbound = socket.next() => {
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(text.as_str());
                            if let Some(end) = self.poll_login(login) {
                                let _ = socket.close(None).await;
                                return end;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                return SessionEnd::TransportClosed;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let err = FrameError::Malformed("binary frame".to_string());
                            warn!(event = "malformed_frame", error = %err);
                            let _ = self.events.send(ClientEvent::MalformedFrame(err));
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            return SessionEnd::TransportClosed;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                _ = keepalive.tick() => {
                    let state = *self.state.borrow();
                    if let Some(ping) = liveness_frame(state) {
                        if send_packet(socket, &ping).await.is_err() {
                            return SessionEnd::TransportClosed;
                        }
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let packet = match Packet::from_text(text) {
            Ok(packet) => packet,
            Err(err) => {
                let err = FrameError::Malformed(err.to_string());
                warn!(event = "malformed_frame", error = %err, frame = %text);
                let _ = self.events.send(ClientEvent::MalformedFrame(err));
                return;
            }
        };

        if !packet.is_login_frame() {
            debug!(event = "frame_received", frame = %text);
        }
        let _ = self.events.send(ClientEvent::Packet(packet.clone()));

        let dispatch = self.router.lock().dispatch(&packet);
        for err in dispatch.errors {
            let _ = self.events.send(ClientEvent::MalformedFrame(err));
        }
    }

    /// Applies the login response once the router has delivered it.
    fn poll_login(&self, login: &mut Option<oneshot::Receiver<Packet>>) -> Option<SessionEnd> {
        let waiter = login.as_mut()?;
        let packet = match waiter.try_recv() {
            Ok(packet) => packet,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => {
                *login = None;
                return None;
            }
        };

        match evaluate_handshake(&packet) {
            Handshake::Authenticated(session) => {
                let session = Arc::new(session);
                self.session.set(Arc::clone(&session));
                self.state.send_replace(ConnectionState::Authenticated);
                info!(event = "logged_in", username = %session.username);
                let _ = self.events.send(ClientEvent::Login(session));
                *login = None;
                None
            }
            Handshake::Acknowledged => {
                debug!(event = "login_acknowledged");
                *login = Some(self.router.lock().expect_listener(LOGIN_LISTENER));
                None
            }
            Handshake::Rejected(reason) => {
                error!(event = "login_failed", reason = %reason);
                let _ = self.events.send(ClientEvent::AuthenticationFailed(reason));
                *login = None;
                Some(SessionEnd::AuthenticationFailed)
            }
        }
    }
}

async fn send_packet(socket: &mut Socket, packet: &Packet) -> Result<(), ChatClientError> {
    let text = packet.to_text()?;
    if !packet.is_login_frame() {
        debug!(event = "frame_sent", frame = %text);
    }
    socket.send(Message::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        evaluate_handshake, ChatClient, ConnectionState, Handshake, API_BASE_URL, SERVER_ENDPOINT,
    };
    use crate::stream::proto::{Packet, AUTH_ACK, LOGIN_LISTENER};

    fn login_response(val: serde_json::Value) -> Packet {
        Packet::direct(val).with_listener(LOGIN_LISTENER)
    }

    #[test]
    fn client_uses_production_endpoints_by_default() {
        let client = ChatClient::new();
        assert_eq!(client.server_url(), SERVER_ENDPOINT);
        assert_eq!(client.api_url(), API_BASE_URL);
        assert!(client.bridges().contains("Discord"));
    }

    #[test]
    fn endpoint_overrides_are_trimmed() {
        let client = ChatClient::new()
            .with_server_url("ws://127.0.0.1:3000/  \n")
            .with_api_url("http://127.0.0.1:3001 ");
        assert_eq!(client.server_url(), "ws://127.0.0.1:3000/");
        assert_eq!(client.api_url(), "http://127.0.0.1:3001");
    }

    #[test]
    fn handshake_with_mode_is_authenticated() {
        let packet = login_response(json!({
            "mode": "auth",
            "payload": {"username": "alice", "token": "t0k", "account": {"_id": "alice"}},
        }));

        match evaluate_handshake(&packet) {
            Handshake::Authenticated(session) => {
                assert_eq!(session.username, "alice");
                assert_eq!(session.account.id, "alice");
            }
            other => panic!("unexpected handshake outcome: {other:?}"),
        }
    }

    #[test]
    fn handshake_ack_is_benign() {
        let packet = login_response(json!(AUTH_ACK));
        assert!(matches!(evaluate_handshake(&packet), Handshake::Acknowledged));
    }

    #[test]
    fn handshake_with_other_shape_is_rejected() {
        for val in [json!("E:103 | ID not found"), json!({"code": 401}), json!(null)] {
            let packet = login_response(val);
            assert!(matches!(evaluate_handshake(&packet), Handshake::Rejected(_)));
        }
    }

    #[test]
    fn handshake_with_odd_account_fields_is_authenticated() {
        let packet = login_response(json!({
            "mode": "auth",
            "payload": {
                "username": "alice",
                "token": "t0k",
                "account": {"_id": "alice", "quote": null, "experiments": 1.5},
            },
        }));

        match evaluate_handshake(&packet) {
            Handshake::Authenticated(session) => assert_eq!(session.account.id, "alice"),
            other => panic!("unexpected handshake outcome: {other:?}"),
        }
    }

    #[test]
    fn handshake_with_unusable_payload_is_rejected() {
        let packet = login_response(json!({"mode": "auth"}));
        assert!(matches!(evaluate_handshake(&packet), Handshake::Rejected(_)));

        let packet = login_response(json!({"mode": "auth", "payload": {"username": "alice"}}));
        assert!(matches!(evaluate_handshake(&packet), Handshake::Rejected(_)));
    }

    #[test]
    fn open_states_allow_writes() {
        assert!(ConnectionState::Open.is_open());
        assert!(ConnectionState::Authenticated.is_open());
        assert!(!ConnectionState::Connecting.is_open());
        assert!(!ConnectionState::Closed.is_open());
    }
}
