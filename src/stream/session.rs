//! Callback registration on top of a chat connection.
//!
//! `ChatSession` owns a [`ChatConnection`] and runs the callbacks registered
//! for each event. Callbacks for one event run in registration order on a
//! task of their own, so a slow callback does not hold back later events.
//! `run` supervises those tasks: the first callback error or panic, or a
//! rejected login, ends it with an error and closes the connection.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use secrecy::SecretString;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error};

use crate::api::ApiClient;
use crate::stream::bridge::PostEvent;
use crate::stream::client::{ChatClient, ChatClientError, ChatConnection, ClientEvent, FrameSender};
use crate::stream::proto::{Packet, Session};

/// Error returned by an event callback.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
/// Result returned by an event callback.
pub type HandlerResult = Result<(), HandlerError>;

type Callback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

fn callback<T, F, Fut>(f: F) -> Callback<T>
where
    T: 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |value| f(value).boxed())
}

#[derive(Default)]
struct Handlers {
    post: Vec<Callback<PostEvent>>,
    login: Vec<Callback<Arc<Session>>>,
    close: Vec<Callback<()>>,
    packet: Vec<Callback<Packet>>,
    command: Vec<(String, Callback<Packet>)>,
}

impl Handlers {
    fn dispatch(&self, event: ClientEvent, tasks: &mut JoinSet<HandlerResult>) {
        match event {
            ClientEvent::Post(post) => spawn_in_order(tasks, self.post.clone(), post),
            ClientEvent::Login(session) => spawn_in_order(tasks, self.login.clone(), session),
            ClientEvent::Close => spawn_in_order(tasks, self.close.clone(), ()),
            ClientEvent::Packet(packet) => {
                let matching = self
                    .command
                    .iter()
                    .filter(|(cmd, _)| *cmd == packet.cmd)
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect();
                spawn_in_order(tasks, matching, packet.clone());
                spawn_in_order(tasks, self.packet.clone(), packet);
            }
            ClientEvent::MalformedFrame(err) => {
                debug!(event = "malformed_frame_skipped", error = %err);
            }
            ClientEvent::AuthenticationFailed(_) => {}
        }
    }
}

fn spawn_in_order<T>(tasks: &mut JoinSet<HandlerResult>, callbacks: Vec<Callback<T>>, value: T)
where
    T: Clone + Send + 'static,
{
    if callbacks.is_empty() {
        return;
    }
    tasks.spawn(async move {
        for callback in callbacks {
            callback(value.clone()).await?;
        }
        HandlerResult::Ok(())
    });
}

fn check_joined(joined: Result<HandlerResult, JoinError>) -> Result<(), ChatClientError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            error!(event = "callback_failed", error = %err);
            Err(ChatClientError::Handler(err))
        }
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => {
            error!(event = "callback_panicked", error = %err);
            Err(ChatClientError::HandlerPanicked(err.to_string()))
        }
    }
}

/// Chat connection with typed callback registration.
pub struct ChatSession {
    connection: ChatConnection,
    handlers: Handlers,
}

impl ChatSession {
    /// Logs in and wraps the new connection.
    pub async fn login(
        client: &ChatClient,
        username: impl Into<String>,
        password: SecretString,
    ) -> Result<Self, ChatClientError> {
        let connection = client.login(username, password).await?;
        Ok(Self::from_connection(connection))
    }

    /// Wraps an existing connection.
    pub fn from_connection(connection: ChatConnection) -> Self {
        Self {
            connection,
            handlers: Handlers::default(),
        }
    }

    /// Returns the wrapped connection.
    pub fn connection(&self) -> &ChatConnection {
        &self.connection
    }

    /// Sender that callbacks can capture to write frames.
    pub fn sender(&self) -> FrameSender {
        self.connection.sender()
    }

    /// REST client that callbacks can capture to publish posts.
    pub fn api(&self) -> ApiClient {
        self.connection.api()
    }

    /// Runs `callback` for every post, bridged or native.
    pub fn on_post<F, Fut>(&mut self, callback_fn: F) -> &mut Self
    where
        F: Fn(PostEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.post.push(callback(callback_fn));
        self
    }

    /// Runs `callback` once the server accepts the login.
    pub fn on_login<F, Fut>(&mut self, callback_fn: F) -> &mut Self
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.login.push(callback(callback_fn));
        self
    }

    /// Runs `callback` when the server or the network closes the socket.
    pub fn on_close<F, Fut>(&mut self, callback_fn: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.close.push(callback(move |()| callback_fn()));
        self
    }

    /// Runs `callback` for every inbound frame.
    pub fn on_packet<F, Fut>(&mut self, callback_fn: F) -> &mut Self
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.packet.push(callback(callback_fn));
        self
    }

    /// Runs `callback` for every inbound frame with the given command.
    pub fn on_command<F, Fut>(&mut self, cmd: impl Into<String>, callback_fn: F) -> &mut Self
    where
        F: Fn(Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.command.push((cmd.into(), callback(callback_fn)));
        self
    }

    /// Dispatches events until the connection ends.
    ///
    /// Returns `Ok(())` after the connection closes and every running callback
    /// has finished.
    pub async fn run(self) -> Result<(), ChatClientError> {
        let Self {
            mut connection,
            handlers,
        } = self;
        let mut tasks = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                maybe_event = connection.recv() => {
                    let Some(event) = maybe_event else {
                        break Ok(());
                    };
                    if let ClientEvent::AuthenticationFailed(reason) = event {
                        break Err(ChatClientError::Authentication(reason));
                    }
                    handlers.dispatch(event, &mut tasks);
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(err) = check_joined(joined) {
                        break Err(err);
                    }
                }
            }
        };

        if let Err(err) = outcome {
            let _ = connection.close();
            return Err(err);
        }
        while let Some(joined) = tasks.join_next().await {
            check_joined(joined)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::task::JoinSet;

    use super::{callback, spawn_in_order, HandlerError, HandlerResult, Handlers};
    use crate::stream::bridge::PostEvent;
    use crate::stream::client::ClientEvent;
    use crate::stream::proto::Packet;

    fn post(author: &str) -> PostEvent {
        PostEvent {
            author: author.to_string(),
            content: "hi".to_string(),
            origin: Some("home".to_string()),
            bridge: None,
        }
    }

    async fn drain(tasks: &mut JoinSet<HandlerResult>) -> Vec<HandlerResult> {
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.expect("task joined"));
        }
        results
    }

    #[tokio::test]
    async fn callbacks_for_one_event_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = JoinSet::new();

        let callbacks = (0..3)
            .map(|index| {
                let seen = Arc::clone(&seen);
                callback(move |post: PostEvent| {
                    let seen = Arc::clone(&seen);
                    async move {
                        tokio::time::sleep(Duration::from_millis(5 * (3 - index))).await;
                        seen.lock().unwrap().push(format!("{index}-{}", post.author));
                        Ok::<_, HandlerError>(())
                    }
                })
            })
            .collect();
        spawn_in_order(&mut tasks, callbacks, post("alice"));

        assert!(drain(&mut tasks).await.iter().all(Result::is_ok));
        assert_eq!(*seen.lock().unwrap(), vec!["0-alice", "1-alice", "2-alice"]);
    }

    #[tokio::test]
    async fn suspended_callback_does_not_block_next_event() {
        let gate = Arc::new(Notify::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = Handlers::default();

        let (wait, log) = (Arc::clone(&gate), Arc::clone(&seen));
        handlers.post.push(callback(move |post: PostEvent| {
            let (wait, log) = (Arc::clone(&wait), Arc::clone(&log));
            async move {
                if post.author == "first" {
                    wait.notified().await;
                }
                log.lock().unwrap().push(post.author);
                Ok::<_, HandlerError>(())
            }
        }));

        let mut tasks = JoinSet::new();
        handlers.dispatch(ClientEvent::Post(post("first")), &mut tasks);
        handlers.dispatch(ClientEvent::Post(post("second")), &mut tasks);

        tasks
            .join_next()
            .await
            .expect("one task finished")
            .expect("joined")
            .expect("callback ok");
        assert_eq!(*seen.lock().unwrap(), vec!["second"]);

        gate.notify_one();
        drain(&mut tasks).await;
        assert_eq!(*seen.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn command_callbacks_only_see_their_command() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = Handlers::default();

        let log = Arc::clone(&seen);
        handlers.command.push((
            "ulist".to_string(),
            callback(move |packet: Packet| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(packet.cmd);
                    Ok::<_, HandlerError>(())
                }
            }),
        ));

        let mut tasks = JoinSet::new();
        handlers.dispatch(ClientEvent::Packet(Packet::new("ulist", json!("a;"))), &mut tasks);
        handlers.dispatch(ClientEvent::Packet(Packet::ping()), &mut tasks);
        drain(&mut tasks).await;

        assert_eq!(*seen.lock().unwrap(), vec!["ulist"]);
    }

    #[tokio::test]
    async fn failing_callback_stops_later_callbacks_for_that_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let callbacks = vec![
            callback(|_: PostEvent| async { HandlerResult::Err("boom".into()) }),
            callback(move |post: PostEvent| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(post.author);
                    Ok::<_, HandlerError>(())
                }
            }),
        ];

        let mut tasks = JoinSet::new();
        spawn_in_order(&mut tasks, callbacks, post("alice"));
        let results = drain(&mut tasks).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
        assert!(seen.lock().unwrap().is_empty());
    }
}
