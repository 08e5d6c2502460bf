//! Inbound frame routing.
//!
//! Every frame is dispatched twice: once to the one-shot waiter registered
//! for its `listener` id (when present), then to the ordered subscribers of
//! its `cmd`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::stream::proto::{FrameError, Packet};

type ListenerWaiter = Box<dyn FnOnce(Packet) + Send>;
type CommandHandler = Box<dyn FnMut(&Packet) -> Result<(), FrameError> + Send>;

enum Subscriber {
    Handler(CommandHandler),
    Channel(mpsc::UnboundedSender<Packet>),
}

/// Outcome of dispatching one frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// A listener waiter consumed the frame.
    pub listener_fired: bool,
    /// Number of command subscribers that received the frame.
    pub delivered: usize,
    /// Failures reported by command subscribers.
    pub errors: Vec<FrameError>,
}

/// Listener and command registries for one connection.
#[derive(Default)]
pub struct FrameRouter {
    listeners: HashMap<String, ListenerWaiter>,
    commands: HashMap<String, Vec<Subscriber>>,
}

impl FrameRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a one-shot waiter for `listener`.
    ///
    /// A waiter already pending for the same id is kept and `waiter` is
    /// dropped; returns whether `waiter` was registered.
    pub fn on_listener<F>(&mut self, listener: impl Into<String>, waiter: F) -> bool
    where
        F: FnOnce(Packet) + Send + 'static,
    {
        match self.listeners.entry(listener.into()) {
            Entry::Occupied(entry) => {
                warn!(event = "listener_already_pending", listener = %entry.key());
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(Box::new(waiter));
                true
            }
        }
    }

    /// Returns a receiver resolved by the next frame carrying `listener`.
    ///
    /// The receiver fails immediately when a waiter for `listener` is
    /// already pending.
    pub fn expect_listener(&mut self, listener: impl Into<String>) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.on_listener(listener, move |packet| {
            let _ = tx.send(packet);
        });
        rx
    }

    /// Appends a callback to the subscribers of `cmd`.
    pub fn on_command<F>(&mut self, cmd: impl Into<String>, handler: F)
    where
        F: FnMut(&Packet) -> Result<(), FrameError> + Send + 'static,
    {
        self.commands
            .entry(cmd.into())
            .or_default()
            .push(Subscriber::Handler(Box::new(handler)));
    }

    /// Appends a channel subscriber for `cmd`; it is dropped once the
    /// receiver goes away.
    pub fn subscribe(&mut self, cmd: impl Into<String>) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .entry(cmd.into())
            .or_default()
            .push(Subscriber::Channel(tx));
        rx
    }

    /// Parses a text frame and dispatches it.
    pub fn route_text(&mut self, text: &str) -> Result<(Packet, Dispatch), FrameError> {
        let packet =
            Packet::from_text(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
        let dispatch = self.dispatch(&packet);
        Ok((packet, dispatch))
    }

    /// Dispatches a frame to its listener waiter, then to its command
    /// subscribers in registration order.
    pub fn dispatch(&mut self, packet: &Packet) -> Dispatch {
        let mut dispatch = Dispatch::default();

        if let Some(listener) = packet.listener.as_deref() {
            if let Some(waiter) = self.listeners.remove(listener) {
                waiter(packet.clone());
                dispatch.listener_fired = true;
            }
        }

        let Some(subscribers) = self.commands.get_mut(&packet.cmd) else {
            return dispatch;
        };

        subscribers.retain_mut(|subscriber| match subscriber {
            Subscriber::Handler(handler) => {
                dispatch.delivered += 1;
                if let Err(err) = handler(packet) {
                    warn!(event = "subscriber_failed", cmd = %packet.cmd, error = %err);
                    dispatch.errors.push(err);
                }
                true
            }
            Subscriber::Channel(tx) => {
                let alive = tx.send(packet.clone()).is_ok();
                if alive {
                    dispatch.delivered += 1;
                }
                alive
            }
        });

        dispatch
    }

    /// Whether a waiter is pending for `listener`.
    pub fn has_listener(&self, listener: &str) -> bool {
        self.listeners.contains_key(listener)
    }

    /// Drops every waiter and subscriber, closing their channels.
    pub fn clear(&mut self) {
        self.listeners.clear();
        self.commands.clear();
    }
}

/// Router shared between the connection task and connection handles.
#[derive(Clone, Default)]
pub struct SharedRouter(Arc<Mutex<FrameRouter>>);

impl SharedRouter {
    /// Wraps a router for sharing.
    pub fn new(router: FrameRouter) -> Self {
        Self(Arc::new(Mutex::new(router)))
    }

    /// Locks the router.
    ///
    /// Subscriber callbacks run under this lock and must not call back into
    /// the router.
    pub fn lock(&self) -> MutexGuard<'_, FrameRouter> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SharedRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRouter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::{Dispatch, FrameRouter, SharedRouter};
    use crate::stream::proto::{FrameError, Packet};

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn listener_fires_once_before_command() {
        let seen = recorder();
        let mut router = FrameRouter::new();

        let log = Arc::clone(&seen);
        router.on_listener("req-1", move |packet| {
            log.lock().unwrap().push(format!("listener-{}", packet.cmd));
        });
        let log = Arc::clone(&seen);
        router.on_command("direct", move |packet| {
            log.lock().unwrap().push(format!("command-{}", packet.cmd));
            Ok(())
        });

        let packet = Packet::direct(json!("pong")).with_listener("req-1");
        let first = router.dispatch(&packet);
        let second = router.dispatch(&packet);

        assert!(first.listener_fired);
        assert!(!second.listener_fired);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "listener-direct".to_string(),
                "command-direct".to_string(),
                "command-direct".to_string(),
            ]
        );
    }

    #[test]
    fn command_subscribers_run_in_registration_order() {
        let seen = recorder();
        let mut router = FrameRouter::new();
        for name in ["first", "second", "third"] {
            let log = Arc::clone(&seen);
            router.on_command("ulist", move |_| {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            });
        }

        let dispatch = router.dispatch(&Packet::new("ulist", json!("")));
        assert_eq!(dispatch.delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn frames_without_subscribers_are_dropped_quietly() {
        let mut router = FrameRouter::new();
        let dispatch = router.dispatch(&Packet::new("statuscode", json!("I:100 | OK")));
        assert_eq!(dispatch, Dispatch::default());
    }

    #[tokio::test]
    async fn expect_listener_resolves_with_full_packet() {
        let mut router = FrameRouter::new();
        let waiter = router.expect_listener("req-2");
        assert!(router.has_listener("req-2"));

        let packet =
            Packet::new("statuscode", json!({"code": "I:100 | OK"})).with_listener("req-2");
        router.dispatch(&packet);

        assert_eq!(waiter.await.expect("waiter resolved"), packet);
        assert!(!router.has_listener("req-2"));
    }

    #[tokio::test]
    async fn pending_listener_is_not_replaced() {
        let mut router = FrameRouter::new();
        let first = router.expect_listener("req-4");
        let second = router.expect_listener("req-4");

        assert!(second.await.is_err());
        let packet = Packet::direct(json!("done")).with_listener("req-4");
        assert!(router.dispatch(&packet).listener_fired);
        assert_eq!(first.await.expect("first waiter resolved"), packet);

        assert!(router.on_listener("req-4", |_| {}));
    }

    #[tokio::test]
    async fn channel_subscribers_are_pruned_when_dropped() {
        let mut router = FrameRouter::new();
        let mut kept = router.subscribe("direct");
        let dropped = router.subscribe("direct");
        drop(dropped);

        let packet = Packet::direct(json!({"cmd": "x"}));
        let dispatch = router.dispatch(&packet);

        assert_eq!(dispatch.delivered, 1);
        assert_eq!(kept.recv().await, Some(packet));
    }

    #[test]
    fn subscriber_errors_are_collected_without_stopping_dispatch() {
        let seen = recorder();
        let mut router = FrameRouter::new();
        router.on_command("direct", |packet| {
            Err(FrameError::Subscriber {
                cmd: packet.cmd.clone(),
                reason: "boom".to_string(),
            })
        });
        let log = Arc::clone(&seen);
        router.on_command("direct", move |_| {
            log.lock().unwrap().push("after".to_string());
            Ok(())
        });

        let dispatch = router.dispatch(&Packet::direct(json!(null)));
        assert_eq!(dispatch.errors.len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["after"]);
    }

    #[tokio::test]
    async fn clear_closes_waiters_and_subscriptions() {
        let mut router = FrameRouter::new();
        let waiter = router.expect_listener("req-3");
        let mut updates = router.subscribe("direct");

        router.clear();

        assert!(waiter.await.is_err());
        assert_eq!(updates.recv().await, None);
    }

    #[test]
    fn malformed_text_is_reported_and_router_keeps_working() {
        let shared = SharedRouter::default();
        let mut updates = shared.lock().subscribe("ping");

        let err = shared.lock().route_text("{not json").expect_err("malformed");
        assert!(matches!(err, FrameError::Malformed(_)));

        let (packet, dispatch) = shared
            .lock()
            .route_text(r#"{"cmd":"ping","val":""}"#)
            .expect("valid frame");
        assert_eq!(dispatch.delivered, 1);
        assert_eq!(updates.try_recv().expect("delivered"), packet);
    }
}
