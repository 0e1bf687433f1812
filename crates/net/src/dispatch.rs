//! Event callbacks, run off the network path
//!
//! Engines call [`EventDispatcher::emit`] from their I/O tasks. Emitting only
//! enqueues; a dedicated worker task drains the queue and runs each
//! emission's callbacks on the blocking pool, in subscription order. A slow
//! callback delays later callbacks, never a connection's reads or writes.
//! A panicking callback is logged and its siblings still run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::error::Error;
use crate::message::Message;
use crate::state::StateTransition;

/// Events surfaced to application code
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection reached CONNECTED for the first time
    Connect { client_id: String },
    /// A connection was closed (manually, or server-side for any reason)
    Disconnect { client_id: String },
    /// The client re-established a broken link
    Reconnect { client_id: String },
    /// An application message arrived.
    ///
    /// `origin` is the sending session's client id on the server side and
    /// `None` on the client side.
    Message {
        origin: Option<String>,
        message: Message,
    },
    /// The server announced it is shutting down
    ServerShutdown,
    /// A state transition. `client_id` names the server session it belongs
    /// to, `None` for an engine's own state.
    StateChange {
        client_id: Option<String>,
        transition: StateTransition,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connect { .. } => EventKind::Connect,
            Event::Disconnect { .. } => EventKind::Disconnect,
            Event::Reconnect { .. } => EventKind::Reconnect,
            Event::Message { .. } => EventKind::Message,
            Event::ServerShutdown => EventKind::ServerShutdown,
            Event::StateChange { .. } => EventKind::StateChange,
        }
    }
}

/// Subscription buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Reconnect,
    Message,
    ServerShutdown,
    StateChange,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Reconnect => "reconnect",
            EventKind::Message => "message",
            EventKind::ServerShutdown => "servershutdown",
            EventKind::StateChange => "statechange",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match normalize(s).as_str() {
            "connect" => Ok(EventKind::Connect),
            "disconnect" => Ok(EventKind::Disconnect),
            "reconnect" => Ok(EventKind::Reconnect),
            "message" => Ok(EventKind::Message),
            "servershutdown" => Ok(EventKind::ServerShutdown),
            "statechange" => Ok(EventKind::StateChange),
            _ => Err(Error::UnknownEvent(s.to_string())),
        }
    }
}

/// `On_Server-Shutdown` -> `servershutdown`
pub fn normalize(name: &str) -> String {
    let lowered: String = name
        .to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect();
    match lowered.strip_prefix("on") {
        Some(rest) => rest.to_string(),
        None => lowered,
    }
}

/// Subscribed callback
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

enum Job {
    Invoke {
        event: Event,
        callbacks: Vec<Callback>,
    },
    Flush(oneshot::Sender<()>),
}

struct Inner {
    bindings: RwLock<HashMap<EventKind, Vec<Callback>>>,
    queue: mpsc::UnboundedSender<Job>,
}

/// Registry of callbacks plus the queue that runs them.
///
/// Cheap to clone; clones share bindings and queue. The worker exits once
/// every clone is dropped and the queue is drained.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl EventDispatcher {
    /// Create a dispatcher and spawn its worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(rx));

        Self {
            inner: Arc::new(Inner {
                bindings: RwLock::new(HashMap::new()),
                queue,
            }),
        }
    }

    /// Subscribe by event name (`connect`, `on_message`, `StateChange`, ...)
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Result<(), Error>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let kind: EventKind = event.parse()?;
        self.on(kind, callback);
        Ok(())
    }

    /// Subscribe to an event kind
    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut bindings = self
            .inner
            .bindings
            .write()
            .unwrap_or_else(|e| e.into_inner());
        bindings.entry(kind).or_default().push(Arc::new(callback));
    }

    /// Queue `event` for every callback subscribed right now. Never blocks.
    pub fn emit(&self, event: Event) {
        let callbacks = self
            .inner
            .bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        if callbacks.is_empty() {
            return;
        }

        if self.inner.queue.send(Job::Invoke { event, callbacks }).is_err() {
            warn!("Event dispatch worker is gone, dropping event");
        }
    }

    /// Wait until every emission queued before this call has run
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.queue.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher").finish_non_exhaustive()
    }
}

/// Dispatch worker - runs queued emissions one at a time
async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Invoke { event, callbacks } => {
                let result = tokio::task::spawn_blocking(move || run_callbacks(&event, &callbacks));
                if let Err(e) = result.await {
                    error!(error = %e, "Callback worker failed");
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn run_callbacks(event: &Event, callbacks: &[Callback]) {
    for callback in callbacks {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(event = %event.kind(), reason = %reason, "Callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_normalization() {
        for name in ["on_connect", "ConNEct", "onCon-nect", "connect", "ON-CONNECT"] {
            assert_eq!(name.parse::<EventKind>().unwrap(), EventKind::Connect, "{}", name);
        }
        assert_eq!(
            "on_server_shutdown".parse::<EventKind>().unwrap(),
            EventKind::ServerShutdown
        );
        assert_eq!(
            "onStateChange".parse::<EventKind>().unwrap(),
            EventKind::StateChange
        );
        assert!(matches!(
            "explode".parse::<EventKind>(),
            Err(Error::UnknownEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_aliases_share_bucket() {
        let dispatcher = EventDispatcher::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        for (i, name) in ["on_connect", "ConNEct", "onCon-nect", "connect"].iter().enumerate() {
            let hits = hits.clone();
            dispatcher
                .subscribe(name, move |_| hits.lock().unwrap().push(i))
                .unwrap();
        }
        dispatcher.emit(Event::Connect {
            client_id: "abc".into(),
        });
        dispatcher.flush().await;

        // Insertion order within one emission
        assert_eq!(*hits.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_panicking_callback_isolated() {
        let dispatcher = EventDispatcher::new();
        let (tx, rx) = std_mpsc::channel();

        dispatcher.on(EventKind::ServerShutdown, |_| panic!("boom"));
        dispatcher.on(EventKind::ServerShutdown, move |_| {
            let _ = tx.send(());
        });

        dispatcher.emit(Event::ServerShutdown);
        dispatcher.emit(Event::ServerShutdown);
        dispatcher.flush().await;

        assert_eq!(rx.try_iter().count(), 2);
    }

    #[tokio::test]
    async fn test_emit_does_not_wait_for_callbacks() {
        let dispatcher = EventDispatcher::new();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (done_tx, done_rx) = std_mpsc::channel();

        dispatcher.on(EventKind::Disconnect, move |_| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            let _ = done_tx.send(());
        });

        // Returns while the callback is still blocked
        dispatcher.emit(Event::Disconnect {
            client_id: "abc".into(),
        });
        assert!(done_rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        dispatcher.flush().await;
        assert!(done_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_emission_order_preserved() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        dispatcher.on(EventKind::Message, move |event| {
            if let Event::Message { message, .. } = event {
                sink.lock().unwrap().push(message.subject().to_string());
            }
        });

        for i in 0..20 {
            dispatcher.emit(Event::Message {
                origin: None,
                message: Message::empty(format!("m{}", i)).unwrap(),
            });
        }
        dispatcher.flush().await;

        let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }
}
