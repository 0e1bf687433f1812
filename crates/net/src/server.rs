//! TCP server engine
//!
//! Accepts many clients, tracks each as a session keyed by the client id it
//! presented during handshake, and delivers targeted or broadcast messages.
//! The server never reconnects to clients; a broken session is torn down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::{read_into, write_frame, FrameBuffer};
use crate::config::{parse_interface, validate_client_id, ServerConfig};
use crate::dispatch::{Event, EventDispatcher, EventKind};
use crate::error::{Error, Result};
use crate::message::{control, Message};
use crate::state::{ConnectionState, Phase, StateMachine};
use crate::sync::{lock, shutdown_requested, WRITE_TIMEOUT};

/// Send target meaning every connected session
pub const BROADCAST: &str = "*";

/// Server handle
pub struct Server {
    inner: Arc<ServerInner>,
    running: tokio::sync::Mutex<Option<Running>>,
}

struct ServerInner {
    config: Mutex<ServerConfig>,
    /// Server-wide state; `RUNNING` tracks the accept loop
    state: StateMachine,
    dispatcher: EventDispatcher,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    next_session: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    accept: JoinHandle<()>,
}

/// Connected client as seen by `send` and introspection
struct SessionHandle {
    /// Distinguishes this session from a later one reusing the same id
    serial: u64,
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<StateMachine>,
}

/// Why a session loop returned
enum SessionEnd {
    /// The client announced it is leaving
    Left,
    /// `stop()` was called
    Stopped,
    Broken(Error),
}

impl Server {
    /// Create an unconfigured server.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let dispatcher = EventDispatcher::new();
        let initial = ConnectionState::new(Phase::NotConnected).with_needs_init(!config.is_complete());

        Server {
            inner: Arc::new(ServerInner {
                config: Mutex::new(config),
                state: StateMachine::new(initial, dispatcher.clone(), None),
                dispatcher,
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                local_addr: Mutex::new(None),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Server-wide state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.get().is_running()
    }

    pub fn config(&self) -> ServerConfig {
        lock(&self.inner.config).clone()
    }

    pub fn interface(&self) -> Option<String> {
        lock(&self.inner.config).interface.clone()
    }

    pub fn port(&self) -> Option<u16> {
        lock(&self.inner.config).port
    }

    /// Interface to listen on; `*` for all
    pub fn set_interface(&self, interface: impl Into<String>) -> Result<()> {
        let interface = interface.into();
        parse_interface(&interface)?;
        self.update_config(|c| c.interface = Some(interface))
    }

    /// Port to listen on; 0 lets the OS choose
    pub fn set_port(&self, port: u16) -> Result<()> {
        self.update_config(|c| c.port = Some(port))
    }

    pub fn set_config(&self, config: ServerConfig) -> Result<()> {
        self.update_config(|c| *c = config)
    }

    fn update_config(&self, f: impl FnOnce(&mut ServerConfig)) -> Result<()> {
        let mut config = lock(&self.inner.config);
        let mut next = config.clone();
        f(&mut next);

        let complete = next.is_complete();
        self.inner.state.update(|s| {
            if s.is_running() {
                return Err(Error::InvalidState(
                    "Server must be stopped to change configuration".into(),
                ));
            }
            Ok(s.with_needs_init(!complete))
        })?;

        *config = next;
        Ok(())
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    /// Ids of connected clients, sorted
    pub async fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn session_state(&self, client_id: &str) -> Option<ConnectionState> {
        self.inner
            .sessions
            .read()
            .await
            .get(client_id)
            .map(|s| s.state.get())
    }

    /// Subscribe to an event by name; see [`EventKind`]
    pub fn subscribe<F>(&self, event: &str, callback: F) -> Result<()>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.subscribe(event, callback)
    }

    pub fn on<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(kind, callback);
    }

    /// Wait until every event emitted so far has been delivered
    pub async fn flush_events(&self) {
        self.inner.dispatcher.flush().await;
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::InvalidState("Server is already running".into()));
        }

        // RUNNING goes up before the bind so setters are locked out from here on
        let config = {
            let config = lock(&self.inner.config);
            let resolved = config.validate()?;
            self.inner
                .state
                .update(|s| Ok(s.with_running(true).with_ok(true)))?;
            resolved
        };

        let listener = match TcpListener::bind(config.bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %config.bind, error = %e, "Bind failed");
                self.inner
                    .state
                    .transition(|s| s.with_running(false).with_ok(false));
                return Err(Error::Bind(e));
            }
        };
        let bound = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.inner
                    .state
                    .transition(|s| s.with_running(false).with_ok(false));
                return Err(Error::Bind(e));
            }
        };
        *lock(&self.inner.local_addr) = Some(bound);

        info!(addr = %bound, "Server started");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(
            listener,
            self.inner.clone(),
            config.handshake_timeout,
            shutdown_rx,
        ));
        *running = Some(Running {
            shutdown_tx,
            accept,
        });

        Ok(bound)
    }

    /// Notify every session, close them, and stop listening. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return Ok(());
        };

        info!("Server shutdown initiated");
        let _ = current.shutdown_tx.send(true);
        if let Err(e) = current.accept.await {
            error!(error = %e, "Accept loop failed");
        }

        lock(&self.inner.local_addr).take();
        self.inner.state.transition(|s| s.with_running(false));
        info!("Server stopped");
        Ok(())
    }

    /// Queue a message for one client, or for all with [`BROADCAST`].
    ///
    /// A broadcast skips sessions that are going away; a targeted send to an
    /// absent client fails with `UnknownClient`.
    pub async fn send(&self, target: &str, message: Message) -> Result<()> {
        message.ensure_application()?;
        if !self.is_running() {
            return Err(Error::NotConnected);
        }

        let sessions = self.inner.sessions.read().await;
        if target == BROADCAST {
            for (client_id, session) in sessions.iter() {
                if session.tx.send(message.clone()).is_err() {
                    warn!(client_id = %client_id, "Failed to queue broadcast for session");
                }
            }
            return Ok(());
        }

        let session = sessions
            .get(target)
            .ok_or_else(|| Error::UnknownClient(target.to_string()))?;
        session
            .tx
            .send(message)
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept incoming connections until shutdown, then wait for every session
async fn accept_loop(
    listener: TcpListener,
    inner: Arc<ServerInner>,
    handshake_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        sessions.spawn(handle_connection(
                            inner.clone(),
                            stream,
                            addr,
                            handshake_timeout,
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
            Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = result {
                    error!(error = %e, "Session task failed");
                }
            }
            _ = shutdown_requested(&mut shutdown_rx) => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }

    drop(listener);
    while let Some(result) = sessions.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Session task failed");
        }
    }
}

/// Handshake, register, and serve a single client connection
async fn handle_connection(
    inner: Arc<ServerInner>,
    stream: TcpStream,
    addr: SocketAddr,
    handshake_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut frames = FrameBuffer::new();

    let negotiated = tokio::select! {
        result = timeout(handshake_timeout, read_negotiation(&mut reader, &mut frames)) => {
            result.map_err(|_| Error::Timeout).and_then(|r| r)
        }
        _ = shutdown_requested(&mut shutdown_rx) => return,
    };
    let client_id = match negotiated {
        Ok(id) => id,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Handshake failed");
            refuse(&mut writer, &e.to_string()).await;
            return;
        }
    };

    let serial = inner.next_session.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let state = Arc::new(StateMachine::new(
        ConnectionState::new(Phase::NotConnected),
        inner.dispatcher.clone(),
        Some(client_id.clone()),
    ));

    {
        let mut sessions = inner.sessions.write().await;
        if sessions.contains_key(&client_id) {
            let e = Error::DuplicateClient(client_id.clone());
            drop(sessions);
            warn!(addr = %addr, error = %e, "Refusing connection");
            refuse(&mut writer, &e.to_string()).await;
            return;
        }
        sessions.insert(
            client_id.clone(),
            SessionHandle {
                serial,
                tx,
                state: state.clone(),
            },
        );
    }

    state.set_phase(Phase::Connecting);
    if let Err(e) = timed_write(&mut writer, &Message::accepted(&client_id)).await {
        warn!(client_id = %client_id, error = %e, "Failed to accept session");
        remove_session(&inner, &client_id, serial).await;
        state.transition(|s| s.with_phase(Phase::Disconnecting).with_unexpected_close(true));
        state.set_phase(Phase::NotConnected);
        return;
    }

    state.transition(|s| s.with_phase(Phase::Connected).with_ok(true));
    inner.dispatcher.emit(Event::Connect {
        client_id: client_id.clone(),
    });
    info!(client_id = %client_id, addr = %addr, "Session joined");

    let end = session_loop(
        &inner,
        &client_id,
        &mut reader,
        &mut writer,
        &mut frames,
        &mut rx,
        &mut shutdown_rx,
    )
    .await;

    // Removed before flushing, so no new sends can land after this point
    remove_session(&inner, &client_id, serial).await;
    rx.close();

    let broken = match &end {
        SessionEnd::Broken(e) => {
            warn!(client_id = %client_id, error = %e, "Session link broken");
            true
        }
        SessionEnd::Left => {
            debug!(client_id = %client_id, "Client left");
            false
        }
        SessionEnd::Stopped => false,
    };

    state.transition(|s| s.with_phase(Phase::Disconnecting).with_unexpected_close(broken));

    let closed = if broken {
        Ok(())
    } else {
        close_session(&mut writer, &mut rx, matches!(end, SessionEnd::Stopped)).await
    };

    match closed {
        Ok(()) => {
            state.set_phase(Phase::NotConnected);
        }
        Err(e) => {
            debug!(client_id = %client_id, error = %e, "Session close failed");
            state.set_phase(Phase::DisconnectFailed);
            state.set_phase(Phase::NotConnected);
        }
    }

    inner.dispatcher.emit(Event::Disconnect {
        client_id: client_id.clone(),
    });
    info!(client_id = %client_id, "Session left");
}

/// Read the client's `negotiation` frame and return its id
async fn read_negotiation(reader: &mut OwnedReadHalf, frames: &mut FrameBuffer) -> Result<String> {
    loop {
        if let Some(msg) = frames.next_message()? {
            if msg.subject() != control::NEGOTIATION {
                return Err(Error::Protocol(format!(
                    "Expected negotiation, got '{}'",
                    msg.subject()
                )));
            }
            let id = msg
                .get_str("id")
                .ok_or_else(|| Error::Protocol("Negotiation without client id".into()))?;
            validate_client_id(id).map_err(|e| Error::Protocol(e.to_string()))?;
            return Ok(id.to_string());
        }
        read_into(reader, frames).await?;
    }
}

/// Receive/send loop for one session
async fn session_loop(
    inner: &ServerInner,
    client_id: &str,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    frames: &mut FrameBuffer,
    rx: &mut mpsc::UnboundedReceiver<Message>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    loop {
        // Also picks up frames that followed the negotiation in the same read
        let (messages, corrupt) = frames.drain();
        if let Some(end) = deliver(inner, client_id, messages) {
            return end;
        }
        if let Some(e) = corrupt {
            return SessionEnd::Broken(e);
        }

        // A requested stop wins over pending traffic; teardown flushes the queue
        tokio::select! {
            biased;

            _ = shutdown_requested(shutdown_rx) => {
                return SessionEnd::Stopped;
            }

            result = read_into(reader, frames) => {
                if let Err(e) = result {
                    return SessionEnd::Broken(e);
                }
            }

            Some(msg) = rx.recv() => {
                if let Err(e) = timed_write(writer, &msg).await {
                    return SessionEnd::Broken(e);
                }
            }
        }
    }
}

fn deliver(inner: &ServerInner, client_id: &str, messages: Vec<Message>) -> Option<SessionEnd> {
    for message in messages {
        match message.subject() {
            control::SHUTDOWN => return Some(SessionEnd::Left),
            _ if message.is_control() => {
                debug!(client_id = %client_id, subject = %message.subject(), "Ignoring control frame");
            }
            _ => inner.dispatcher.emit(Event::Message {
                origin: Some(client_id.to_string()),
                message,
            }),
        }
    }
    None
}

/// Flush pending sends, announce shutdown if stopping, close the socket
async fn close_session(
    writer: &mut OwnedWriteHalf,
    rx: &mut mpsc::UnboundedReceiver<Message>,
    notify: bool,
) -> Result<()> {
    while let Ok(msg) = rx.try_recv() {
        timed_write(writer, &msg).await?;
    }
    if notify {
        timed_write(writer, &Message::shutdown()).await?;
    }
    timeout(WRITE_TIMEOUT, tokio::io::AsyncWriteExt::shutdown(writer))
        .await
        .map_err(|_| Error::Timeout)??;
    Ok(())
}

/// Tell a connecting client why it was refused; best effort
async fn refuse(writer: &mut OwnedWriteHalf, reason: &str) {
    if let Err(e) = timed_write(writer, &Message::rejected(reason)).await {
        debug!(error = %e, "Failed to send rejection");
    }
    let _ = timeout(WRITE_TIMEOUT, tokio::io::AsyncWriteExt::shutdown(writer)).await;
}

async fn remove_session(inner: &ServerInner, client_id: &str, serial: u64) {
    let mut sessions = inner.sessions.write().await;
    if sessions.get(client_id).map(|s| s.serial) == Some(serial) {
        sessions.remove(client_id);
    }
}

async fn timed_write(writer: &mut OwnedWriteHalf, msg: &Message) -> Result<()> {
    timeout(WRITE_TIMEOUT, write_frame(writer, msg))
        .await
        .map_err(|_| Error::Timeout)?
}
