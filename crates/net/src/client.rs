//! TCP client engine
//!
//! Owns one outbound connection. `connect()` spawns a connection task that
//! performs the handshake, runs the receive/send loop, and supervises
//! reconnection when the link breaks without a preceding `disconnect()`.

use std::sync::{Arc, Mutex};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::{read_into, write_frame, FrameBuffer};
use crate::config::{
    validate_address, validate_client_id, validate_remote_port, ClientConfig, ReconnectPolicy,
    ResolvedClientConfig,
};
use crate::dispatch::{Event, EventDispatcher, EventKind};
use crate::error::{Error, Result};
use crate::ids::IdGenerator;
use crate::message::{control, Message};
use crate::state::{ConnectionState, Phase, StateMachine};
use crate::sync::{lock, shutdown_requested, WRITE_TIMEOUT};

/// Client handle
pub struct Client {
    inner: Arc<ClientInner>,
    task: tokio::sync::Mutex<Option<ConnectionTask>>,
}

struct ClientInner {
    config: Mutex<ClientConfig>,
    state: StateMachine,
    dispatcher: EventDispatcher,
    ids: Mutex<IdGenerator>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    last_error: Mutex<Option<Error>>,
}

/// The running connection task. Dropping `shutdown_tx` also stops it.
struct ConnectionTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// An established, handshaken link
struct Link {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    frames: FrameBuffer,
}

/// Why a connected session loop returned
enum SessionEnd {
    /// `disconnect()` was called
    Manual,
    /// The server announced shutdown
    ServerShutdown,
    /// Read or write failed without a preceding `disconnect()`
    Broken(Error),
}

enum ReconnectOutcome {
    Reconnected(Link),
    Cancelled,
    Exhausted,
}

impl Client {
    /// Create an unconfigured client.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a client from a configuration
    pub fn with_config(config: ClientConfig) -> Self {
        let dispatcher = EventDispatcher::new();
        let initial = ConnectionState::new(Phase::NotConnected).with_needs_init(!config.is_complete());

        Client {
            inner: Arc::new(ClientInner {
                config: Mutex::new(config),
                state: StateMachine::new(initial, dispatcher.clone(), None),
                dispatcher,
                ids: Mutex::new(IdGenerator::new()),
                outbound: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> ClientConfig {
        lock(&self.inner.config).clone()
    }

    pub fn address(&self) -> Option<String> {
        lock(&self.inner.config).address.clone()
    }

    pub fn port(&self) -> Option<u16> {
        lock(&self.inner.config).port
    }

    pub fn client_id(&self) -> Option<String> {
        lock(&self.inner.config).client_id.clone()
    }

    pub fn set_address(&self, address: impl Into<String>) -> Result<()> {
        let address = address.into();
        validate_address(&address)?;
        self.update_config(|c| c.address = Some(address))
    }

    pub fn set_port(&self, port: u16) -> Result<()> {
        validate_remote_port(port)?;
        self.update_config(|c| c.port = Some(port))
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) -> Result<()> {
        let client_id = client_id.into();
        validate_client_id(&client_id)?;
        self.update_config(|c| c.client_id = Some(client_id))
    }

    /// Local interface for the outbound socket; `None` lets the OS choose
    pub fn set_interface(&self, interface: Option<String>) -> Result<()> {
        if let Some(iface) = &interface {
            crate::config::parse_interface(iface)?;
        }
        self.update_config(|c| c.interface = interface)
    }

    /// Local port for the outbound socket; `None` lets the OS choose
    pub fn set_bind_port(&self, bind_port: Option<u16>) -> Result<()> {
        self.update_config(|c| c.bind_port = bind_port)
    }

    pub fn set_reconnect_policy(&self, policy: ReconnectPolicy) -> Result<()> {
        self.update_config(|c| c.reconnect = policy)
    }

    /// Replace the whole configuration. Validated at `connect()`.
    pub fn set_config(&self, config: ClientConfig) -> Result<()> {
        self.update_config(|c| *c = config)
    }

    /// Apply a configuration change, refusing it while a connection is in
    /// flight. The config lock is held across the state check so `connect()`
    /// cannot slip in between.
    fn update_config(&self, f: impl FnOnce(&mut ClientConfig)) -> Result<()> {
        let mut config = lock(&self.inner.config);
        let mut next = config.clone();
        f(&mut next);

        let complete = next.is_complete();
        self.inner.state.update(|s| {
            if !s.phase().is_settled() {
                return Err(Error::InvalidState(format!(
                    "Client must be disconnected to change configuration (state: {})",
                    s
                )));
            }
            Ok(s.with_needs_init(!complete))
        })?;

        *config = next;
        Ok(())
    }

    /// Produce a random id not among this client's recently generated ones.
    /// Does not change the configured id.
    pub fn generate_id(&self) -> String {
        lock(&self.inner.ids).generate()
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

    /// Take the reason the last connection attempt or link failed
    pub fn take_last_error(&self) -> Option<Error> {
        lock(&self.inner.last_error).take()
    }

    /// Start connecting.
    ///
    /// Returns once the connection task is running. Success or failure is
    /// reported through the state and the `connect` event.
    pub async fn connect(&self) -> Result<()> {
        let mut task = self.task.lock().await;

        // A settled phase means the old task has published its final state
        // and only has to return (server shutdown, gave up reconnecting)
        if !self.inner.state.get().phase().is_settled() {
            return Err(Error::InvalidState("Client is already connected".into()));
        }
        if let Some(finished) = task.take() {
            let _ = finished.handle.await;
        }

        let config = {
            let config = lock(&self.inner.config);
            let resolved = config.validate()?;
            self.inner.state.update(|s| {
                if s.phase() != Phase::NotConnected {
                    return Err(Error::InvalidState(format!(
                        "Cannot connect from state {}",
                        s
                    )));
                }
                Ok(ConnectionState::new(Phase::Connecting).with_ok(true))
            })?;
            resolved
        };

        lock(&self.inner.last_error).take();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *lock(&self.inner.outbound) = Some(outbound_tx);

        info!(
            address = %config.address,
            port = config.port,
            client_id = %config.client_id,
            "Connecting to server"
        );

        let handle = tokio::spawn(connection_task(
            self.inner.clone(),
            config,
            shutdown_rx,
            outbound_rx,
        ));
        *task = Some(ConnectionTask {
            shutdown_tx,
            handle,
        });

        Ok(())
    }

    /// Disconnect from the server.
    ///
    /// No-op when not connected. Otherwise stops the connection task
    /// (cancelling any pending reconnect) and waits for it to exit.
    pub async fn disconnect(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        let Some(running) = task.take() else {
            return Ok(());
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            error!(error = %e, "Connection task failed");
        }

        lock(&self.inner.outbound).take();
        settle(&self.inner.state);
        Ok(())
    }

    /// Queue a message for the server.
    ///
    /// Fails with `NotConnected` unless the client is CONNECTED.
    pub fn send(&self, message: Message) -> Result<()> {
        message.ensure_application()?;
        if !self.inner.state.get().is_connected() {
            return Err(Error::NotConnected);
        }

        match lock(&self.inner.outbound).as_ref() {
            Some(tx) => tx.send(message).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Bring a stopped client to a clean NOT_CONNECTED, whatever the task left
fn settle(state: &StateMachine) {
    let phase = state.get().phase();
    if !phase.is_settled() {
        state.set_phase(Phase::Disconnecting);
    }
    state.transition(|s| {
        s.with_phase(Phase::NotConnected)
            .with_unexpected_close(false)
    });
}

/// Main connection task
async fn connection_task(
    inner: Arc<ClientInner>,
    config: ResolvedClientConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    let client_id = config.client_id.clone();

    let mut link = tokio::select! {
        result = establish(&config) => match result {
            Ok(link) => link,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Connect failed");
                let timed_out = matches!(e, Error::Timeout);
                *lock(&inner.last_error) = Some(e);
                inner
                    .state
                    .transition(|s| s.with_phase(Phase::ConnectFailed).with_unexpected_close(timed_out));
                inner.state.set_phase(Phase::NotConnected);
                return;
            }
        },
        _ = shutdown_requested(&mut shutdown_rx) => {
            manual_teardown(&inner, &client_id, None, &mut outbound_rx).await;
            return;
        }
    };

    inner
        .state
        .transition(|s| s.with_phase(Phase::Connected).with_unexpected_close(false));
    inner.dispatcher.emit(Event::Connect {
        client_id: client_id.clone(),
    });
    info!(client_id = %client_id, "Connected");

    loop {
        match run_session(&inner, &mut link, &mut shutdown_rx, &mut outbound_rx).await {
            SessionEnd::Manual => {
                manual_teardown(&inner, &client_id, Some(link), &mut outbound_rx).await;
                return;
            }
            SessionEnd::ServerShutdown => {
                info!(client_id = %client_id, "Server is shutting down, closing connection");
                inner.dispatcher.emit(Event::ServerShutdown);
                if let Err(e) = close_link(link).await {
                    debug!(error = %e, "Close after server shutdown failed");
                }
                inner.state.transition(|s| s.with_phase(Phase::NotConnected).with_ok(true));
                return;
            }
            SessionEnd::Broken(e) => {
                warn!(client_id = %client_id, error = %e, "Server connection closed unexpectedly");
                // A peer sending malformed frames is not worth retrying
                let retry = config.reconnect.enabled && e.is_link_error();
                *lock(&inner.last_error) = Some(e);

                if !retry {
                    inner.state.transition(|s| {
                        s.with_phase(Phase::NotConnected).with_unexpected_close(true)
                    });
                    return;
                }

                inner.state.transition(|s| {
                    s.with_phase(Phase::Reconnecting).with_unexpected_close(true)
                });
                match reconnect(&inner, &config, &mut shutdown_rx).await {
                    ReconnectOutcome::Reconnected(new_link) => link = new_link,
                    ReconnectOutcome::Cancelled => {
                        manual_teardown(&inner, &client_id, None, &mut outbound_rx).await;
                        return;
                    }
                    ReconnectOutcome::Exhausted => {
                        error!(
                            client_id = %client_id,
                            attempts = config.reconnect.max_attempts,
                            "Giving up on reconnect"
                        );
                        inner.state.set_phase(Phase::ReconnectFailed);
                        inner.state.set_phase(Phase::NotConnected);
                        return;
                    }
                }
            }
        }
    }
}

/// Open the socket and complete the client id handshake
async fn establish(config: &ResolvedClientConfig) -> Result<Link> {
    let stream = timeout(config.connect_timeout, open_stream(config))
        .await
        .map_err(|_| Error::Timeout)??;
    let (reader, mut writer) = stream.into_split();

    write_frame(&mut writer, &Message::negotiation(&config.client_id)).await?;

    let mut link = Link {
        reader,
        writer,
        frames: FrameBuffer::new(),
    };
    timeout(config.handshake_timeout, await_handshake(&mut link))
        .await
        .map_err(|_| Error::Timeout)??;

    Ok(link)
}

async fn open_stream(config: &ResolvedClientConfig) -> Result<TcpStream> {
    let Some(local) = config.bind else {
        return Ok(TcpStream::connect((config.address.as_str(), config.port)).await?);
    };

    debug!(local = %local, "Binding outbound socket");
    let remote = lookup_host((config.address.as_str(), config.port))
        .await?
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| {
            Error::Configuration(format!(
                "No address for {} matches the bind interface {}",
                config.address, local
            ))
        })?;

    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(local)?;
    Ok(socket.connect(remote).await?)
}

/// Wait for the server's verdict on our client id
async fn await_handshake(link: &mut Link) -> Result<()> {
    loop {
        if let Some(reply) = link.frames.next_message()? {
            return match reply.subject() {
                control::ACCEPTED => Ok(()),
                control::REJECTED => Err(Error::Rejected(
                    reply.get_str("reason").unwrap_or("no reason given").to_string(),
                )),
                other => Err(Error::Protocol(format!(
                    "Expected handshake reply, got '{}'",
                    other
                ))),
            };
        }
        read_into(&mut link.reader, &mut link.frames).await?;
    }
}

/// Receive/send loop for an established link
async fn run_session(
    inner: &ClientInner,
    link: &mut Link,
    shutdown_rx: &mut watch::Receiver<bool>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> SessionEnd {
    loop {
        // Also picks up frames that arrived together with the handshake reply
        let (messages, corrupt) = link.frames.drain();
        if let Some(end) = deliver(inner, messages) {
            return end;
        }
        if let Some(e) = corrupt {
            return SessionEnd::Broken(e);
        }

        // A requested stop wins over pending traffic; teardown flushes the queue
        tokio::select! {
            biased;

            _ = shutdown_requested(shutdown_rx) => {
                return SessionEnd::Manual;
            }

            result = read_into(&mut link.reader, &mut link.frames) => {
                if let Err(e) = result {
                    return SessionEnd::Broken(e);
                }
            }

            Some(msg) = outbound_rx.recv() => {
                if let Err(e) = timed_write(&mut link.writer, &msg).await {
                    return SessionEnd::Broken(e);
                }
            }
        }
    }
}

/// Hand received messages to callbacks in arrival order
fn deliver(inner: &ClientInner, messages: Vec<Message>) -> Option<SessionEnd> {
    for message in messages {
        match message.subject() {
            control::SHUTDOWN => return Some(SessionEnd::ServerShutdown),
            _ if message.is_control() => {
                debug!(subject = %message.subject(), "Ignoring unexpected control frame");
            }
            _ => inner.dispatcher.emit(Event::Message {
                origin: None,
                message,
            }),
        }
    }
    None
}

/// Re-establish a broken link with bounded exponential backoff
async fn reconnect(
    inner: &ClientInner,
    config: &ResolvedClientConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ReconnectOutcome {
    let policy = &config.reconnect;

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect backoff");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_requested(shutdown_rx) => return ReconnectOutcome::Cancelled,
        }

        inner.state.set_phase(Phase::Connecting);
        tokio::select! {
            result = establish(config) => match result {
                Ok(link) => {
                    inner
                        .state
                        .transition(|s| s.with_phase(Phase::Connected).with_unexpected_close(false));
                    inner.dispatcher.emit(Event::Reconnect {
                        client_id: config.client_id.clone(),
                    });
                    info!(client_id = %config.client_id, attempt, "Reconnected");
                    return ReconnectOutcome::Reconnected(link);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    *lock(&inner.last_error) = Some(e);
                    inner.state.set_phase(Phase::Reconnecting);
                }
            },
            _ = shutdown_requested(shutdown_rx) => return ReconnectOutcome::Cancelled,
        }
    }

    ReconnectOutcome::Exhausted
}

/// Manual disconnect: announce, flush, say goodbye, close
async fn manual_teardown(
    inner: &ClientInner,
    client_id: &str,
    link: Option<Link>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
) {
    inner.state.set_phase(Phase::Disconnecting);
    inner.dispatcher.emit(Event::Disconnect {
        client_id: client_id.to_string(),
    });

    let result = match link {
        Some(mut link) => {
            // Best effort for messages queued before disconnect()
            outbound_rx.close();
            let mut flushed = Ok(());
            while let Ok(msg) = outbound_rx.try_recv() {
                if let Err(e) = timed_write(&mut link.writer, &msg).await {
                    flushed = Err(e);
                    break;
                }
            }
            match flushed {
                Ok(()) => close_link(link).await,
                Err(e) => Err(e),
            }
        }
        None => Ok(()),
    };

    match result {
        Ok(()) => {
            inner.state.transition(|s| {
                s.with_phase(Phase::NotConnected)
                    .with_ok(true)
                    .with_unexpected_close(false)
            });
        }
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "Disconnect did not complete cleanly");
            let timed_out = matches!(e, Error::Timeout);
            *lock(&inner.last_error) = Some(e);
            inner.state.transition(|s| {
                s.with_phase(Phase::DisconnectFailed)
                    .with_ok(false)
                    .with_unexpected_close(timed_out)
            });
            inner.state.set_phase(Phase::NotConnected);
        }
    }
    info!(client_id = %client_id, "Disconnected from server");
}

/// Tell the server we are leaving and shut the socket down
async fn close_link(mut link: Link) -> Result<()> {
    timed_write(&mut link.writer, &Message::shutdown()).await?;
    timeout(WRITE_TIMEOUT, tokio::io::AsyncWriteExt::shutdown(&mut link.writer))
        .await
        .map_err(|_| Error::Timeout)??;
    Ok(())
}

async fn timed_write(writer: &mut OwnedWriteHalf, msg: &Message) -> Result<()> {
    timeout(WRITE_TIMEOUT, write_frame(writer, msg))
        .await
        .map_err(|_| Error::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Flag;
    use std::time::Duration;

    fn configured() -> Client {
        let client = Client::new();
        client.set_address("127.0.0.1").unwrap();
        client.set_port(30000).unwrap();
        client.set_client_id("abc").unwrap();
        client
    }

    #[tokio::test]
    async fn test_needs_init_tracks_required_fields() {
        let client = Client::new();
        assert!(client.state().contains(Flag::NeedsInit));

        client.set_address("127.0.0.1").unwrap();
        client.set_port(30000).unwrap();
        assert!(client.state().contains(Flag::NeedsInit));

        client.set_client_id("abc").unwrap();
        assert!(!client.state().contains(Flag::NeedsInit));
        assert!(client.state().contains(Flag::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_requires_configuration() {
        let client = Client::new();
        client.set_address("127.0.0.1").unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(client.state().phase(), Phase::NotConnected);
    }

    #[tokio::test]
    async fn test_invalid_values_rejected() {
        let client = Client::new();
        assert!(matches!(client.set_port(0), Err(Error::Configuration(_))));
        assert!(matches!(client.set_client_id(""), Err(Error::Configuration(_))));
        assert!(matches!(
            client.set_interface(Some("nowhere".into())),
            Err(Error::Configuration(_))
        ));
        assert!(client.port().is_none());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = configured();
        let (tx, rx) = std::sync::mpsc::channel();
        client.on(EventKind::Message, move |_| {
            let _ = tx.send(());
        });

        let err = client.send(Message::empty("hello").unwrap()).unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        client.flush_events().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reserved_subject_refused() {
        let client = configured();
        let err = client.send(Message::empty("shutdown").unwrap()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let client = configured();
        let (tx, rx) = std::sync::mpsc::channel();
        client.on(EventKind::Disconnect, move |_| {
            let _ = tx.send(());
        });

        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        client.flush_events().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(client.state().phase(), Phase::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_refused_settles_not_connected() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = configured();
        client.set_port(port).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.on(EventKind::StateChange, move |event| {
            if let Event::StateChange { transition, .. } = event {
                let _ = tx.send(transition.to.phase());
            }
        });

        client.connect().await.unwrap();

        let phases = timeout(Duration::from_secs(5), async {
            let mut phases = Vec::new();
            while let Some(phase) = rx.recv().await {
                phases.push(phase);
                if phase == Phase::NotConnected {
                    break;
                }
            }
            phases
        })
        .await
        .unwrap();

        assert_eq!(
            phases,
            vec![Phase::Connecting, Phase::ConnectFailed, Phase::NotConnected]
        );
        assert!(matches!(client.take_last_error(), Some(Error::Io(_))));

        // Disconnect after a failed connect emits nothing and settles cleanly
        client.disconnect().await.unwrap();
        assert_eq!(client.state().phase(), Phase::NotConnected);
    }

    #[tokio::test]
    async fn test_generate_id_leaves_config_alone() {
        let client = configured();
        let a = client.generate_id();
        let b = client.generate_id();
        assert_ne!(a, b);
        assert_eq!(client.client_id().as_deref(), Some("abc"));
    }
}
