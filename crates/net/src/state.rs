//! Connection state model shared by client and server
//!
//! A connection's state is one primary [`Phase`] plus independent overlay
//! flags (`NEEDS_INIT`, `OK`, `RUNNING`, `UNEXPECTED_CLOSE`). Holding the
//! phase as an enum keeps "exactly one primary phase" true by construction;
//! [`ConnectionState::bits`] gives the flat bitfield for status display.

use std::fmt;
use std::sync::Mutex;

use tracing::debug;

use crate::dispatch::{Event, EventDispatcher};
use crate::error::{Error, Result};
use crate::sync::lock;

/// Individual state bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Flag {
    NeedsInit = 0x0001,
    Ok = 0x0002,
    Running = 0x0004,
    NotConnected = 0x0008,
    Connecting = 0x0010,
    Connected = 0x0020,
    ConnectFailed = 0x0040,
    Reconnecting = 0x0080,
    ReconnectFailed = 0x0100,
    Disconnecting = 0x0200,
    DisconnectFailed = 0x0400,
    UnexpectedClose = 0x0800,
}

impl Flag {
    pub const ALL: [Flag; 12] = [
        Flag::NeedsInit,
        Flag::Ok,
        Flag::Running,
        Flag::NotConnected,
        Flag::Connecting,
        Flag::Connected,
        Flag::ConnectFailed,
        Flag::Reconnecting,
        Flag::ReconnectFailed,
        Flag::Disconnecting,
        Flag::DisconnectFailed,
        Flag::UnexpectedClose,
    ];

    pub fn bit(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Flag::NeedsInit => "NEEDS_INIT",
            Flag::Ok => "OK",
            Flag::Running => "RUNNING",
            Flag::NotConnected => "NOT_CONNECTED",
            Flag::Connecting => "CONNECTING",
            Flag::Connected => "CONNECTED",
            Flag::ConnectFailed => "CONNECT_FAILED",
            Flag::Reconnecting => "RECONNECTING",
            Flag::ReconnectFailed => "RECONNECT_FAILED",
            Flag::Disconnecting => "DISCONNECTING",
            Flag::DisconnectFailed => "DISCONNECT_FAILED",
            Flag::UnexpectedClose => "UNEXPECTED_CLOSE",
        }
    }
}

/// Mutually exclusive lifecycle stage of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    NotConnected,
    Connecting,
    Connected,
    ConnectFailed,
    Reconnecting,
    ReconnectFailed,
    Disconnecting,
    DisconnectFailed,
}

impl Phase {
    pub fn flag(self) -> Flag {
        match self {
            Phase::NotConnected => Flag::NotConnected,
            Phase::Connecting => Flag::Connecting,
            Phase::Connected => Flag::Connected,
            Phase::ConnectFailed => Flag::ConnectFailed,
            Phase::Reconnecting => Flag::Reconnecting,
            Phase::ReconnectFailed => Flag::ReconnectFailed,
            Phase::Disconnecting => Flag::Disconnecting,
            Phase::DisconnectFailed => Flag::DisconnectFailed,
        }
    }

    /// Legal primary-phase transitions. Staying in the same phase is
    /// always allowed (only overlays change).
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (NotConnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, ConnectFailed)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnecting)
                | (Connected, Reconnecting)
                | (Connected, Disconnecting)
                | (Connected, NotConnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, ReconnectFailed)
                | (Reconnecting, Disconnecting)
                | (ConnectFailed, NotConnected)
                | (ReconnectFailed, NotConnected)
                | (Disconnecting, NotConnected)
                | (Disconnecting, DisconnectFailed)
                | (DisconnectFailed, NotConnected)
        )
    }

    /// No background activity is in flight for this connection
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Phase::NotConnected
                | Phase::ConnectFailed
                | Phase::ReconnectFailed
                | Phase::DisconnectFailed
        )
    }
}

/// Snapshot of a connection's state: one phase plus overlay flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    phase: Phase,
    needs_init: bool,
    ok: bool,
    running: bool,
    unexpected_close: bool,
}

impl Default for ConnectionState {
    /// `NEEDS_INIT | NOT_CONNECTED`
    fn default() -> Self {
        Self {
            phase: Phase::NotConnected,
            needs_init: true,
            ok: false,
            running: false,
            unexpected_close: false,
        }
    }
}

impl ConnectionState {
    /// A state in `phase` with no overlays set
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            needs_init: false,
            ok: false,
            running: false,
            unexpected_close: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn needs_init(&self) -> bool {
        self.needs_init
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn unexpected_close(&self) -> bool {
        self.unexpected_close
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_needs_init(mut self, on: bool) -> Self {
        self.needs_init = on;
        self
    }

    pub fn with_ok(mut self, on: bool) -> Self {
        self.ok = on;
        self
    }

    pub fn with_running(mut self, on: bool) -> Self {
        self.running = on;
        self
    }

    pub fn with_unexpected_close(mut self, on: bool) -> Self {
        self.unexpected_close = on;
        self
    }

    pub fn contains(&self, flag: Flag) -> bool {
        match flag {
            Flag::NeedsInit => self.needs_init,
            Flag::Ok => self.ok,
            Flag::Running => self.running,
            Flag::UnexpectedClose => self.unexpected_close,
            phase_flag => self.phase.flag() == phase_flag,
        }
    }

    /// Flat bitfield view
    pub fn bits(&self) -> u16 {
        Flag::ALL
            .iter()
            .filter(|f| self.contains(**f))
            .fold(0, |acc, f| acc | f.bit())
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Flag::ALL
            .iter()
            .filter(|flag| self.contains(**flag))
            .map(|flag| flag.name())
            .collect();
        write!(f, "{}", names.join(" | "))
    }
}

/// A completed state change, carried by `statechange` events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "from {} to {}", self.from, self.to)
    }
}

/// Guarded state cell that announces every change.
///
/// Updates are applied and their `statechange` event queued under the same
/// lock, so emissions for one connection follow transition order. Emitting
/// only enqueues, so the lock is never held across I/O or user code.
pub(crate) struct StateMachine {
    state: Mutex<ConnectionState>,
    dispatcher: EventDispatcher,
    /// Session id for server-side sessions, `None` for engine-wide state
    scope: Option<String>,
}

impl StateMachine {
    pub fn new(
        initial: ConnectionState,
        dispatcher: EventDispatcher,
        scope: Option<String>,
    ) -> Self {
        Self {
            state: Mutex::new(initial),
            dispatcher,
            scope,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Apply `f` to the current state.
    ///
    /// Returns `None` when nothing changed. An illegal phase change or an
    /// error from `f` leaves the state untouched.
    pub fn update<F>(&self, f: F) -> Result<Option<StateTransition>>
    where
        F: FnOnce(ConnectionState) -> Result<ConnectionState>,
    {
        let mut state = lock(&self.state);
        let from = *state;
        let to = f(from)?;

        if from == to {
            return Ok(None);
        }
        if !from.phase.can_transition_to(to.phase) {
            return Err(Error::InvalidState(format!(
                "Illegal transition from {} to {}",
                from, to
            )));
        }

        *state = to;
        let transition = StateTransition { from, to };
        debug!(scope = ?self.scope, %transition, "State change");
        self.dispatcher.emit(Event::StateChange {
            client_id: self.scope.clone(),
            transition,
        });
        Ok(Some(transition))
    }

    /// Infallible form of [`update`](Self::update) for transitions the
    /// engine knows to be legal; an illegal one is logged and skipped.
    pub fn transition<F>(&self, f: F) -> Option<StateTransition>
    where
        F: FnOnce(ConnectionState) -> ConnectionState,
    {
        match self.update(|s| Ok(f(s))) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(scope = ?self.scope, error = %e, "Skipped state change");
                None
            }
        }
    }

    /// Move to `phase`, keeping overlays
    pub fn set_phase(&self, phase: Phase) -> Option<StateTransition> {
        self.transition(|s| s.with_phase(phase))
    }
}
