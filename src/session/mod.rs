//! Connection sessions
//!
//! One [`Session`] per accepted socket. It owns the socket, walks the phase
//! state machine, checks per-direction sequence counters, reassembles frames
//! from the byte stream and hands them to the dispatch registry one at a
//! time. Code outside the session task talks to it through a
//! [`SessionHandle`].

mod connection;
pub(crate) mod handshake;
pub mod manager;
mod phase;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::core::ServerClock;
use crate::dispatch::Registry;
use crate::hooks::Hooks;
use crate::packet::CodecError;
use crate::timer::Scheduler;

pub use connection::{CloseReason, Session, SessionHandle};
pub use handshake::{clock_offset, HANDSHAKE_HEADER, PHASE_HEADER};
pub use manager::SessionManager;
pub use phase::{Phase, Phases};

/// Opaque connection id, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error types for session operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown packet: header={header:#04X}, sub_header={sub_header:?}")]
    UnknownPacket { header: u8, sub_header: Option<u8> },

    #[error("Sequence desync: expected={expected}, got={got}")]
    Desync { expected: u8, got: u8 },

    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Handler failed: {0}")]
    Handler(anyhow::Error),

    #[error("Illegal phase transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Maximum sessions exceeded (limit: {0})")]
    MaxSessionsExceeded(usize),

    #[error("Session closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this error ends the connection.
    ///
    /// Framing and decoding faults leave the byte stream misaligned, so they
    /// always close. Handler failures and refused transitions are local to
    /// the frame that caused them.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::Handler(_) | SessionError::IllegalTransition { .. }
        )
    }
}

/// Per-connection limits taken from the host configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: 4096,
        }
    }
}

impl From<&ServerConfig> for SessionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            max_frame_size: config.max_frame_size,
        }
    }
}

/// Everything a session shares with its siblings. Built once per process.
pub struct SessionContext<P: Phases> {
    pub registry: Arc<Registry<P>>,
    pub scheduler: Arc<Scheduler>,
    pub hooks: Hooks,
    pub clock: ServerClock,
    pub limits: SessionLimits,
}

impl<P: Phases> SessionContext<P> {
    pub fn new(registry: Arc<Registry<P>>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            registry,
            scheduler,
            hooks: Hooks::new(),
            clock: ServerClock::new(),
            limits: SessionLimits::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_clock(mut self, clock: ServerClock) -> Self {
        self.clock = clock;
        self
    }
}
