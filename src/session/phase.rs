use std::fmt;
use std::hash::Hash;

/// The application-specific phases a session moves through after the
/// handshake. Auth and world processes each supply their own set.
pub trait Phases: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Phase entered when the handshake completes.
    fn entry() -> Self;

    /// Whether `self -> next` is a legal step. Skips must be rejected.
    fn can_advance_to(self, next: Self) -> bool;

    /// Byte carried by the phase notification frame.
    fn code(self) -> u8;
}

/// Full session lifecycle: the shared handshake, the application phases, and
/// the terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase<P> {
    Handshake,
    Active(P),
    Closed,
}

impl<P: Phases> Phase<P> {
    pub fn active(self) -> Option<P> {
        match self {
            Phase::Active(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Phase::Closed)
    }
}

impl<P: Phases> fmt::Display for Phase<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Handshake => f.write_str("Handshake"),
            Phase::Active(p) => write!(f, "{p:?}"),
            Phase::Closed => f.write_str("Closed"),
        }
    }
}
