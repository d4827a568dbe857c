//! Error kinds surfaced by the signal core
//!
//! Recovery is always local to the engine: nothing here carries a
//! user-facing message, consumers decide visibility.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// Raw frame shape not recognized; delivering an unverifiable context
    /// would silently corrupt machine state, so the caller must abort the
    /// monitored operation
    UnrecognizedFrame,
    /// Notification-channel registry is at capacity
    SignalfdExhausted,
    /// Invalid signal number passed through a syscall-emulation entry point
    InvalidSignal(u32),
    /// Invalid timer class passed through a syscall-emulation entry point
    InvalidTimer(i32),
    /// Invalid "how" operand passed to the sigprocmask emulation
    InvalidMaskHow(i32),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::UnrecognizedFrame => write!(f, "unrecognized signal frame shape"),
            SignalError::SignalfdExhausted => write!(f, "signalfd registry exhausted"),
            SignalError::InvalidSignal(sig) => write!(f, "invalid signal number {}", sig),
            SignalError::InvalidTimer(which) => write!(f, "invalid itimer class {}", which),
            SignalError::InvalidMaskHow(how) => write!(f, "invalid sigprocmask operation {}", how),
        }
    }
}
