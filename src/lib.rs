//! Signal-interception core of a process-level dynamic instrumentation
//! engine
//!
//! The engine runs a target program out of an execution cache, so OS
//! signals can land at arbitrary points inside cache-resident code. This
//! crate owns the machinery that keeps delivery indistinguishable from
//! native execution:
//! - translation between kernel-raw frame/context layouts and the
//!   engine's portable snapshot, including vector state with
//!   CPU-dependent alignment
//! - per-thread pending queues so delivery can wait for a safe point
//! - disposition tables and interval timers, transparently shared across
//!   clone-groups
//! - optional pollable per-signal notification endpoints
//!
//! The execution cache, allocator, and thread lifecycle are external
//! collaborators reached through the narrow seams in [`cache`]; all
//! command-line, configuration, and logging concerns stay with the
//! embedding engine (this crate only emits through the `log` facade).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cache;
pub mod constants;
pub mod disposition;
pub mod error;
pub mod fpstate;
pub mod frame;
pub mod itimer;
pub mod pending;
pub mod sigfd;
pub mod sigset;
pub mod thread_state;

#[cfg(test)]
mod disposition_tests;
#[cfg(test)]
mod sigset_tests;
#[cfg(test)]
mod thread_state_tests;

pub use error::SignalError;
pub use thread_state::{DrainEvent, ForgedDelivery, RawDeliveryAction, ThreadSigState};
