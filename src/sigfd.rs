//! Out-of-band delivery notification channels
//!
//! A caller that wants to observe deliveries without synchronous handler
//! reentrancy asks for a per-signal pollable endpoint. Endpoints are
//! created lazily; every successful delivery (synchronous or deferred)
//! writes a token to each armed endpoint for that signal number. Writes
//! are nonblocking: a full ring drops the token, like a nonblocking pipe.
//!
//! The registry is globally capped to mirror descriptor exhaustion; hitting
//! the cap is reported to the caller, never swallowed, because a caller
//! that asked for a channel depends on it existing.

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::error::SignalError;

/// Tokens a single endpoint retains before dropping new ones
pub const SIGFD_RING_CAPACITY: usize = 64;

/// Endpoints that may exist process-wide
pub const MAX_SIGFD_PIPES: usize = 128;

static PIPES_LIVE: AtomicUsize = AtomicUsize::new(0);

/// One delivery observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigToken {
    pub sig: u32,
    /// Interrupted program counter at receipt
    pub pc: u64,
}

struct TokenRing {
    tokens: [SigToken; SIGFD_RING_CAPACITY],
    head: usize,
    len: usize,
}

/// Pollable per-signal notification endpoint
pub struct SigfdPipe {
    ring: Mutex<TokenRing>,
}

impl SigfdPipe {
    /// Create an endpoint, counting it against the global cap.
    pub fn create() -> Result<Self, SignalError> {
        let mut live = PIPES_LIVE.load(Ordering::Acquire);
        loop {
            if live >= MAX_SIGFD_PIPES {
                log::warn!("signalfd registry exhausted ({} endpoints)", live);
                return Err(SignalError::SignalfdExhausted);
            }
            match PIPES_LIVE.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => live = seen,
            }
        }
        Ok(SigfdPipe {
            ring: Mutex::new(TokenRing {
                tokens: [SigToken { sig: 0, pc: 0 }; SIGFD_RING_CAPACITY],
                head: 0,
                len: 0,
            }),
        })
    }

    /// Nonblocking write; a full ring drops the token.
    pub fn notify(&self, token: SigToken) -> bool {
        let mut ring = self.ring.lock();
        if ring.len == SIGFD_RING_CAPACITY {
            log::debug!("signalfd ring full, dropping token for sig {}", token.sig);
            return false;
        }
        let tail = (ring.head + ring.len) % SIGFD_RING_CAPACITY;
        ring.tokens[tail] = token;
        ring.len += 1;
        true
    }

    /// Read one token, if any (the poller's edge)
    pub fn poll(&self) -> Option<SigToken> {
        let mut ring = self.ring.lock();
        if ring.len == 0 {
            return None;
        }
        let token = ring.tokens[ring.head];
        ring.head = (ring.head + 1) % SIGFD_RING_CAPACITY;
        ring.len -= 1;
        Some(token)
    }

    pub fn readable(&self) -> bool {
        self.ring.lock().len > 0
    }
}

impl Drop for SigfdPipe {
    fn drop(&mut self) {
        PIPES_LIVE.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Endpoints currently live process-wide
pub fn live_endpoints() -> usize {
    PIPES_LIVE.load(Ordering::Acquire)
}
