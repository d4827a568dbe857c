//! Per-thread pending-signal queues with pool-backed allocation
//!
//! Deferred deliveries are kept in rt form, one FIFO list per signal
//! number, with nodes drawn from a fixed-capacity per-thread pool. The
//! pool is index-linked rather than pointer-linked and never touches the
//! general allocator: enqueue runs at signal-receipt time, where the
//! general heap is not reentrancy-safe. The pool itself is allocated once
//! at thread attach, which is an ordinary (non-handler) context.
//!
//! Flood policy: a standard-class signal retains at most
//! [`MAX_NON_RT_PENDING`] queued instances; further arrivals coalesce.
//! This is the usual "signal not queued, not lost" imprecision, kept as an
//! at-least-one-pending guarantee. Realtime-class signals queue exactly
//! until the pool runs dry, then drop with a warning while at least one
//! instance stays pending.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::constants::{is_realtime_signal, signal_name, NSIG, SIGARRAY_SIZE};
use crate::fpstate::XstateBuf;
use crate::frame::SigframeRt;

/// Pending-signal nodes available per thread
pub const SIGPOOL_CAPACITY: usize = 32;

/// Retained instances per standard-class signal number (policy constant;
/// the kernel itself keeps exactly one, we keep a little slack so an
/// unblock-then-reblock window cannot lose a delivery)
pub const MAX_NON_RT_PENDING: usize = 2;

const NO_INDEX: u16 = u16::MAX;

/// One deferred, already-translated delivery
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PendingSignal {
    /// Frame in rt form, immutable until dequeued for delivery
    pub frame: SigframeRt,
    /// Vector state captured at receipt; the frame's fpstate pointer is
    /// re-attached to this block when the frame is forged for delivery
    pub xstate: XstateBuf,
    /// Use the kernel-native sigcontext, not the derived snapshot, so an
    /// interrupted syscall restarts correctly
    pub use_sigcontext: bool,
    /// Was the signal unblocked when it was received
    pub unblocked: bool,
    /// Faulting address for fault-class signals, 0 otherwise
    pub access_address: u64,
    next: u16,
}

impl PendingSignal {
    fn zeroed() -> Self {
        // SAFETY: frame/xstate are plain bytes; bools are valid as zero
        unsafe { core::mem::zeroed() }
    }
}

/// Outcome of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Node queued at the tail of the signal's list
    Queued,
    /// Per-signal bound reached; arrival merged into the existing pending
    /// instances (intentional standard-class imprecision)
    Coalesced,
    /// Pool exhausted; arrival dropped, at least one instance remains
    DroppedPoolExhausted,
}

/// Fixed pool plus per-signal-number FIFO list heads
pub struct PendingQueues {
    slots: Box<[PendingSignal]>,
    free_head: u16,
    heads: [u16; SIGARRAY_SIZE],
    tails: [u16; SIGARRAY_SIZE],
    counts: [u8; SIGARRAY_SIZE],
}

impl PendingQueues {
    /// Allocate the pool. Thread-attach context only; this is the one place
    /// the general allocator is used.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(SIGPOOL_CAPACITY);
        for i in 0..SIGPOOL_CAPACITY {
            let mut node = PendingSignal::zeroed();
            node.next = if i + 1 < SIGPOOL_CAPACITY {
                (i + 1) as u16
            } else {
                NO_INDEX
            };
            slots.push(node);
        }
        PendingQueues {
            slots: slots.into_boxed_slice(),
            free_head: 0,
            heads: [NO_INDEX; SIGARRAY_SIZE],
            tails: [NO_INDEX; SIGARRAY_SIZE],
            counts: [0; SIGARRAY_SIZE],
        }
    }

    fn alloc_node(&mut self) -> Option<u16> {
        let idx = self.free_head;
        if idx == NO_INDEX {
            return None;
        }
        self.free_head = self.slots[idx as usize].next;
        self.slots[idx as usize].next = NO_INDEX;
        Some(idx)
    }

    fn free_node(&mut self, idx: u16) {
        self.slots[idx as usize].next = self.free_head;
        self.free_head = idx;
    }

    /// Append a deferred delivery to `sig`'s list, preserving arrival order.
    ///
    /// The caller masks `sig` for the duration (per-number masking is what
    /// makes this critical section non-reentrant); `build` fills the node
    /// in place and must not allocate.
    pub fn enqueue(
        &mut self,
        sig: u32,
        build: impl FnOnce(&mut PendingSignal),
    ) -> EnqueueOutcome {
        let s = sig as usize;
        // Realtime-class signals never coalesce; only pool exhaustion
        // stops them
        if !is_realtime_signal(sig) && self.counts[s] as usize >= MAX_NON_RT_PENDING {
            log::debug!(
                "coalescing {} (already {} pending)",
                signal_name(sig),
                self.counts[s]
            );
            return EnqueueOutcome::Coalesced;
        }
        let idx = match self.alloc_node() {
            Some(idx) => idx,
            None => {
                log::warn!(
                    "pending-signal pool exhausted, dropping {} ({} already pending)",
                    signal_name(sig),
                    self.counts[s]
                );
                return EnqueueOutcome::DroppedPoolExhausted;
            }
        };
        build(&mut self.slots[idx as usize]);
        self.slots[idx as usize].next = NO_INDEX;
        if self.heads[s] == NO_INDEX {
            self.heads[s] = idx;
        } else {
            let tail = self.tails[s];
            self.slots[tail as usize].next = idx;
        }
        self.tails[s] = idx;
        self.counts[s] += 1;
        EnqueueOutcome::Queued
    }

    /// Oldest pending entry for `sig`, if any
    pub fn front(&self, sig: u32) -> Option<&PendingSignal> {
        let idx = self.heads[sig as usize];
        if idx == NO_INDEX {
            None
        } else {
            Some(&self.slots[idx as usize])
        }
    }

    pub fn front_mut(&mut self, sig: u32) -> Option<&mut PendingSignal> {
        let idx = self.heads[sig as usize];
        if idx == NO_INDEX {
            None
        } else {
            Some(&mut self.slots[idx as usize])
        }
    }

    /// Unlink and free the oldest entry for `sig` (after it was delivered
    /// or found obsolete)
    pub fn release_front(&mut self, sig: u32) {
        let s = sig as usize;
        let idx = self.heads[s];
        debug_assert_ne!(idx, NO_INDEX);
        if idx == NO_INDEX {
            return;
        }
        self.heads[s] = self.slots[idx as usize].next;
        if self.heads[s] == NO_INDEX {
            self.tails[s] = NO_INDEX;
        }
        self.counts[s] -= 1;
        self.free_node(idx);
    }

    /// Number of entries pending for `sig`
    pub fn pending_count(&self, sig: u32) -> usize {
        self.counts[sig as usize] as usize
    }

    pub fn has_pending(&self, sig: u32) -> bool {
        self.heads[sig as usize] != NO_INDEX
    }

    /// Lowest signal number with a pending entry not in `blocked`.
    ///
    /// Fixed ascending scan order: FIFO within a number, numeric order
    /// across numbers, so low numbers are not starved by a flood of a
    /// higher one.
    pub fn first_deliverable(&self, blocked: u64) -> Option<u32> {
        for sig in 1..=NSIG {
            if self.heads[sig as usize] != NO_INDEX
                && blocked & crate::constants::sig_mask(sig) == 0
            {
                return Some(sig);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(|&h| h == NO_INDEX)
    }

    /// Free every queued entry without delivering (thread exit)
    pub fn clear_all(&mut self) {
        for sig in 1..=NSIG {
            while self.has_pending(sig) {
                self.release_front(sig);
            }
        }
    }
}

impl Default for PendingQueues {
    fn default() -> Self {
        Self::new()
    }
}
