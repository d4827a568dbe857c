//! Signal dispositions, optionally shared across a clone-group
//!
//! The kernel's sigaction field order differs from libc's; we keep the
//! kernel form so installs/queries forwarded from the syscall-emulation
//! layer need no translation.
//!
//! A thread created with shared-handler semantics references its sibling
//! group's table instead of owning a copy. Sharing is a lock + refcount
//! pair; the raw table is never exposed, all access goes through accessors
//! that take the lock when shared. The per-signal "the engine intercepts
//! this" flags live in the same record: they are a property of the
//! clone-group's table, not of any one thread, and share its lifetime.

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

use crate::constants::{is_valid_signal, SIGARRAY_SIZE, SIG_DFL};
use crate::sigset::KernelSigset;

/// Kernel-ABI action record (kernel field order, not libc's)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSigaction {
    /// SIG_DFL, SIG_IGN, or a handler address
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    /// Signals blocked while the handler runs
    pub mask: KernelSigset,
}

impl KernelSigaction {
    pub const DEFAULT: KernelSigaction = KernelSigaction {
        handler: SIG_DFL,
        flags: 0,
        restorer: 0,
        mask: KernelSigset::new(),
    };

    #[inline]
    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    #[inline]
    pub fn is_ignore(&self) -> bool {
        self.handler == crate::constants::SIG_IGN
    }

    #[inline]
    pub fn is_user_handler(&self) -> bool {
        self.handler > crate::constants::SIG_IGN
    }
}

impl Default for KernelSigaction {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-signal action table plus the engine-interception flags
pub struct SigactionTable {
    actions: [KernelSigaction; SIGARRAY_SIZE],
    we_intercept: [bool; SIGARRAY_SIZE],
}

impl SigactionTable {
    pub fn new() -> Self {
        SigactionTable {
            actions: [KernelSigaction::DEFAULT; SIGARRAY_SIZE],
            we_intercept: [false; SIGARRAY_SIZE],
        }
    }

    pub fn get(&self, sig: u32) -> KernelSigaction {
        if is_valid_signal(sig) {
            self.actions[sig as usize]
        } else {
            KernelSigaction::DEFAULT
        }
    }

    pub fn set(&mut self, sig: u32, act: KernelSigaction) -> KernelSigaction {
        if !is_valid_signal(sig) {
            return KernelSigaction::DEFAULT;
        }
        core::mem::replace(&mut self.actions[sig as usize], act)
    }

    pub fn intercepted(&self, sig: u32) -> bool {
        is_valid_signal(sig) && self.we_intercept[sig as usize]
    }

    pub fn set_intercept(&mut self, sig: u32, yes: bool) {
        if is_valid_signal(sig) {
            self.we_intercept[sig as usize] = yes;
        }
    }
}

impl Default for SigactionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread's handle on its disposition table: exclusively owned, or
/// shared by reference with the clone-group
pub enum Handlers {
    Private(Box<SigactionTable>),
    Shared(Arc<Mutex<SigactionTable>>),
}

impl Handlers {
    pub fn new_private() -> Self {
        Handlers::Private(Box::new(SigactionTable::new()))
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Handlers::Shared(_))
    }

    /// Live references to the shared table (1 for a private one)
    pub fn ref_count(&self) -> usize {
        match self {
            Handlers::Private(_) => 1,
            Handlers::Shared(arc) => Arc::strong_count(arc),
        }
    }

    /// Produce the handle a shared-handler clone adopts, converting this
    /// thread's table to shared form on first use.
    pub fn adopt_shared(&mut self) -> Handlers {
        if let Handlers::Private(_) = self {
            let table = match core::mem::replace(self, Handlers::new_private()) {
                Handlers::Private(t) => *t,
                Handlers::Shared(_) => unreachable!(),
            };
            *self = Handlers::Shared(Arc::new(Mutex::new(table)));
        }
        match self {
            Handlers::Shared(arc) => {
                let handle = Handlers::Shared(Arc::clone(arc));
                log::debug!(
                    "sigaction table adopted, refcount now {}",
                    Arc::strong_count(arc)
                );
                handle
            }
            Handlers::Private(_) => unreachable!(),
        }
    }

    /// Deep copy for fork: the child gets a private table snapshotting the
    /// parent's current actions.
    pub fn fork_copy(&self) -> Handlers {
        let table = self.with(|t| SigactionTable {
            actions: t.actions,
            we_intercept: t.we_intercept,
        });
        Handlers::Private(Box::new(table))
    }

    /// Drop this thread's reference. The table is freed when the last
    /// sibling releases; a live sibling's table is never freed under it.
    pub fn release(self) {
        if let Handlers::Shared(arc) = &self {
            log::debug!(
                "releasing sigaction table, refcount {} -> {}",
                Arc::strong_count(arc),
                Arc::strong_count(arc) - 1
            );
        }
    }

    fn with<R>(&self, f: impl FnOnce(&SigactionTable) -> R) -> R {
        match self {
            Handlers::Private(t) => f(t),
            Handlers::Shared(arc) => f(&arc.lock()),
        }
    }

    fn with_mut<R>(&mut self, f: impl FnOnce(&mut SigactionTable) -> R) -> R {
        match self {
            Handlers::Private(t) => f(t),
            // Serialized even for reads elsewhere: a sibling may be
            // mid-install under the same lock.
            Handlers::Shared(arc) => f(&mut arc.lock()),
        }
    }

    /// Install a new action, returning the previous one for the caller's
    /// sigaction emulation to report.
    pub fn install(&mut self, sig: u32, act: KernelSigaction) -> KernelSigaction {
        self.with_mut(|t| t.set(sig, act))
    }

    /// Current action. Takes the shared lock when shared: an install may be
    /// concurrent from a sibling thread.
    pub fn query(&self, sig: u32) -> KernelSigaction {
        self.with(|t| t.get(sig))
    }

    pub fn intercepted(&self, sig: u32) -> bool {
        self.with(|t| t.intercepted(sig))
    }

    pub fn set_intercept(&mut self, sig: u32, yes: bool) {
        self.with_mut(|t| t.set_intercept(sig, yes))
    }
}

impl Default for Handlers {
    fn default() -> Self {
        Self::new_private()
    }
}
