//! Interval-timer virtualization
//!
//! Both the engine and the app want interval timers, but there are only
//! three real ones per sharing scope (real-time, virtual, profiling). Each
//! class tracks the app's requested schedule and the engine's own schedule
//! independently and arms a single real timer with whichever deadline is
//! sooner; a real firing is then attributed back to whichever schedule(s)
//! actually elapsed.
//!
//! Timer state is shared across a clone-group under thread-group clone
//! semantics, which differ from handler-sharing semantics, so the sharing
//! record here is distinct from the disposition table's.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::constants::{SIGALRM, SIGPROF, SIGVTALRM};
use crate::error::SignalError;
use crate::frame::Mcontext;

/// Timer classes: ITIMER_REAL, ITIMER_VIRTUAL, ITIMER_PROF
pub const NUM_ITIMERS: usize = 3;

/// Consecutive alarms delivered with an approximate (untranslated) context
/// before we insist on a full translation again. Coarse program-counter
/// translation is expensive; under an alarm flood precision loses to
/// throughput.
pub const SKIP_ALARM_XL8_MAX: u32 = 3;

/// Time value matching POSIX struct timeval
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeval {
    /// Seconds
    pub tv_sec: i64,
    /// Microseconds (must be < 1,000,000)
    pub tv_usec: i64,
}

impl Timeval {
    pub const fn zero() -> Self {
        Timeval { tv_sec: 0, tv_usec: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.tv_sec == 0 && self.tv_usec == 0
    }

    pub fn to_micros(&self) -> u64 {
        if self.tv_sec < 0 || self.tv_usec < 0 {
            return 0;
        }
        (self.tv_sec as u64) * 1_000_000 + (self.tv_usec as u64)
    }

    pub fn from_micros(micros: u64) -> Self {
        Timeval {
            tv_sec: (micros / 1_000_000) as i64,
            tv_usec: (micros % 1_000_000) as i64,
        }
    }
}

/// Interval timer value matching POSIX struct itimerval
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Itimerval {
    /// Timer interval for periodic timers (zero = one-shot)
    pub it_interval: Timeval,
    /// Time until next expiration (zero = timer disabled)
    pub it_value: Timeval,
}

impl Itimerval {
    pub const fn empty() -> Self {
        Itimerval {
            it_interval: Timeval::zero(),
            it_value: Timeval::zero(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.it_value.is_zero()
    }
}

/// Which real timer a class maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ItimerWhich {
    /// Wall-clock time, fires SIGALRM
    Real = 0,
    /// User CPU time, fires SIGVTALRM
    Virtual = 1,
    /// User + system CPU time, fires SIGPROF
    Prof = 2,
}

impl ItimerWhich {
    pub fn from_raw(which: i32) -> Result<Self, SignalError> {
        match which {
            0 => Ok(ItimerWhich::Real),
            1 => Ok(ItimerWhich::Virtual),
            2 => Ok(ItimerWhich::Prof),
            other => Err(SignalError::InvalidTimer(other)),
        }
    }

    pub fn signal(self) -> u32 {
        match self {
            ItimerWhich::Real => SIGALRM,
            ItimerWhich::Virtual => SIGVTALRM,
            ItimerWhich::Prof => SIGPROF,
        }
    }

    pub fn from_signal(sig: u32) -> Option<Self> {
        match sig {
            SIGALRM => Some(ItimerWhich::Real),
            SIGVTALRM => Some(ItimerWhich::Virtual),
            SIGPROF => Some(ItimerWhich::Prof),
            _ => None,
        }
    }
}

/// Single interval/value pair in microseconds (easier to manipulate than
/// the two-field timeval form)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItimerInfo {
    pub interval: u64,
    pub value: u64,
}

impl ItimerInfo {
    pub fn is_armed(&self) -> bool {
        self.value != 0
    }
}

/// Engine-internal firing callback, handed the interrupted context
pub type ItimerCallback = fn(&mut Mcontext);
/// Client-facing firing callback
pub type ItimerClientCallback = fn(&mut Mcontext);

/// What a real firing was attributed to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItimerFiring {
    /// The app's schedule elapsed: forward the signal as an ordinary
    /// pending app signal
    pub app: bool,
    /// The engine's schedule elapsed: its callback(s) were invoked
    pub engine: bool,
}

/// Per-class timer state: app schedule, saved app schedule (for temporary
/// suppression without loss), engine schedule, and what is actually armed
#[derive(Clone, Default)]
pub struct ThreadItimerInfo {
    pub app: ItimerInfo,
    pub app_saved: ItimerInfo,
    pub dr: ItimerInfo,
    pub actual: ItimerInfo,
    pub cb: Option<ItimerCallback>,
    pub cb_api: Option<ItimerClientCallback>,
}

/// The three timer classes of one sharing scope
pub struct ItimerBlock {
    timers: [ThreadItimerInfo; NUM_ITIMERS],
}

impl ItimerBlock {
    pub fn new() -> Self {
        ItimerBlock {
            timers: Default::default(),
        }
    }

    fn info(&self, which: ItimerWhich) -> &ThreadItimerInfo {
        &self.timers[which as usize]
    }

    fn info_mut(&mut self, which: ItimerWhich) -> &mut ThreadItimerInfo {
        &mut self.timers[which as usize]
    }

    /// Recompute the combined-actual value: the sooner of the app and
    /// engine deadlines. Returns what must be armed with the OS (zero =
    /// disarm).
    fn recompute_actual(&mut self, which: ItimerWhich) -> u64 {
        let t = self.info_mut(which);
        let next = match (t.app.is_armed(), t.dr.is_armed()) {
            (true, true) => t.app.value.min(t.dr.value),
            (true, false) => t.app.value,
            (false, true) => t.dr.value,
            (false, false) => 0,
        };
        t.actual.value = next;
        t.actual.interval = 0; // rearmed explicitly on each firing
        if next != 0 {
            log::trace!("itimer {:?} armed for {}us", which, next);
        }
        next
    }

    /// App-requested setitimer. Returns the previous app value for the
    /// syscall-emulation layer to report.
    pub fn set_app(&mut self, which: ItimerWhich, new: Itimerval) -> Itimerval {
        let t = self.info_mut(which);
        let old = Itimerval {
            it_interval: Timeval::from_micros(t.app.interval),
            it_value: Timeval::from_micros(t.app.value),
        };
        t.app.interval = new.it_interval.to_micros();
        t.app.value = new.it_value.to_micros();
        self.recompute_actual(which);
        old
    }

    /// App-requested getitimer
    pub fn get_app(&self, which: ItimerWhich) -> Itimerval {
        let t = self.info(which);
        Itimerval {
            it_interval: Timeval::from_micros(t.app.interval),
            it_value: Timeval::from_micros(t.app.value),
        }
    }

    /// Arm or rearm the engine's own schedule for a class
    pub fn set_engine(
        &mut self,
        which: ItimerWhich,
        interval_us: u64,
        value_us: u64,
        cb: Option<ItimerCallback>,
        cb_api: Option<ItimerClientCallback>,
    ) {
        let t = self.info_mut(which);
        t.dr.interval = interval_us;
        t.dr.value = value_us;
        if cb.is_some() {
            t.cb = cb;
        }
        if cb_api.is_some() {
            t.cb_api = cb_api;
        }
        self.recompute_actual(which);
    }

    /// Zero the app component, saving it, while the engine schedule stays
    /// armed. Used around windows where the engine single-steps and the
    /// app must not observe a spurious early firing.
    pub fn suspend_app(&mut self, which: ItimerWhich) {
        let t = self.info_mut(which);
        if t.app.is_armed() {
            t.app_saved = t.app;
            t.app = ItimerInfo::default();
            self.recompute_actual(which);
        }
    }

    /// Restore the app component saved by [`suspend_app`](Self::suspend_app)
    pub fn resume_app(&mut self, which: ItimerWhich) {
        let t = self.info_mut(which);
        if t.app_saved.is_armed() {
            t.app = t.app_saved;
            t.app_saved = ItimerInfo::default();
            self.recompute_actual(which);
        }
    }

    /// What is currently armed with the OS for this class
    pub fn armed_value(&self, which: ItimerWhich) -> u64 {
        self.info(which).actual.value
    }

    /// Attribute a real firing after `elapsed_us` against both schedules,
    /// invoke the engine callbacks if its schedule elapsed, rearm from
    /// whichever remaining deadline is soonest.
    pub fn fire(&mut self, which: ItimerWhich, elapsed_us: u64, mc: &mut Mcontext) -> ItimerFiring {
        let t = self.info_mut(which);
        let mut fired = ItimerFiring::default();

        if t.app.is_armed() {
            if elapsed_us >= t.app.value {
                fired.app = true;
                t.app.value = t.app.interval; // one-shot disarms
            } else {
                t.app.value -= elapsed_us;
            }
        }
        if t.dr.is_armed() {
            if elapsed_us >= t.dr.value {
                fired.engine = true;
                t.dr.value = t.dr.interval;
            } else {
                t.dr.value -= elapsed_us;
            }
        }

        if fired.engine {
            let cb = t.cb;
            let cb_api = t.cb_api;
            if let Some(cb) = cb {
                cb(mc);
            }
            if let Some(cb) = cb_api {
                cb(mc);
            }
        }

        self.recompute_actual(which);
        log::trace!(
            "itimer {:?} fired after {}us: app={} engine={}",
            which,
            elapsed_us,
            fired.app,
            fired.engine
        );
        fired
    }
}

impl Default for ItimerBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Itimer block shared across a thread-group clone-group
pub struct SharedItimers {
    pub block: Mutex<ItimerBlock>,
    /// Threads of the group currently under engine control; a thread can
    /// be created outside the group, so engine exit cannot stand in for
    /// this count
    pub threads_in_engine: AtomicUsize,
}

/// A thread's handle on its itimer state, refcounted separately from the
/// disposition table because the sharing rules differ
pub enum Itimers {
    Private(Box<ItimerBlock>),
    Shared(Arc<SharedItimers>),
}

impl Itimers {
    pub fn new_private() -> Self {
        Itimers::Private(Box::new(ItimerBlock::new()))
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Itimers::Shared(_))
    }

    pub fn ref_count(&self) -> usize {
        match self {
            Itimers::Private(_) => 1,
            Itimers::Shared(arc) => Arc::strong_count(arc),
        }
    }

    /// Handle a thread-group clone adopts; converts to shared form on
    /// first use
    pub fn adopt_shared(&mut self) -> Itimers {
        if let Itimers::Private(_) = self {
            let block = match core::mem::replace(self, Itimers::new_private()) {
                Itimers::Private(b) => *b,
                Itimers::Shared(_) => unreachable!(),
            };
            *self = Itimers::Shared(Arc::new(SharedItimers {
                block: Mutex::new(block),
                threads_in_engine: AtomicUsize::new(1),
            }));
        }
        match self {
            Itimers::Shared(arc) => {
                arc.threads_in_engine.fetch_add(1, Ordering::AcqRel);
                Itimers::Shared(Arc::clone(arc))
            }
            Itimers::Private(_) => unreachable!(),
        }
    }

    /// Deep copy for fork
    pub fn fork_copy(&self) -> Itimers {
        let block = self.with(|b| ItimerBlock {
            timers: b.timers.clone(),
        });
        Itimers::Private(Box::new(block))
    }

    pub fn release(self) {
        if let Itimers::Shared(arc) = &self {
            arc.threads_in_engine.fetch_sub(1, Ordering::AcqRel);
            log::debug!(
                "releasing itimer block, refcount {} -> {}",
                Arc::strong_count(arc),
                Arc::strong_count(arc) - 1
            );
        }
    }

    /// Run `f` against the block under the sharing lock when shared
    pub fn with<R>(&self, f: impl FnOnce(&ItimerBlock) -> R) -> R {
        match self {
            Itimers::Private(b) => f(b),
            Itimers::Shared(arc) => f(&arc.block.lock()),
        }
    }

    pub fn with_mut<R>(&mut self, f: impl FnOnce(&mut ItimerBlock) -> R) -> R {
        match self {
            Itimers::Private(b) => f(b),
            Itimers::Shared(arc) => f(&mut arc.block.lock()),
        }
    }
}

impl Default for Itimers {
    fn default() -> Self {
        Self::new_private()
    }
}
