//! Per-thread signal state and the receipt/drain entry points
//!
//! One [`ThreadSigState`] exists per monitored thread. It owns the
//! thread's masks, alternate-stack descriptors, pending queues, and
//! notification endpoints, and owns or shares (per clone semantics) the
//! disposition table and itimer block.
//!
//! The signal-entry trampoline hands every raw frame to
//! [`handle_raw_delivery`](ThreadSigState::handle_raw_delivery), which
//! decides between immediate forgery and deferral. The safe-point detector
//! calls [`drain`](ThreadSigState::drain) once no fragment is mid-unlink
//! and no engine lock is held; `drain` must never run from raw handler
//! context.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::cache::{ExecArea, ExecutionCache, FragmentHandle};
use crate::constants::*;
use crate::disposition::{Handlers, KernelSigaction};
use crate::error::SignalError;
use crate::fpstate::{self, XstateBuf};
use crate::frame::{extract_mcontext, Mcontext, SigframeRt, SignalFrame, StackT};
use crate::itimer::{ItimerFiring, ItimerWhich, Itimers, Itimerval, SKIP_ALARM_XL8_MAX};
use crate::pending::PendingQueues;
use crate::sigfd::{SigToken, SigfdPipe};
use crate::sigset::{kernel_sigset_to_mask, mask_to_kernel_sigset};

/// What the trampoline should do with a raw delivery
#[derive(Debug)]
pub enum RawDeliveryAction {
    /// Safe to forge the app's frame right now
    DeliverNow(ForgedDelivery),
    /// Queued for the next safe point
    Deferred,
    /// Consumed by the engine (ignored, engine-internal timer, or
    /// suppressed during thread startup)
    Suppressed,
    /// Fall through to the OS default action
    OsDefault,
}

/// Events produced while draining at a safe point
#[derive(Debug)]
pub enum DrainEvent {
    /// Hand this forged frame to the app's handler
    Handler(ForgedDelivery),
    /// The app reinstalled the default action since the signal was queued
    Default(u32, SignalDefaultAction),
}

/// A frame forged for the app's own handler, indistinguishable from a
/// kernel delivery
#[derive(Debug)]
pub struct ForgedDelivery {
    pub sig: u32,
    /// App handler address to transfer to
    pub handler: u64,
    /// rt frame to copy beneath the handler
    pub frame: SigframeRt,
    /// Vector-state block belonging to the frame. The consumer places it
    /// and must re-point the frame with
    /// [`attach_fpstate`](crate::fpstate::attach_fpstate); the in-struct
    /// pointer is cleared here so it cannot dangle.
    pub xstate: XstateBuf,
    /// Deliver on the app's sigaltstack
    pub on_altstack: bool,
}

/// Per-thread signal state
pub struct ThreadSigState {
    /// Installed actions, possibly shared with the clone-group
    pub handlers: Handlers,
    /// Interval timers, shared under thread-group semantics (distinct
    /// from handler sharing)
    pub itimers: Itimers,

    /// False until inherit/fresh-init runs; non-fatal signals arriving
    /// before then are suppressed since no disposition table is valid yet
    fully_initialized: bool,

    pending: PendingQueues,
    /// Guard against an interrupting signal corrupting a queue mutation.
    /// Mutation of one signal number's list is made non-reentrant by
    /// masking that number around the critical section; this flag catches
    /// discipline violations and lets a nested section restore the outer
    /// one's state.
    accessing_pending: AtomicBool,

    /// App's currently blocked signals (portable bitmap)
    app_sigblocked: u64,
    /// Saved around emulated syscalls for transactional restore
    pre_syscall_app_sigblocked: u64,
    /// The mask the app's memory claims, preserved across emulation
    pre_syscall_app_sigprocmask: u64,

    in_sigsuspend: bool,
    app_sigblocked_save: u64,

    /// App's sigaltstack; consulted when forging an SA_ONSTACK delivery
    pub app_sigstack: StackT,
    /// Engine's own raw-interception stack. The trampoline layer registers
    /// it with the OS via sigaltstack at thread attach and tears it down at
    /// exit; the core only stores the descriptor so those two sides agree.
    pub sigstack: StackT,

    /// Per-signal restorer validity cache: -1 unknown, 0 invalid, 1 valid.
    /// Not shared; an inheriting thread re-populates its own.
    restorer_valid: [i8; SIGARRAY_SIZE],

    /// Consecutive alarms delivered with approximate context in the
    /// current burst
    skip_alarm_xl8: u32,

    /// Children cloned but not yet scheduled; state they will inherit
    /// must not be mutated while this is nonzero
    num_unstarted_children: AtomicU32,

    /// Fragment unlinked for the most recently deferred signal, relinked
    /// when the deferral is drained
    interrupted: Option<(FragmentHandle, u64)>,

    /// Lazily created notification endpoints, one per signal number
    signalfd: [Option<Arc<SigfdPipe>>; SIGARRAY_SIZE],
}

impl ThreadSigState {
    /// Thread-attach state: allocated but not yet fully initialized.
    /// Until [`thread_inherit`](Self::thread_inherit) or
    /// [`fresh_init`](Self::fresh_init) runs, only fatal-by-default
    /// signals get through (to the OS default action).
    pub fn new() -> Self {
        ThreadSigState {
            handlers: Handlers::new_private(),
            itimers: Itimers::new_private(),
            fully_initialized: false,
            pending: PendingQueues::new(),
            accessing_pending: AtomicBool::new(false),
            app_sigblocked: 0,
            pre_syscall_app_sigblocked: 0,
            pre_syscall_app_sigprocmask: 0,
            in_sigsuspend: false,
            app_sigblocked_save: 0,
            app_sigstack: StackT::default(),
            sigstack: StackT::default(),
            restorer_valid: [-1; SIGARRAY_SIZE],
            skip_alarm_xl8: 0,
            num_unstarted_children: AtomicU32::new(0),
            interrupted: None,
            signalfd: core::array::from_fn(|_| None),
        }
    }

    pub fn is_fully_initialized(&self) -> bool {
        self.fully_initialized
    }

    /// First thread of a process: nothing to inherit, flip to initialized.
    pub fn fresh_init(&mut self) {
        debug_assert!(!self.fully_initialized);
        self.fully_initialized = true;
        log::debug!("signal state fresh-initialized");
    }

    /// Called on the parent when a clone is requested, before the child
    /// is scheduled.
    pub fn begin_clone(&self) {
        self.num_unstarted_children.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unstarted_children(&self) -> u32 {
        self.num_unstarted_children.load(Ordering::Acquire)
    }

    /// One-time child-side init once the child is first scheduled.
    ///
    /// Adopts shared tables per the clone flags, copies the inheritable
    /// app state, and flips to fully-initialized.
    pub fn thread_inherit(&mut self, parent: &mut ThreadSigState, clone_flags: u64) {
        debug_assert!(!self.fully_initialized);
        self.handlers = if clone_flags & CLONE_SIGHAND != 0 {
            parent.handlers.adopt_shared()
        } else {
            parent.handlers.fork_copy()
        };
        self.itimers = if clone_flags & CLONE_THREAD != 0 {
            parent.itimers.adopt_shared()
        } else {
            parent.itimers.fork_copy()
        };
        self.app_sigblocked = parent.app_sigblocked;
        self.app_sigstack = parent.app_sigstack;
        // restorer validity is deliberately not inherited
        self.restorer_valid = [-1; SIGARRAY_SIZE];
        parent.num_unstarted_children.fetch_sub(1, Ordering::AcqRel);
        self.fully_initialized = true;
        log::debug!(
            "signal state inherited (handlers {}, itimers {})",
            if self.handlers.is_shared() { "shared" } else { "copied" },
            if self.itimers.is_shared() { "shared" } else { "copied" },
        );
    }

    /// Re-init after fork: sharing never crosses a fork, pending
    /// deliveries do not survive into the child.
    pub fn fork_init(&mut self) {
        self.handlers = self.handlers.fork_copy();
        self.itimers = self.itimers.fork_copy();
        self.pending.clear_all();
        self.in_sigsuspend = false;
        self.skip_alarm_xl8 = 0;
        self.num_unstarted_children.store(0, Ordering::Release);
        self.interrupted = None;
        self.fully_initialized = true;
        log::debug!("signal state re-initialized after fork");
    }

    /// Thread exit: free unflushed deferrals (never delivered), release
    /// shared tables, close notification endpoints. Deterministic
    /// regardless of how much was left queued.
    pub fn thread_exit(&mut self) {
        if !self.pending.is_empty() {
            log::debug!("freeing undelivered pending signals at thread exit");
        }
        self.pending.clear_all();
        core::mem::take(&mut self.handlers).release();
        core::mem::take(&mut self.itimers).release();
        for slot in self.signalfd.iter_mut() {
            drop(slot.take());
        }
        self.fully_initialized = false;
    }

    // ---- masks -----------------------------------------------------

    pub fn app_blocked(&self) -> u64 {
        self.app_sigblocked
    }

    #[inline]
    pub fn is_blocked(&self, sig: u32) -> bool {
        self.app_sigblocked & sig_mask(sig) != 0
    }

    /// sigprocmask emulation. Returns the previous mask.
    pub fn set_app_blocked(&mut self, how: i32, mask: u64) -> Result<u64, SignalError> {
        let old = self.app_sigblocked;
        match how {
            SIG_BLOCK => self.app_sigblocked |= mask & !UNCATCHABLE_SIGNALS,
            SIG_UNBLOCK => self.app_sigblocked &= !mask,
            SIG_SETMASK => self.app_sigblocked = mask & !UNCATCHABLE_SIGNALS,
            _ => return Err(SignalError::InvalidMaskHow(how)),
        }
        Ok(old)
    }

    /// Snapshot masks before emulating a mask-changing syscall so a failed
    /// emulation can restore both the engine's record and the app's view.
    pub fn begin_syscall(&mut self, app_view_mask: u64) {
        self.pre_syscall_app_sigblocked = self.app_sigblocked;
        self.pre_syscall_app_sigprocmask = app_view_mask;
    }

    /// Transactional restore after a failed/interrupted emulated syscall.
    /// Returns the app-view mask to write back to app memory.
    pub fn abort_syscall(&mut self) -> u64 {
        self.app_sigblocked = self.pre_syscall_app_sigblocked;
        self.pre_syscall_app_sigprocmask
    }

    /// sigsuspend emulation: install the temporary mask, saving the
    /// current one for restore at handler return.
    pub fn enter_sigsuspend(&mut self, temp_mask: u64) {
        self.app_sigblocked_save = self.app_sigblocked;
        self.app_sigblocked = temp_mask & !UNCATCHABLE_SIGNALS;
        self.in_sigsuspend = true;
    }

    /// sigreturn emulation: restore the mask the forged frame carries.
    pub fn handle_sigreturn(&mut self, frame: &SigframeRt) {
        self.app_sigblocked = kernel_sigset_to_mask(&frame.uc.uc_sigmask) & !UNCATCHABLE_SIGNALS;
    }

    // ---- dispositions ----------------------------------------------

    /// sigaction emulation. Returns the previous action.
    ///
    /// Shared state a not-yet-scheduled child will copy must not change
    /// under it; shared-by-reference tables are fine (the child sees the
    /// same table).
    pub fn install(&mut self, sig: u32, act: KernelSigaction) -> Result<KernelSigaction, SignalError> {
        if !is_valid_signal(sig) || !is_catchable(sig) {
            return Err(SignalError::InvalidSignal(sig));
        }
        if self.unstarted_children() > 0 && !self.handlers.is_shared() {
            log::warn!(
                "installing {} action with {} unstarted children",
                signal_name(sig),
                self.unstarted_children()
            );
        }
        self.restorer_valid[sig as usize] = -1;
        Ok(self.handlers.install(sig, act))
    }

    pub fn query(&self, sig: u32) -> Result<KernelSigaction, SignalError> {
        if !is_valid_signal(sig) {
            return Err(SignalError::InvalidSignal(sig));
        }
        Ok(self.handlers.query(sig))
    }

    /// Cached check that a signal's restorer can be used as the forged
    /// frame's return path. Re-computed after each install.
    pub fn restorer_is_valid(&mut self, sig: u32) -> bool {
        let s = sig as usize;
        if self.restorer_valid[s] < 0 {
            let act = self.handlers.query(sig);
            let valid = act.flags & SA_RESTORER != 0 && act.restorer != 0;
            self.restorer_valid[s] = valid as i8;
        }
        self.restorer_valid[s] == 1
    }

    // ---- itimers ---------------------------------------------------

    /// setitimer emulation. Returns the previous app value.
    pub fn set_itimer(&mut self, which: i32, new: Itimerval) -> Result<Itimerval, SignalError> {
        let which = ItimerWhich::from_raw(which)?;
        Ok(self.itimers.with_mut(|b| b.set_app(which, new)))
    }

    /// getitimer emulation.
    pub fn get_itimer(&self, which: i32) -> Result<Itimerval, SignalError> {
        let which = ItimerWhich::from_raw(which)?;
        Ok(self.itimers.with(|b| b.get_app(which)))
    }

    /// Suppress the app component of every timer class (engine
    /// single-step window); values are saved, not lost.
    pub fn suspend_app_itimers(&mut self) {
        self.itimers.with_mut(|b| {
            b.suspend_app(ItimerWhich::Real);
            b.suspend_app(ItimerWhich::Virtual);
            b.suspend_app(ItimerWhich::Prof);
        });
    }

    pub fn resume_app_itimers(&mut self) {
        self.itimers.with_mut(|b| {
            b.resume_app(ItimerWhich::Real);
            b.resume_app(ItimerWhich::Virtual);
            b.resume_app(ItimerWhich::Prof);
        });
    }

    /// Attribute an alarm-class signal to the app and/or engine schedule.
    /// A class we never virtualized (externally sent alarm) is entirely
    /// the app's.
    fn route_alarm(&mut self, sig: u32, mc: &mut Mcontext) -> ItimerFiring {
        let which = match ItimerWhich::from_signal(sig) {
            Some(w) => w,
            None => return ItimerFiring { app: true, engine: false },
        };
        self.itimers.with_mut(|b| {
            let elapsed = b.armed_value(which);
            if elapsed == 0 {
                ItimerFiring { app: true, engine: false }
            } else {
                b.fire(which, elapsed, mc)
            }
        })
    }

    /// Skip policy for alarm floods: up to [`SKIP_ALARM_XL8_MAX`]
    /// consecutive alarms in a burst may carry an approximate
    /// (untranslated) context, then one is translated fully again.
    fn should_skip_alarm_xl8(&mut self) -> bool {
        if self.skip_alarm_xl8 < SKIP_ALARM_XL8_MAX {
            self.skip_alarm_xl8 += 1;
            true
        } else {
            self.skip_alarm_xl8 = 0;
            false
        }
    }

    // ---- notification channels -------------------------------------

    /// Lazily create (or return) the pollable endpoint for `sig`.
    /// Creation failure is the caller's to handle; it asked for the
    /// channel and depends on it existing.
    pub fn create_signalfd(&mut self, sig: u32) -> Result<Arc<SigfdPipe>, SignalError> {
        if !is_valid_signal(sig) {
            return Err(SignalError::InvalidSignal(sig));
        }
        let slot = &mut self.signalfd[sig as usize];
        if let Some(pipe) = slot {
            return Ok(Arc::clone(pipe));
        }
        let pipe = Arc::new(SigfdPipe::create()?);
        *slot = Some(Arc::clone(&pipe));
        log::debug!("signalfd endpoint created for {}", signal_name(sig));
        Ok(pipe)
    }

    fn notify_signalfd(&self, sig: u32, pc: u64) {
        if let Some(pipe) = &self.signalfd[sig as usize] {
            pipe.notify(SigToken { sig, pc });
        }
    }

    // ---- receipt ---------------------------------------------------

    /// Entry point for the signal trampoline: decide what to do with a
    /// raw kernel delivery.
    ///
    /// `Err(UnrecognizedFrame)` is fatal for the monitored operation;
    /// delivering an unverifiable context is worse than aborting.
    pub fn handle_raw_delivery(
        &mut self,
        frame: SignalFrame,
        whereami: ExecArea,
        cache: &mut impl ExecutionCache,
    ) -> Result<RawDeliveryAction, SignalError> {
        let sig = frame.sig();
        // Normalize through the rt shape before anything looks at it
        let rt = frame.into_rt();
        rt.validate()?;

        if !self.fully_initialized {
            // No valid disposition table yet. Alarm classes are almost
            // certainly our own itimers and are squashed outright; other
            // fatal-by-default classes fall through to the OS; everything
            // else is squashed too.
            return if is_fatal_by_default(sig) && !is_alarm_signal(sig) {
                log::warn!("{} before init, leaving to OS default", signal_name(sig));
                Ok(RawDeliveryAction::OsDefault)
            } else {
                log::debug!("{} before init, suppressed", signal_name(sig));
                Ok(RawDeliveryAction::Suppressed)
            };
        }

        let unblocked = !self.is_blocked(sig);

        if is_alarm_signal(sig) {
            let mut mc = extract_mcontext(&SignalFrame::Rt(rt));
            let firing = self.route_alarm(sig, &mut mc);
            if !firing.app {
                // Engine-internal firing, fully consumed
                return Ok(RawDeliveryAction::Suppressed);
            }
        }

        if !unblocked {
            // A blocked signal is queued whatever its current disposition:
            // the app may install a handler and unblock before any action
            // is taken, and drain re-checks the disposition at delivery
            self.defer(sig, rt, whereami, false, cache);
            return Ok(RawDeliveryAction::Deferred);
        }

        let action = self.handlers.query(sig);
        if action.is_ignore() && is_catchable(sig) {
            log::debug!("{} ignored by app disposition", signal_name(sig));
            return Ok(RawDeliveryAction::Suppressed);
        }
        if action.is_default() {
            // Job-control and fatal classes get default-action
            // bookkeeping only
            return Ok(match default_action(sig) {
                SignalDefaultAction::Ignore => RawDeliveryAction::Suppressed,
                _ => RawDeliveryAction::OsDefault,
            });
        }

        // User handler installed. Forge immediately only at a point that
        // is already safe; otherwise queue for the next safe point.
        if whereami == ExecArea::Native {
            let mut xstate = XstateBuf::zeroed();
            let mut rt = rt;
            fpstate::save_fpstate(&mut rt, &mut xstate);
            rt.sigcontext_mut().fpstate = 0;
            self.notify_signalfd(sig, rt.sigcontext().ip);
            let forged = self.forge_delivery(sig, rt, xstate, &action);
            return Ok(RawDeliveryAction::DeliverNow(forged));
        }

        self.defer(sig, rt, whereami, true, cache);
        Ok(RawDeliveryAction::Deferred)
    }

    /// Queue an already-translated delivery for the next safe point.
    fn defer(
        &mut self,
        sig: u32,
        rt: SigframeRt,
        whereami: ExecArea,
        unblocked: bool,
        cache: &mut impl ExecutionCache,
    ) {
        if whereami == ExecArea::Cache {
            if let Some(interrupted) = cache.interrupt_current_fragment() {
                self.interrupted = Some(interrupted);
            }
        }

        // An alarm piling onto an undrained one is a burst: trade
        // context precision for throughput
        let approximate = is_alarm_signal(sig)
            && self.pending.has_pending(sig)
            && self.should_skip_alarm_xl8();
        let use_sigcontext = whereami == ExecArea::Syscall || approximate;
        let access_address = if is_fault_signal(sig) {
            rt.info.si_addr
        } else {
            0
        };
        let pc = rt.sigcontext().ip;

        // The caller masked `sig` around this mutation; the flag catches
        // discipline violations and keeps a nested section (different
        // signal number) from clobbering the outer one's state.
        let outer = self.accessing_pending.swap(true, Ordering::AcqRel);
        if outer {
            log::warn!(
                "reentrant pending-queue access while queuing {}",
                signal_name(sig)
            );
        }
        let outcome = self.pending.enqueue(sig, |node| {
            node.frame = rt;
            fpstate::save_fpstate(&mut node.frame, &mut node.xstate);
            node.use_sigcontext = use_sigcontext;
            node.unblocked = unblocked;
            node.access_address = access_address;
        });
        self.accessing_pending.store(outer, Ordering::Release);

        log::debug!(
            "{} deferred ({:?}, {} pending)",
            signal_name(sig),
            outcome,
            self.pending.pending_count(sig)
        );
        self.notify_signalfd(sig, pc);
    }

    // ---- safe-point drain ------------------------------------------

    /// Deliver deferred signals at a safe point: FIFO within a signal
    /// number, ascending numeric order across numbers, re-checking the
    /// block mask for every entry. Entries whose number has been
    /// (re)blocked since queuing stay queued.
    ///
    /// Must not be invoked from raw signal handler context.
    pub fn drain(
        &mut self,
        cache: &mut impl ExecutionCache,
        mut sink: impl FnMut(DrainEvent),
    ) {
        debug_assert!(!self.accessing_pending.load(Ordering::Acquire));

        // The fragment unlinked for the deferral can be relinked now that
        // the cache is at a safe point
        if let Some((frag, pc)) = self.interrupted.take() {
            log::trace!("relinking interrupted fragment {:?} (pc {:#x})", frag, pc);
            cache.relink(frag);
        }

        while let Some(sig) = self.pending.first_deliverable(self.app_sigblocked) {
            let action = self.handlers.query(sig);

            if action.is_ignore() && is_catchable(sig) {
                // Disposition changed to ignore since queuing
                self.release_front_guarded(sig);
                continue;
            }
            if action.is_default() {
                self.release_front_guarded(sig);
                sink(DrainEvent::Default(sig, default_action(sig)));
                continue;
            }

            let Some(node) = self.pending.front_mut(sig) else {
                break;
            };
            let mut rt = node.frame;
            let xstate = node.xstate;
            if !node.use_sigcontext {
                // Round-trip through the portable snapshot so the app
                // sees the derived context, not the kernel-native one
                // reserved for syscall restart
                let mc = extract_mcontext(&SignalFrame::Rt(rt));
                crate::frame::inject_mcontext(&mut rt, &mc);
            }
            rt.sigcontext_mut().fpstate = 0;
            self.release_front_guarded(sig);

            let forged = self.forge_delivery(sig, rt, xstate, &action);
            sink(DrainEvent::Handler(forged));
        }
    }

    fn release_front_guarded(&mut self, sig: u32) {
        let outer = self.accessing_pending.swap(true, Ordering::AcqRel);
        self.pending.release_front(sig);
        self.accessing_pending.store(outer, Ordering::Release);
    }

    /// Build the frame the app's handler will see. Applies the handler's
    /// mask (plus the signal itself unless SA_NODEFER), selects the app's
    /// sigaltstack when requested, and records the mask sigreturn must
    /// restore, honoring a pending sigsuspend.
    fn forge_delivery(
        &mut self,
        sig: u32,
        mut frame: SigframeRt,
        xstate: XstateBuf,
        action: &KernelSigaction,
    ) -> ForgedDelivery {
        let resume_mask = if self.in_sigsuspend {
            self.in_sigsuspend = false;
            self.app_sigblocked_save
        } else {
            self.app_sigblocked
        };
        frame.uc.uc_sigmask = mask_to_kernel_sigset(resume_mask);

        let mut blocked = self.app_sigblocked | kernel_sigset_to_mask(&action.mask);
        if action.flags & SA_NODEFER == 0 {
            blocked |= sig_mask(sig);
        }
        self.app_sigblocked = blocked & !UNCATCHABLE_SIGNALS;

        if self.restorer_is_valid(sig) {
            frame.pretcode = action.restorer;
        }

        let on_altstack = action.flags & SA_ONSTACK != 0
            && self.app_sigstack.ss_flags as u32 & SS_DISABLE == 0;

        log::debug!(
            "forging {} delivery to handler {:#x}{}",
            signal_name(sig),
            action.handler,
            if on_altstack { " on altstack" } else { "" }
        );

        ForgedDelivery {
            sig,
            handler: action.handler,
            frame,
            xstate,
            on_altstack,
        }
    }

    // ---- introspection ----------------------------------------------

    pub fn pending_count(&self, sig: u32) -> usize {
        self.pending.pending_count(sig)
    }

    pub fn has_pending(&self, sig: u32) -> bool {
        self.pending.has_pending(sig)
    }

    pub fn interrupted_fragment(&self) -> Option<(FragmentHandle, u64)> {
        self.interrupted
    }
}

impl Default for ThreadSigState {
    fn default() -> Self {
        Self::new()
    }
}
