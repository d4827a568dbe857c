//! Behavioral tests for per-thread signal state: receipt, deferral,
//! safe-point draining, sharing, and teardown

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cache::{ExecArea, ExecutionCache, FragmentHandle};
use crate::constants::*;
use crate::disposition::KernelSigaction;
use crate::frame::{Mcontext, SigInfo, SigframeRt, SignalFrame};
use crate::itimer::{ItimerWhich, Itimerval, Timeval};
use crate::sigset::KernelSigset;
use crate::thread_state::{DrainEvent, RawDeliveryAction, ThreadSigState};

#[derive(Default)]
struct MockCache {
    next_frag: u64,
    unlinked: Vec<u64>,
    relinked: Vec<u64>,
}

impl ExecutionCache for MockCache {
    fn interrupt_current_fragment(&mut self) -> Option<(FragmentHandle, u64)> {
        self.next_frag += 1;
        self.unlinked.push(self.next_frag);
        Some((FragmentHandle(self.next_frag), 0x1000 + self.next_frag))
    }

    fn relink(&mut self, frag: FragmentHandle) {
        self.relinked.push(frag.0);
    }

    fn resume_at(&mut self, _translated_pc: u64) {}
}

fn make_frame(sig: u32, ip: u64) -> SignalFrame {
    let mut rt = SigframeRt::zeroed();
    rt.info = SigInfo::for_signal(sig);
    rt.sigcontext_mut().ip = ip;
    rt.sigcontext_mut().sp = 0x7fff_0000;
    SignalFrame::Rt(rt)
}

fn user_action(handler: u64, flags: u64) -> KernelSigaction {
    KernelSigaction {
        handler,
        flags,
        restorer: 0,
        mask: KernelSigset::new(),
    }
}

fn initialized_state() -> ThreadSigState {
    let mut state = ThreadSigState::new();
    state.fresh_init();
    state
}

fn drain_handlers(state: &mut ThreadSigState, cache: &mut MockCache) -> Vec<(u32, u64)> {
    let mut delivered = Vec::new();
    state.drain(cache, |ev| {
        if let DrainEvent::Handler(fd) = ev {
            delivered.push((fd.sig, fd.frame.sigcontext().ip));
        }
    });
    delivered
}

// ---- initialization policy -----------------------------------------

#[test]
fn test_uninitialized_suppresses_nonfatal() {
    let mut state = ThreadSigState::new();
    let mut cache = MockCache::default();
    let act = state
        .handle_raw_delivery(make_frame(SIGCHLD, 0x1), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::Suppressed));
}

#[test]
fn test_uninitialized_squashes_alarms() {
    // Alarm-class signals are almost certainly the engine's own timers;
    // they never fall through to the OS default pre-init
    let mut state = ThreadSigState::new();
    let mut cache = MockCache::default();
    let act = state
        .handle_raw_delivery(make_frame(SIGALRM, 0x1), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::Suppressed));
}

#[test]
fn test_uninitialized_passes_fatal_to_os() {
    let mut state = ThreadSigState::new();
    let mut cache = MockCache::default();
    let act = state
        .handle_raw_delivery(make_frame(SIGTERM, 0x1), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::OsDefault));
}

#[test]
fn test_unrecognized_frame_is_fatal() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    let bogus = SignalFrame::Rt(SigframeRt::zeroed());
    assert!(state
        .handle_raw_delivery(bogus, ExecArea::Native, &mut cache)
        .is_err());
}

// ---- receipt decisions ---------------------------------------------

#[test]
fn test_deliver_now_at_safe_native_point() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGUSR1, user_action(0x4000, 0)).unwrap();

    let act = state
        .handle_raw_delivery(make_frame(SIGUSR1, 0xabc), ExecArea::Native, &mut cache)
        .unwrap();
    let fd = match act {
        RawDeliveryAction::DeliverNow(fd) => fd,
        other => panic!("expected DeliverNow, got {:?}", other),
    };
    assert_eq!(fd.sig, SIGUSR1);
    assert_eq!(fd.handler, 0x4000);
    assert_eq!(fd.frame.sigcontext().ip, 0xabc);
    // Frame carries the pre-delivery mask for sigreturn; the signal is
    // now blocked while its handler runs
    assert!(!fd.frame.uc.uc_sigmask.is_member(SIGUSR1));
    assert!(state.is_blocked(SIGUSR1));

    state.handle_sigreturn(&fd.frame);
    assert!(!state.is_blocked(SIGUSR1));
}

#[test]
fn test_cache_interruption_defers() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGUSR1, user_action(0x4000, 0)).unwrap();

    let act = state
        .handle_raw_delivery(make_frame(SIGUSR1, 0xabc), ExecArea::Cache, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::Deferred));
    assert_eq!(cache.unlinked.len(), 1);
    assert!(state.interrupted_fragment().is_some());
    assert_eq!(state.pending_count(SIGUSR1), 1);

    // Draining relinks the unlinked fragment and delivers
    let delivered = drain_handlers(&mut state, &mut cache);
    assert_eq!(delivered, vec![(SIGUSR1, 0xabc)]);
    assert_eq!(cache.relinked, cache.unlinked);
    assert!(state.interrupted_fragment().is_none());
}

#[test]
fn test_ignored_signal_consumed() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state
        .install(SIGUSR1, user_action(SIG_IGN, 0))
        .unwrap();
    let act = state
        .handle_raw_delivery(make_frame(SIGUSR1, 0x1), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::Suppressed));
    assert_eq!(state.pending_count(SIGUSR1), 0);
}

#[test]
fn test_default_action_bookkeeping_only() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    // Job-control stop: no handler, default bookkeeping falls to the OS
    let act = state
        .handle_raw_delivery(make_frame(SIGTSTP, 0x1), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::OsDefault));
    // Default-ignored class is consumed
    let act = state
        .handle_raw_delivery(make_frame(SIGWINCH, 0x1), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::Suppressed));
}

// ---- drain ordering ------------------------------------------------

#[test]
fn test_drain_fifo_within_signal_number() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    // SA_NODEFER so one drain can deliver the whole burst in order
    state
        .install(SIGRTMIN, user_action(0x4000, SA_NODEFER))
        .unwrap();

    for marker in [0xa, 0xb, 0xc] {
        let act = state
            .handle_raw_delivery(make_frame(SIGRTMIN, marker), ExecArea::Cache, &mut cache)
            .unwrap();
        assert!(matches!(act, RawDeliveryAction::Deferred));
    }
    let delivered = drain_handlers(&mut state, &mut cache);
    assert_eq!(
        delivered,
        vec![(SIGRTMIN, 0xa), (SIGRTMIN, 0xb), (SIGRTMIN, 0xc)]
    );
}

#[test]
fn test_drain_numeric_order_across_numbers() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state
        .install(SIGTRAP, user_action(0x5000, SA_NODEFER))
        .unwrap();
    state
        .install(SIGINT, user_action(0x2000, SA_NODEFER))
        .unwrap();

    // Arrival order 5 then 2; delivery order 2 then 5
    state
        .handle_raw_delivery(make_frame(SIGTRAP, 0x5), ExecArea::Cache, &mut cache)
        .unwrap();
    state
        .handle_raw_delivery(make_frame(SIGINT, 0x2), ExecArea::Cache, &mut cache)
        .unwrap();
    let delivered = drain_handlers(&mut state, &mut cache);
    assert_eq!(delivered, vec![(SIGINT, 0x2), (SIGTRAP, 0x5)]);
}

#[test]
fn test_blocked_entry_stays_queued_across_drain() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGUSR1, user_action(0x4000, 0)).unwrap();

    state
        .handle_raw_delivery(make_frame(SIGUSR1, 0x7), ExecArea::Cache, &mut cache)
        .unwrap();
    state
        .set_app_blocked(SIG_BLOCK, sig_mask(SIGUSR1))
        .unwrap();

    // Blocked since queuing: not delivered, not dropped
    assert!(drain_handlers(&mut state, &mut cache).is_empty());
    assert_eq!(state.pending_count(SIGUSR1), 1);

    state
        .set_app_blocked(SIG_UNBLOCK, sig_mask(SIGUSR1))
        .unwrap();
    let delivered = drain_handlers(&mut state, &mut cache);
    assert_eq!(delivered, vec![(SIGUSR1, 0x7)]);
}

#[test]
fn test_blocked_default_disposition_stays_pending() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state
        .set_app_blocked(SIG_BLOCK, sig_mask(SIGTERM))
        .unwrap();

    // No handler installed: a blocked SIGTERM must queue, not fall
    // through to the OS default while blocked
    let act = state
        .handle_raw_delivery(make_frame(SIGTERM, 0x77), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::Deferred));
    assert_eq!(state.pending_count(SIGTERM), 1);

    // The app installs a handler and unblocks before anything fatal
    state.install(SIGTERM, user_action(0x4000, 0)).unwrap();
    state
        .set_app_blocked(SIG_UNBLOCK, sig_mask(SIGTERM))
        .unwrap();
    let delivered = drain_handlers(&mut state, &mut cache);
    assert_eq!(delivered, vec![(SIGTERM, 0x77)]);
}

#[test]
fn test_disposition_change_to_default_reported_at_drain() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGUSR2, user_action(0x4000, 0)).unwrap();
    state
        .handle_raw_delivery(make_frame(SIGUSR2, 0x1), ExecArea::Cache, &mut cache)
        .unwrap();

    // App reinstalled SIG_DFL before the safe point
    state
        .install(SIGUSR2, KernelSigaction::DEFAULT)
        .unwrap();
    let mut defaults = Vec::new();
    state.drain(&mut cache, |ev| {
        if let DrainEvent::Default(sig, action) = ev {
            defaults.push((sig, action));
        }
    });
    assert_eq!(defaults, vec![(SIGUSR2, SignalDefaultAction::Terminate)]);
    assert_eq!(state.pending_count(SIGUSR2), 0);
}

// ---- masks and sigsuspend ------------------------------------------

#[test]
fn test_sigprocmask_emulation() {
    let mut state = initialized_state();
    let old = state
        .set_app_blocked(SIG_BLOCK, sig_mask(SIGINT) | sig_mask(SIGKILL))
        .unwrap();
    assert_eq!(old, 0);
    // SIGKILL can never be blocked
    assert!(state.is_blocked(SIGINT));
    assert!(!state.is_blocked(SIGKILL));

    let old = state.set_app_blocked(SIG_SETMASK, sig_mask(SIGTERM)).unwrap();
    assert_eq!(old, sig_mask(SIGINT));
    assert!(state.is_blocked(SIGTERM));
    assert!(!state.is_blocked(SIGINT));
    assert_eq!(
        state.set_app_blocked(99, 0),
        Err(crate::error::SignalError::InvalidMaskHow(99))
    );
}

#[test]
fn test_uncatchable_install_rejected() {
    use crate::error::SignalError;
    let mut state = initialized_state();
    assert_eq!(
        state.install(SIGKILL, user_action(0x4000, 0)),
        Err(SignalError::InvalidSignal(SIGKILL))
    );
    assert_eq!(
        state.install(SIGSTOP, user_action(0x4000, 0)),
        Err(SignalError::InvalidSignal(SIGSTOP))
    );
    // Dispositions untouched
    assert!(state.query(SIGKILL).unwrap().is_default());
}

#[test]
fn test_pre_syscall_mask_restore() {
    let mut state = initialized_state();
    state.set_app_blocked(SIG_BLOCK, sig_mask(SIGINT)).unwrap();
    state.begin_syscall(sig_mask(SIGINT));

    // Emulation mutated the mask, then the syscall failed
    state.set_app_blocked(SIG_SETMASK, sig_mask(SIGTERM)).unwrap();
    let app_view = state.abort_syscall();
    assert_eq!(app_view, sig_mask(SIGINT));
    assert!(state.is_blocked(SIGINT));
    assert!(!state.is_blocked(SIGTERM));
}

#[test]
fn test_sigsuspend_mask_restored_on_delivery() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGUSR1, user_action(0x4000, 0)).unwrap();
    state
        .set_app_blocked(SIG_BLOCK, sig_mask(SIGUSR1) | sig_mask(SIGUSR2))
        .unwrap();

    // sigsuspend temporarily unblocks SIGUSR1
    state.enter_sigsuspend(sig_mask(SIGUSR2));
    let act = state
        .handle_raw_delivery(make_frame(SIGUSR1, 0x9), ExecArea::Native, &mut cache)
        .unwrap();
    let fd = match act {
        RawDeliveryAction::DeliverNow(fd) => fd,
        other => panic!("expected DeliverNow, got {:?}", other),
    };
    // The forged frame restores the pre-suspend mask at sigreturn
    assert!(fd.frame.uc.uc_sigmask.is_member(SIGUSR1));
    assert!(fd.frame.uc.uc_sigmask.is_member(SIGUSR2));
    state.handle_sigreturn(&fd.frame);
    assert!(state.is_blocked(SIGUSR1));
    assert!(state.is_blocked(SIGUSR2));
}

// ---- itimer routing ------------------------------------------------

static ENGINE_ALARMS: AtomicUsize = AtomicUsize::new(0);

fn count_engine_alarm(_mc: &mut Mcontext) {
    ENGINE_ALARMS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_engine_itimer_firing_consumed() {
    ENGINE_ALARMS.store(0, Ordering::SeqCst);
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.itimers.with_mut(|b| {
        b.set_engine(ItimerWhich::Real, 30_000, 30_000, Some(count_engine_alarm), None);
    });

    let act = state
        .handle_raw_delivery(make_frame(SIGALRM, 0x1), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::Suppressed));
    assert_eq!(ENGINE_ALARMS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_app_itimer_firing_delivered() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGALRM, user_action(0x4000, 0)).unwrap();
    state
        .set_itimer(
            0, // ITIMER_REAL
            Itimerval {
                it_interval: Timeval::from_micros(50_000),
                it_value: Timeval::from_micros(50_000),
            },
        )
        .unwrap();

    let act = state
        .handle_raw_delivery(make_frame(SIGALRM, 0x2), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::DeliverNow(_)));
    // get/set emulation reports the armed value back
    let cur = state.get_itimer(0).unwrap();
    assert_eq!(cur.it_interval.to_micros(), 50_000);
}

#[test]
fn test_externally_sent_alarm_is_apps() {
    // No itimer armed: a kill(SIGALRM) belongs entirely to the app
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGALRM, user_action(0x4000, 0)).unwrap();
    let act = state
        .handle_raw_delivery(make_frame(SIGALRM, 0x3), ExecArea::Native, &mut cache)
        .unwrap();
    assert!(matches!(act, RawDeliveryAction::DeliverNow(_)));
}

#[test]
fn test_suspend_resume_all_app_itimers() {
    let mut state = initialized_state();
    state
        .set_itimer(
            0,
            Itimerval {
                it_interval: Timeval::zero(),
                it_value: Timeval::from_micros(80_000),
            },
        )
        .unwrap();
    state.suspend_app_itimers();
    assert!(state.get_itimer(0).unwrap().is_disabled());
    state.resume_app_itimers();
    assert_eq!(state.get_itimer(0).unwrap().it_value.to_micros(), 80_000);
}

// ---- sharing and lifecycle -----------------------------------------

#[test]
fn test_clone_sighand_shares_dispositions() {
    let mut parent = initialized_state();
    let mut child = ThreadSigState::new();
    parent.begin_clone();
    assert_eq!(parent.unstarted_children(), 1);

    child.thread_inherit(&mut parent, CLONE_SIGHAND);
    assert_eq!(parent.unstarted_children(), 0);
    assert!(child.is_fully_initialized());
    assert!(parent.handlers.is_shared());

    child.install(SIGTERM, user_action(0xbeef, 0)).unwrap();
    assert_eq!(parent.query(SIGTERM).unwrap().handler, 0xbeef);
}

#[test]
fn test_plain_clone_copies_dispositions() {
    let mut parent = initialized_state();
    parent.install(SIGTERM, user_action(0x111, 0)).unwrap();
    parent.begin_clone();

    let mut child = ThreadSigState::new();
    child.thread_inherit(&mut parent, 0);
    assert!(!parent.handlers.is_shared());
    assert_eq!(child.query(SIGTERM).unwrap().handler, 0x111);

    child.install(SIGTERM, user_action(0x222, 0)).unwrap();
    assert_eq!(parent.query(SIGTERM).unwrap().handler, 0x111);
}

#[test]
fn test_clone_thread_shares_itimers_not_handlers() {
    let mut parent = initialized_state();
    let mut child = ThreadSigState::new();
    parent.begin_clone();
    child.thread_inherit(&mut parent, CLONE_THREAD);
    assert!(parent.itimers.is_shared());
    assert!(!parent.handlers.is_shared());
    assert_eq!(parent.itimers.ref_count(), 2);
}

#[test]
fn test_fork_init_unshares() {
    let mut parent = initialized_state();
    let mut child = ThreadSigState::new();
    parent.begin_clone();
    child.thread_inherit(&mut parent, CLONE_SIGHAND | CLONE_THREAD);
    assert_eq!(parent.handlers.ref_count(), 2);

    child.fork_init();
    assert!(!child.handlers.is_shared());
    assert!(!child.itimers.is_shared());
    assert_eq!(parent.handlers.ref_count(), 1);
}

#[test]
fn test_thread_exit_releases_everything() {
    let mut parent = initialized_state();
    let mut cache = MockCache::default();
    let mut child = ThreadSigState::new();
    parent.begin_clone();
    child.thread_inherit(&mut parent, CLONE_SIGHAND | CLONE_THREAD);

    // Leave a deferral unflushed; exit frees it without delivering
    child.install(SIGUSR1, user_action(0x4000, 0)).unwrap();
    child
        .handle_raw_delivery(make_frame(SIGUSR1, 0x1), ExecArea::Cache, &mut cache)
        .unwrap();
    assert_eq!(child.pending_count(SIGUSR1), 1);

    child.thread_exit();
    assert_eq!(child.pending_count(SIGUSR1), 0);
    assert_eq!(parent.handlers.ref_count(), 1);
    assert_eq!(parent.itimers.ref_count(), 1);
}

// ---- notification channel ------------------------------------------

#[test]
fn test_signalfd_mirrors_deferred_delivery() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGUSR1, user_action(0x4000, 0)).unwrap();

    let pipe = state.create_signalfd(SIGUSR1).unwrap();
    assert!(!pipe.readable());

    state
        .handle_raw_delivery(make_frame(SIGUSR1, 0xfeed), ExecArea::Cache, &mut cache)
        .unwrap();
    let token = pipe.poll().expect("deferred delivery not mirrored");
    assert_eq!(token.sig, SIGUSR1);
    assert_eq!(token.pc, 0xfeed);
    assert!(pipe.poll().is_none());
}

#[test]
fn test_signalfd_mirrors_synchronous_delivery() {
    let mut state = initialized_state();
    let mut cache = MockCache::default();
    state.install(SIGUSR2, user_action(0x4000, 0)).unwrap();
    let pipe = state.create_signalfd(SIGUSR2).unwrap();

    state
        .handle_raw_delivery(make_frame(SIGUSR2, 0xf00), ExecArea::Native, &mut cache)
        .unwrap();
    assert_eq!(pipe.poll().unwrap().pc, 0xf00);
}

#[test]
fn test_signalfd_created_lazily_once() {
    use alloc::sync::Arc;
    let mut state = initialized_state();
    let a = state.create_signalfd(SIGTERM).unwrap();
    let b = state.create_signalfd(SIGTERM).unwrap();
    assert!(core::ptr::eq(&*a, &*b));
    // Thread slot + our two clones
    assert_eq!(Arc::strong_count(&a), 3);
    state.thread_exit();
    assert_eq!(Arc::strong_count(&a), 2);
}

#[test]
fn test_signalfd_invalid_signal_rejected() {
    let mut state = initialized_state();
    assert!(state.create_signalfd(0).is_err());
    assert!(state.create_signalfd(NSIG + 1).is_err());
}
