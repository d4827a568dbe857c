//! Unit tests for disposition tables and clone-group sharing

use crate::constants::*;
use crate::disposition::*;

fn user_action(handler: u64) -> KernelSigaction {
    KernelSigaction {
        handler,
        flags: SA_SIGINFO,
        restorer: 0,
        mask: crate::sigset::KernelSigset::new(),
    }
}

#[test]
fn test_install_returns_previous_action() {
    let mut h = Handlers::new_private();
    let old = h.install(SIGUSR1, user_action(0x1000));
    assert!(old.is_default());
    let old = h.install(SIGUSR1, user_action(0x2000));
    assert_eq!(old.handler, 0x1000);
    assert_eq!(h.query(SIGUSR1).handler, 0x2000);
}

#[test]
fn test_invalid_signal_queries_default() {
    let h = Handlers::new_private();
    assert!(h.query(0).is_default());
    assert!(h.query(NSIG + 1).is_default());
}

#[test]
fn test_shared_install_visible_to_sibling() {
    let mut parent = Handlers::new_private();
    let mut child = parent.adopt_shared();
    assert!(parent.is_shared());
    assert!(child.is_shared());

    // No explicit transfer: one sibling's install is the other's query
    parent.install(SIGTERM, user_action(0xabc));
    assert_eq!(child.query(SIGTERM).handler, 0xabc);
    child.install(SIGTERM, user_action(0xdef));
    assert_eq!(parent.query(SIGTERM).handler, 0xdef);
}

#[test]
fn test_fork_copy_is_independent() {
    let mut parent = Handlers::new_private();
    parent.install(SIGINT, user_action(0x111));
    let mut child = parent.fork_copy();
    assert_eq!(child.query(SIGINT).handler, 0x111);

    child.install(SIGINT, user_action(0x222));
    assert_eq!(parent.query(SIGINT).handler, 0x111);
    assert_eq!(child.query(SIGINT).handler, 0x222);
}

#[test]
fn test_refcount_frees_exactly_once_after_nth_release() {
    let mut parent = Handlers::new_private();
    const N: usize = 4;
    let mut siblings = Vec::new();
    for _ in 0..N {
        siblings.push(parent.adopt_shared());
    }
    assert_eq!(parent.ref_count(), N + 1);

    // Releasing N siblings must never free the table under the parent
    for (i, sib) in siblings.into_iter().enumerate() {
        sib.release();
        assert_eq!(parent.ref_count(), N - i);
        // Table still intact for the survivor
        assert!(parent.query(SIGUSR2).is_default());
    }
    assert_eq!(parent.ref_count(), 1);
    parent.release();
}

#[test]
fn test_intercept_flags_shared_with_table() {
    let mut parent = Handlers::new_private();
    let child = parent.adopt_shared();
    parent.set_intercept(SIGSEGV, true);
    assert!(child.intercepted(SIGSEGV));
    assert!(!child.intercepted(SIGBUS));
}

#[test]
fn test_uncatchable_classification() {
    assert!(!is_catchable(SIGKILL));
    assert!(!is_catchable(SIGSTOP));
    assert!(is_catchable(SIGINT));
    assert_eq!(
        UNCATCHABLE_SIGNALS,
        sig_mask(SIGKILL) | sig_mask(SIGSTOP)
    );
}
