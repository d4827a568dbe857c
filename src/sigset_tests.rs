//! Unit tests for kernel sigset operations and portable conversions

use crate::constants::*;
use crate::sigset::*;

#[test]
fn test_add_then_member() {
    let mut set = KernelSigset::new();
    for sig in 1..=NSIG {
        assert!(!set.is_member(sig), "fresh set claims sig {}", sig);
        set.add(sig);
        assert!(set.is_member(sig), "add lost sig {}", sig);
    }
}

#[test]
fn test_remove_then_not_member() {
    let mut set = KernelSigset::new();
    set.fill();
    for sig in 1..=NSIG {
        set.remove(sig);
        assert!(!set.is_member(sig), "remove kept sig {}", sig);
    }
}

#[test]
fn test_word_boundary_signals() {
    // Bits for these straddle the word split: signal 32 is the last bit
    // of word 0, signal 33 the first bit of word 1
    let boundary = SIGSET_BPW;
    let mut set = KernelSigset::new();
    set.add(boundary);
    set.add(boundary + 1);
    assert!(set.is_member(boundary));
    assert!(set.is_member(boundary + 1));
    assert!(!set.is_member(boundary - 1));
    assert!(!set.is_member(boundary + 2));
    set.remove(boundary);
    assert!(!set.is_member(boundary));
    assert!(set.is_member(boundary + 1));
}

#[test]
fn test_invalid_signals_ignored() {
    let mut set = KernelSigset::new();
    set.add(0);
    set.add(NSIG + 1);
    assert_eq!(set, KernelSigset::new());
    assert!(!set.is_member(0));
    assert!(!set.is_member(NSIG + 1));
}

#[test]
fn test_fill_and_clear() {
    let mut set = KernelSigset::new();
    set.fill();
    for sig in 1..=NSIG {
        assert!(set.is_member(sig));
    }
    set.clear();
    for sig in 1..=NSIG {
        assert!(!set.is_member(sig));
    }
}

#[test]
fn test_mask_roundtrip() {
    let mask = sig_mask(SIGINT) | sig_mask(SIGSEGV) | sig_mask(SIGRTMIN) | sig_mask(SIGRTMAX);
    let kset = mask_to_kernel_sigset(mask);
    assert!(kset.is_member(SIGINT));
    assert!(kset.is_member(SIGSEGV));
    assert!(kset.is_member(SIGRTMIN));
    assert!(kset.is_member(SIGRTMAX));
    assert_eq!(kernel_sigset_to_mask(&kset), mask);
}

#[test]
fn test_kernel_layout_matches_single_word_form() {
    // Byte-for-byte the split-word set must equal the kernel's one
    // 64-bit word on little-endian
    let mask = sig_mask(SIGHUP) | sig_mask(SIGSET_BPW) | sig_mask(SIGSET_BPW + 1) | sig_mask(NSIG);
    let kset = mask_to_kernel_sigset(mask);
    let mut raw = 0u64;
    for (i, word) in kset.words().iter().enumerate() {
        raw |= (*word as u64) << (i as u32 * SIGSET_BPW);
    }
    assert_eq!(raw, mask);
}

#[test]
fn test_signal_numbers_match_host_abi() {
    assert_eq!(SIGHUP as i32, libc::SIGHUP);
    assert_eq!(SIGKILL as i32, libc::SIGKILL);
    assert_eq!(SIGSEGV as i32, libc::SIGSEGV);
    assert_eq!(SIGALRM as i32, libc::SIGALRM);
    assert_eq!(SIGVTALRM as i32, libc::SIGVTALRM);
    assert_eq!(SIGPROF as i32, libc::SIGPROF);
    assert_eq!(SIGSYS as i32, libc::SIGSYS);
}
