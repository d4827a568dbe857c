//! Kernel-ABI signal sets and conversion to the portable bitmap form
//!
//! The kernel's sigset is a fixed-width bit vector with 1-based signal
//! numbering. We store it as little-endian 32-bit words: byte layout is
//! identical to the kernel's single-64-bit-word layout on x86_64, and the
//! word-splitting arithmetic stays exercised on every target (it is the
//! real layout on 32-bit).
//!
//! The portable form used everywhere else in the engine is a plain `u64`
//! bitmap manipulated with [`sig_mask`](crate::constants::sig_mask).

use crate::constants::{is_valid_signal, sig_mask, NSIG};

/// Bits per sigset word
pub const SIGSET_BPW: u32 = 32;
/// Words in a kernel sigset
pub const SIGSET_WORDS: usize = ((NSIG + SIGSET_BPW - 1) / SIGSET_BPW) as usize;

/// Kernel-layout signal set (bit n-1 set == signal n is a member)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelSigset {
    sig: [u32; SIGSET_WORDS],
}

impl KernelSigset {
    /// Empty set (no members)
    pub const fn new() -> Self {
        KernelSigset {
            sig: [0; SIGSET_WORDS],
        }
    }

    /// Remove all signals from the set
    #[inline]
    pub fn clear(&mut self) {
        self.sig = [0; SIGSET_WORDS];
    }

    /// Add every signal to the set
    #[inline]
    pub fn fill(&mut self) {
        self.sig = [!0; SIGSET_WORDS];
    }

    /// Add a signal to the set
    ///
    /// Invalid signal numbers are ignored
    #[inline]
    pub fn add(&mut self, sig: u32) {
        if !is_valid_signal(sig) {
            return;
        }
        let bit = sig - 1;
        self.sig[(bit / SIGSET_BPW) as usize] |= 1u32 << (bit % SIGSET_BPW);
    }

    /// Remove a signal from the set
    #[inline]
    pub fn remove(&mut self, sig: u32) {
        if !is_valid_signal(sig) {
            return;
        }
        let bit = sig - 1;
        self.sig[(bit / SIGSET_BPW) as usize] &= !(1u32 << (bit % SIGSET_BPW));
    }

    /// Test membership
    #[inline]
    pub fn is_member(&self, sig: u32) -> bool {
        if !is_valid_signal(sig) {
            return false;
        }
        let bit = sig - 1;
        (self.sig[(bit / SIGSET_BPW) as usize] >> (bit % SIGSET_BPW)) & 1 != 0
    }

    /// Raw words, for writing the set into a kernel frame
    #[inline]
    pub fn words(&self) -> &[u32; SIGSET_WORDS] {
        &self.sig
    }
}

/// Convert a kernel sigset to the engine's portable bitmap.
///
/// Done the slow per-signal way: conversions happen only at syscall
/// boundaries, and this makes no assumptions about word layout.
pub fn kernel_sigset_to_mask(kset: &KernelSigset) -> u64 {
    let mut mask = 0u64;
    for sig in 1..=NSIG {
        if kset.is_member(sig) {
            mask |= sig_mask(sig);
        }
    }
    mask
}

/// Convert the engine's portable bitmap to a kernel sigset.
pub fn mask_to_kernel_sigset(mask: u64) -> KernelSigset {
    let mut kset = KernelSigset::new();
    for sig in 1..=NSIG {
        if mask & sig_mask(sig) != 0 {
            kset.add(sig);
        }
    }
    kset
}
