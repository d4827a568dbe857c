//! Narrow seams to the execution cache
//!
//! The signal core only needs two things from the fragment generator and
//! linker: unlink the fragment a signal interrupted (and report its
//! handle, so the deferral record can relink it on resume), and resume
//! execution at a translated program counter.

/// Opaque handle to a cache-resident code fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHandle(pub u64);

/// Where the thread was when the signal interrupted it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecArea {
    /// Inside cache-resident translated code; delivery must be deferred
    /// until the fragment is cleanly unlinked
    Cache,
    /// Inside an emulated syscall; the kernel-native context must be used
    /// to restart it correctly
    Syscall,
    /// Native app or engine code at a point where immediate forgery is safe
    Native,
}

/// What the signal core consumes from the execution cache
pub trait ExecutionCache {
    /// Unlink the fragment the thread is currently executing, if any,
    /// returning its handle and the interrupted pc within it.
    fn interrupt_current_fragment(&mut self) -> Option<(FragmentHandle, u64)>;

    /// Relink a fragment previously unlinked for a deferral.
    fn relink(&mut self, frag: FragmentHandle);

    /// Resume execution at a translated program counter.
    fn resume_at(&mut self, translated_pc: u64);
}
