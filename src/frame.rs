//! Signal frame shapes and translation to the portable machine context
//!
//! The kernel constructs one of two frame shapes on the interrupted stack:
//! the legacy plain shape and the rt shape carrying full siginfo plus an
//! extensible ucontext. The raw layouts are fixed by the host ABI and must
//! be reproduced bit-for-bit; a mismatch corrupts the monitored program,
//! not just the engine. Everything downstream of this module operates on
//! [`Mcontext`], the engine's own snapshot type.
//!
//! Deferred signals are retained in rt form right up until delivery, so a
//! plain frame is upgraded before it is queued. On x86_64 the kernel only
//! ever hands us rt frames and the upgrade path is the identity.

use crate::constants::is_valid_signal;
use crate::error::SignalError;
use crate::sigset::KernelSigset;

/// Size of the return-trampoline code carried in legacy frames
pub const RETCODE_SIZE: usize = 8;

/// Alternate signal stack descriptor (matches Linux stack_t)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct StackT {
    /// Base address of the alternate stack
    pub ss_sp: u64,
    /// Flags (SS_ONSTACK, SS_DISABLE)
    pub ss_flags: i32,
    /// Padding for alignment
    pub _pad: i32,
    /// Size of the alternate stack in bytes
    pub ss_size: usize,
}

impl Default for StackT {
    fn default() -> Self {
        StackT {
            ss_sp: 0,
            ss_flags: crate::constants::SS_DISABLE as i32,
            _pad: 0,
            ss_size: 0,
        }
    }
}

/// Kernel's sigcontext as written into a frame (x86_64 layout)
///
/// Field order matches asm/sigcontext.h exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub di: u64,
    pub si: u64,
    pub bp: u64,
    pub bx: u64,
    pub dx: u64,
    pub ax: u64,
    pub cx: u64,
    pub sp: u64,
    pub ip: u64,
    pub flags: u64,
    pub cs: u16,
    pub gs: u16,
    pub fs: u16,
    pub ss: u16,
    pub err: u64,
    pub trapno: u64,
    /// Mask in effect when the signal was raised (legacy single word)
    pub oldmask: u64,
    /// Faulting address for fault-class signals
    pub cr2: u64,
    /// Pointer to the out-of-line fpstate/xstate block, 0 if none
    pub fpstate: u64,
    pub reserved1: [u64; 8],
}

impl SigContext {
    pub fn zeroed() -> Self {
        // SAFETY: all fields are plain integers; all-zero is a valid value
        unsafe { core::mem::zeroed() }
    }
}

/// Kernel's notion of ucontext (differs from libc's)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelUcontext {
    pub uc_flags: u64,
    pub uc_link: u64,
    pub uc_stack: StackT,
    pub uc_mcontext: SigContext,
    /// Mask last, for extensibility
    pub uc_sigmask: KernelSigset,
}

impl KernelUcontext {
    pub fn zeroed() -> Self {
        // SAFETY: plain integers throughout
        unsafe { core::mem::zeroed() }
    }
}

/// Fixed-size siginfo as the kernel delivers it (128 bytes)
///
/// Only the leading fields and the fault address are consumed; the rest
/// of the union is carried opaquely so forged frames stay bit-faithful.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    _pad0: i32,
    /// First union slot; the faulting address for SIGSEGV/SIGBUS
    pub si_addr: u64,
    _pad: [u64; 13],
}

impl SigInfo {
    pub fn zeroed() -> Self {
        // SAFETY: plain integers throughout
        unsafe { core::mem::zeroed() }
    }

    pub fn for_signal(sig: u32) -> Self {
        let mut info = Self::zeroed();
        info.si_signo = sig as i32;
        info
    }
}

/// Legacy plain frame shape (no siginfo)
///
/// Only ever received on old kernels/ILP32; we construct these when forging
/// a delivery to a handler installed without SA_SIGINFO but never hand one
/// back to the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigframePlain {
    /// Return trampoline the handler's `ret` lands on
    pub pretcode: u64,
    pub sig: i32,
    _pad0: i32,
    pub sc: SigContext,
    pub retcode: [u8; RETCODE_SIZE],
    /// Copy of `sig` the app cannot clobber through handler arguments
    pub sig_noclobber: i32,
    _pad1: i32,
}

impl SigframePlain {
    pub fn zeroed() -> Self {
        // SAFETY: plain integers throughout
        unsafe { core::mem::zeroed() }
    }

    pub fn new(sig: u32, sc: SigContext) -> Self {
        let mut f = Self::zeroed();
        f.sig = sig as i32;
        f.sig_noclobber = sig as i32;
        f.sc = sc;
        f
    }
}

/// Rt frame shape (full siginfo plus ucontext), x86_64 field order
///
/// This is the only shape ever retained once a deferral decision is made.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SigframeRt {
    pub pretcode: u64,
    pub uc: KernelUcontext,
    pub info: SigInfo,
}

impl SigframeRt {
    pub fn zeroed() -> Self {
        // SAFETY: plain integers throughout
        unsafe { core::mem::zeroed() }
    }

    pub fn sig(&self) -> u32 {
        self.info.si_signo as u32
    }

    /// The raw context embedded in the frame, no copy (delivery path)
    #[inline]
    pub fn sigcontext(&self) -> &SigContext {
        &self.uc.uc_mcontext
    }

    #[inline]
    pub fn sigcontext_mut(&mut self) -> &mut SigContext {
        &mut self.uc.uc_mcontext
    }

    /// Reject a frame we cannot safely interpret.
    ///
    /// Resuming from an unverifiable context would corrupt the monitored
    /// program's machine state, which is worse than aborting the current
    /// operation.
    pub fn validate(&self) -> Result<(), SignalError> {
        if !is_valid_signal(self.sig()) {
            return Err(SignalError::UnrecognizedFrame);
        }
        Ok(())
    }
}

/// The two on-the-wire frame shapes
#[derive(Debug, Clone, Copy)]
pub enum SignalFrame {
    Plain(SigframePlain),
    Rt(SigframeRt),
}

impl SignalFrame {
    pub fn sig(&self) -> u32 {
        match self {
            SignalFrame::Plain(f) => f.sig as u32,
            SignalFrame::Rt(f) => f.sig(),
        }
    }

    /// Upgrade to the rt shape; identity if already rt.
    ///
    /// A plain frame carries no siginfo, so one is synthesized from the
    /// signal number, and the legacy single-word mask is widened into the
    /// ucontext's sigset.
    pub fn into_rt(self) -> SigframeRt {
        match self {
            SignalFrame::Rt(f) => f,
            SignalFrame::Plain(p) => {
                let mut f = SigframeRt::zeroed();
                f.pretcode = p.pretcode;
                f.info = SigInfo::for_signal(p.sig as u32);
                f.uc.uc_mcontext = p.sc;
                f.uc.uc_sigmask = crate::sigset::mask_to_kernel_sigset(p.sc.oldmask);
                f
            }
        }
    }
}

/// Portable machine-state snapshot, independent of any frame shape
///
/// Sufficient to resume execution or redirect it into the execution cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mcontext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Fill a portable snapshot from a raw context. Never fails.
pub fn sigcontext_to_mcontext(mc: &mut Mcontext, sc: &SigContext) {
    mc.rax = sc.ax;
    mc.rbx = sc.bx;
    mc.rcx = sc.cx;
    mc.rdx = sc.dx;
    mc.rsi = sc.si;
    mc.rdi = sc.di;
    mc.rbp = sc.bp;
    mc.rsp = sc.sp;
    mc.r8 = sc.r8;
    mc.r9 = sc.r9;
    mc.r10 = sc.r10;
    mc.r11 = sc.r11;
    mc.r12 = sc.r12;
    mc.r13 = sc.r13;
    mc.r14 = sc.r14;
    mc.r15 = sc.r15;
    mc.rip = sc.ip;
    mc.rflags = sc.flags;
}

/// Write a portable snapshot back into a raw context, in place.
///
/// Segment selectors, fault bookkeeping, and the fpstate pointer are left
/// untouched; the caller owns those.
pub fn mcontext_to_sigcontext(sc: &mut SigContext, mc: &Mcontext) {
    sc.ax = mc.rax;
    sc.bx = mc.rbx;
    sc.cx = mc.rcx;
    sc.dx = mc.rdx;
    sc.si = mc.rsi;
    sc.di = mc.rdi;
    sc.bp = mc.rbp;
    sc.sp = mc.rsp;
    sc.r8 = mc.r8;
    sc.r9 = mc.r9;
    sc.r10 = mc.r10;
    sc.r11 = mc.r11;
    sc.r12 = mc.r12;
    sc.r13 = mc.r13;
    sc.r14 = mc.r14;
    sc.r15 = mc.r15;
    sc.ip = mc.rip;
    sc.flags = mc.rflags;
}

/// Extract the portable snapshot from either frame shape.
///
/// Tolerates both shapes by normalizing through the rt shape first.
pub fn extract_mcontext(frame: &SignalFrame) -> Mcontext {
    let rt = frame.into_rt();
    let mut mc = Mcontext::default();
    sigcontext_to_mcontext(&mut mc, rt.sigcontext());
    mc
}

/// Overwrite the raw context of a forged frame from a portable snapshot.
///
/// Forged frames are always rt-shaped, even if the original interruption
/// arrived as a plain frame.
pub fn inject_mcontext(frame: &mut SigframeRt, mc: &Mcontext) {
    mcontext_to_sigcontext(frame.sigcontext_mut(), mc);
}
