//! Extended floating-point/vector state attached to signal frames
//!
//! We never execute xsave on the app's behalf, but the kernel performs the
//! restore on sigreturn, so frame-attached state must obey the alignment
//! the kernel expects: 64 bytes when AVX state is in play, 16 otherwise.
//! Capability detection runs once at startup; storage always reserves the
//! worst case because pool layout cannot change afterwards.

use conquer_once::spin::OnceCell;

use crate::frame::SigframeRt;

/// Alignment of a legacy fxsave area
pub const FPSTATE_ALIGNMENT: usize = 16;
/// Alignment the kernel requires once AVX state is present
pub const AVX_ALIGNMENT: usize = 64;

/// Worst-case xsave area we reserve per pending-signal slot.
/// Covers x87+SSE (512) plus the xsave header and AVX/AVX-512 components.
pub const XSTATE_BUFFER_SIZE: usize = 2688;

/// xsave request mask: x87, SSE, and AVX component bits
#[cfg(target_arch = "x86_64")]
const XSTATE_COMPONENT_MASK: u64 = 0x7;

static YMM_ENABLED: OnceCell<bool> = OnceCell::uninit();

#[cfg(target_arch = "x86_64")]
fn detect_ymm() -> bool {
    // CPUID.1:ECX bit 27 = OSXSAVE, bit 28 = AVX. XGETBV faults unless the
    // OS has set OSXSAVE, so check that first.
    let cpuid = unsafe { core::arch::x86_64::__cpuid(1) };
    let osxsave = cpuid.ecx & (1 << 27) != 0;
    let avx = cpuid.ecx & (1 << 28) != 0;
    if !osxsave || !avx {
        return false;
    }
    use x86_64::registers::xcontrol::{XCr0, XCr0Flags};
    XCr0::read().contains(XCr0Flags::AVX)
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_ymm() -> bool {
    false
}

/// Whether the OS/CPU pair has AVX state enabled. Detected once.
pub fn ymm_enabled() -> bool {
    let _ = YMM_ENABLED.try_init_once(detect_ymm);
    YMM_ENABLED.try_get().map(|b| *b).unwrap_or(false)
}

/// Alignment required for a frame-attached fpstate block
#[inline]
pub fn xstate_alignment() -> usize {
    if ymm_enabled() {
        AVX_ALIGNMENT
    } else {
        FPSTATE_ALIGNMENT
    }
}

/// Worst-case-aligned buffer holding a frame's fpstate/xstate block
///
/// Aligned to the wide requirement unconditionally so a pending-signal slot
/// laid out before detection ran is still usable afterwards.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct XstateBuf {
    data: [u8; XSTATE_BUFFER_SIZE],
}

impl XstateBuf {
    pub const fn zeroed() -> Self {
        XstateBuf {
            data: [0; XSTATE_BUFFER_SIZE],
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }
}

impl core::fmt::Debug for XstateBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "XstateBuf({} bytes)", XSTATE_BUFFER_SIZE)
    }
}

/// Capture the current vector state into `buf` and point the frame's raw
/// context at it.
///
/// Always called as part of producing an rt frame for the queue, never on
/// its own, so frame and fpstate cannot go out of sync.
pub fn save_fpstate(frame: &mut SigframeRt, buf: &mut XstateBuf) {
    capture(buf);
    frame.sigcontext_mut().fpstate = buf.as_ptr() as u64;
}

/// Re-point a forged frame at the fpstate block captured when the signal
/// was queued. The kernel (or our emulated sigreturn) performs the actual
/// register restore from there.
pub fn attach_fpstate(frame: &mut SigframeRt, buf: &XstateBuf) {
    frame.sigcontext_mut().fpstate = buf.as_ptr() as u64;
}

#[cfg(target_arch = "x86_64")]
fn capture(buf: &mut XstateBuf) {
    debug_assert_eq!(buf.as_ptr() as usize % AVX_ALIGNMENT, 0);
    unsafe {
        if ymm_enabled() {
            core::arch::x86_64::_xsave64(buf.as_mut_ptr(), XSTATE_COMPONENT_MASK);
        } else {
            core::arch::x86_64::_fxsave64(buf.as_mut_ptr());
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn capture(_buf: &mut XstateBuf) {}
