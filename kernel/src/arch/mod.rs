//! Architecture support.
//!
//! Everything that touches CSRs, MMIO or inline assembly lives below
//! `arch::riscv` and is compiled for the riscv64 target only. The small
//! set of primitives the portable kernel code needs (interrupt masking,
//! hart id, fences) has host fallbacks so the crate builds and unit-tests
//! on the host target.

#[cfg(target_arch = "riscv64")]
pub mod riscv;

use spin::Once;

/// The board personality, detected at boot from the SBI machine ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    /// QEMU `virt` machine: 8-bit UART registers, S-mode PLIC context
    /// `2h + 1`.
    QemuVirt,
    /// VisionFive 2 (SiFive U74 / JH7110): UART register offsets shifted
    /// left by two and accessed as 32-bit words, S-mode PLIC context `2h`.
    VisionFive2,
}

static BOARD: Once<Board> = Once::new();

/// Record the detected board. Called once by the boot hart before any
/// driver init.
pub fn set_board(board: Board) {
    BOARD.call_once(|| board);
}

pub fn board() -> Board {
    *BOARD.get().unwrap_or(&Board::QemuVirt)
}

/// Callee-saved register context for cooperative kernel switches.
///
/// Only `ra`, `sp` and `s0..s11` are saved; everything else is dead across
/// a call to `swtch` by the calling convention.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s: [usize; 12],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}

// ---------------------------------------------------------------------------
// Portable primitives (riscv64 implementations, host shims for unit tests)
// ---------------------------------------------------------------------------

/// Enable supervisor interrupts on this hart.
#[cfg(target_arch = "riscv64")]
#[inline]
pub fn intr_on() {
    // SAFETY: flipping SSTATUS.SIE only affects interrupt delivery on this
    // hart; callers manage nesting through cpu::push_off/pop_off.
    unsafe { ::riscv::register::sstatus::set_sie() }
}

/// Disable supervisor interrupts on this hart.
#[cfg(target_arch = "riscv64")]
#[inline]
pub fn intr_off() {
    // SAFETY: see intr_on.
    unsafe { ::riscv::register::sstatus::clear_sie() }
}

/// Are supervisor interrupts currently enabled on this hart?
#[cfg(target_arch = "riscv64")]
#[inline]
pub fn intr_get() -> bool {
    ::riscv::register::sstatus::read().sie()
}

/// Logical cpu id of this hart, kept in the thread-pointer register.
#[cfg(target_arch = "riscv64")]
#[inline]
pub fn cpu_id() -> usize {
    let id: usize;
    // SAFETY: reading tp has no side effects; the boot path stores the
    // logical cpu id there before any caller can run.
    unsafe { core::arch::asm!("mv {}, tp", out(reg) id) };
    id
}

/// Store the logical cpu id in the thread-pointer register. Boot-path only.
#[cfg(target_arch = "riscv64")]
#[inline]
pub fn set_cpu_id(id: usize) {
    // SAFETY: tp is reserved for the cpu id by this kernel; only the boot
    // path of each hart writes it.
    unsafe { core::arch::asm!("mv tp, {}", in(reg) id) };
}

/// Flush this hart's address-translation cache.
#[cfg(target_arch = "riscv64")]
#[inline]
pub fn sfence_vma() {
    ::riscv::asm::sfence_vma_all();
}

/// Full memory fence, used around the SMP boot handshake flag.
#[inline]
pub fn memory_fence() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Wait for an interrupt.
#[cfg(target_arch = "riscv64")]
#[inline]
pub fn wait_for_interrupt() {
    ::riscv::asm::wfi();
}

// Host shims. Unit tests never exercise interrupt delivery or the MMU;
// these keep the portable modules compiling off-target.

#[cfg(not(target_arch = "riscv64"))]
mod host {
    use core::sync::atomic::{AtomicBool, Ordering};

    static FAKE_SIE: AtomicBool = AtomicBool::new(false);

    pub fn intr_on() {
        FAKE_SIE.store(true, Ordering::Relaxed);
    }
    pub fn intr_off() {
        FAKE_SIE.store(false, Ordering::Relaxed);
    }
    pub fn intr_get() -> bool {
        FAKE_SIE.load(Ordering::Relaxed)
    }
    pub fn cpu_id() -> usize {
        0
    }
    pub fn set_cpu_id(_id: usize) {}
    pub fn sfence_vma() {}
    pub fn wait_for_interrupt() {}
}

#[cfg(not(target_arch = "riscv64"))]
pub use host::{cpu_id, intr_get, intr_off, intr_on, set_cpu_id, sfence_vma, wait_for_interrupt};
