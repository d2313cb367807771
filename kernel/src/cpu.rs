//! Per-hart state.
//!
//! Each hart keeps its logical id in the thread-pointer register and owns
//! one slot of the cpu array: the scheduler context, the index of the
//! process it is running, and the interrupt-disable nesting used by the
//! spinlocks.

use core::cell::UnsafeCell;

use crate::arch::{self, Context};

/// Maximum supported harts.
pub const NCPU: usize = 4;

pub struct Cpu {
    /// Machine hart id, as reported at boot.
    pub hartid: usize,
    /// Index of the process currently running on this hart.
    pub proc_idx: Option<usize>,
    /// Depth of push_off nesting.
    pub noff: usize,
    /// Were interrupts enabled before the outermost push_off?
    pub intena: bool,
    /// Set while servicing a kernel trap; nesting is a bug.
    pub in_kernel_trap: bool,
    /// Scheduler context for this hart.
    pub context: Context,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            hartid: 0,
            proc_idx: None,
            noff: 0,
            intena: false,
            in_kernel_trap: false,
            context: Context::zeroed(),
        }
    }
}

struct CpuArray {
    cpus: [UnsafeCell<Cpu>; NCPU],
}

// SAFETY: each hart only ever touches its own slot (indexed by the cpu id
// in tp) and only with interrupts disabled, so no two contexts can alias a
// slot concurrently.
unsafe impl Sync for CpuArray {}

static CPUS: CpuArray = CpuArray {
    cpus: [const { UnsafeCell::new(Cpu::new()) }; NCPU],
};

/// This hart's cpu slot.
///
/// # Safety
///
/// Interrupts must be disabled for the lifetime of the returned reference,
/// and the caller must not create a second live reference to the slot.
pub unsafe fn mycpu() -> &'static mut Cpu {
    let id = arch::cpu_id();
    // SAFETY: id < NCPU is guaranteed by the boot path; exclusivity is the
    // caller's contract.
    unsafe { &mut *CPUS.cpus[id].get() }
}

/// Disable interrupts, tracking nesting so a matching number of
/// [`pop_off`] calls restores the pre-existing state.
pub fn push_off() {
    let old = arch::intr_get();
    arch::intr_off();
    // SAFETY: interrupts are now off and the reference does not outlive
    // this function.
    let cpu = unsafe { mycpu() };
    if cpu.noff == 0 {
        cpu.intena = old;
    }
    cpu.noff += 1;
}

/// Undo one [`push_off`]; re-enables interrupts when the nesting reaches
/// zero and they were enabled to begin with.
pub fn pop_off() {
    assert!(!arch::intr_get(), "pop_off with interrupts enabled");
    // SAFETY: interrupts are off; the reference is dropped before they can
    // be re-enabled below.
    let cpu = unsafe { mycpu() };
    assert!(cpu.noff >= 1, "unbalanced pop_off");
    cpu.noff -= 1;
    let enable = cpu.noff == 0 && cpu.intena;
    if enable {
        arch::intr_on();
    }
}

/// Index of the process running on this hart, if any.
pub fn current_proc_index() -> Option<usize> {
    push_off();
    // SAFETY: interrupts are off across the read.
    let idx = unsafe { mycpu().proc_idx };
    pop_off();
    idx
}

/// Host unit tests share cpu slot 0; serialize the ones that use it.
#[cfg(all(test, not(target_arch = "riscv64")))]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static LOCK: Mutex<()> = Mutex::new(());

    pub fn serialize() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_nesting() {
        let _serial = test_support::serialize();
        crate::arch::intr_off();
        push_off();
        push_off();
        pop_off();
        pop_off();
        // interrupts were off before the first push_off, so they stay off
        assert!(!crate::arch::intr_get());
    }
}
