//! The scheduler.
//!
//! One scheduler loop per hart, pulling RUNNABLE processes off the shared
//! FIFO. State transitions happen in the code that switches out (yield,
//! sleep, exit); the loop itself only marks RUNNING and switches in. The
//! process lock is held across `swtch` and released on the other side.

pub mod queue;

#[cfg(target_arch = "riscv64")]
mod imp {
    use super::queue;
    use crate::arch::{self, Context};
    use crate::cpu;
    use crate::process::{table, my_proc, ProcInner, ProcState};
    use crate::sync::SpinGuard;

    /// Per-hart scheduler loop. Never returns.
    pub fn scheduler() -> ! {
        loop {
            // Interrupts must get a chance between candidates, or a hart
            // with an empty queue could spin forever with them off.
            arch::intr_on();

            let Some(idx) = queue::pop_task() else {
                arch::wait_for_interrupt();
                continue;
            };

            let p = table::proc(idx);
            let mut g = p.inner.lock();
            assert_eq!(g.state, ProcState::Runnable, "queued but not runnable");
            g.state = ProcState::Running;

            // SAFETY: interrupts are off while the process lock is held.
            let cpu = unsafe { cpu::mycpu() };
            cpu.proc_idx = Some(idx);
            let cpu_ctx: *mut Context = &mut cpu.context;
            let proc_ctx: *const Context = &g.context;

            // SAFETY: both contexts stay pinned: the cpu slot is static
            // and the process slot lives in a never-freed pool. The lock
            // travels with the process and is released by the code that
            // resumes on its stack.
            unsafe { arch::riscv::switch::swtch(cpu_ctx, proc_ctx) };

            // The process switched back; it is no longer running here.
            // SAFETY: interrupts are still off (lock still held).
            let cpu = unsafe { cpu::mycpu() };
            cpu.proc_idx = None;
            drop(g);
        }
    }

    /// Switch from the current process to this hart's scheduler loop.
    /// The caller holds exactly the process lock (through `guard`) and
    /// has already moved the process out of RUNNING.
    pub fn sched(guard: &mut SpinGuard<'_, ProcInner>) {
        assert!(!arch::intr_get(), "sched with interrupts on");
        assert!(guard.state != ProcState::Running, "sched of a running process");
        // SAFETY: interrupts are off.
        let cpu = unsafe { cpu::mycpu() };
        assert!(cpu.noff == 1, "sched with extra locks held");

        let intena = cpu.intena;
        let proc_ctx: *mut Context = &mut guard.context;
        let cpu_ctx: *const Context = &cpu.context;
        // SAFETY: see scheduler; the guard keeps the process lock held
        // across the switch.
        unsafe { arch::riscv::switch::swtch(proc_ctx, cpu_ctx) };

        // Possibly a different hart now; re-read the cpu slot.
        // SAFETY: interrupts are still off.
        let cpu = unsafe { cpu::mycpu() };
        cpu.intena = intena;
    }

    /// Give up the cpu, staying runnable.
    pub fn yield_now() {
        let p = my_proc();
        let mut g = p.inner.lock();
        g.state = ProcState::Runnable;
        queue::add_task(p.index);
        sched(&mut g);
    }
}

#[cfg(target_arch = "riscv64")]
pub use imp::{sched, scheduler, yield_now};

// Host shims: scheduling needs a real hart. Unit tests exercise the run
// queue, never a switch.
#[cfg(not(target_arch = "riscv64"))]
mod imp {
    use crate::process::ProcInner;
    use crate::sync::SpinGuard;

    pub fn sched(_guard: &mut SpinGuard<'_, ProcInner>) {
        unreachable!("context switch outside the riscv target");
    }

    pub fn yield_now() {
        unreachable!("context switch outside the riscv target");
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub use imp::{sched, yield_now};
