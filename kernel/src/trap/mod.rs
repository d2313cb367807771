//! Trap plane: user and kernel trap handling.
//!
//! The assembly vectors live in `arch::riscv::trampoline`; everything
//! after the register save is ordinary code. Kernel code is never
//! preempted — a timer interrupt taken in supervisor mode only arms the
//! next tick. User code is preempted by noting the tick and yielding on
//! the way out.

/// Per-process save area for user register state across a trap. Field
/// order is the save layout of the trampoline assembly; do not reorder.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    /// Kernel satp, loaded by uservec.
    pub kernel_satp: usize, // 0
    /// Top of this process's kernel stack.
    pub kernel_sp: usize, // 8
    /// Address of `usertrap`.
    pub kernel_trap: usize, // 16
    /// Saved user program counter.
    pub epc: usize, // 24
    /// Saved cpu id for tp.
    pub kernel_hartid: usize, // 32
    pub ra: usize,  // 40
    pub sp: usize,  // 48
    pub gp: usize,  // 56
    pub tp: usize,  // 64
    pub t0: usize,  // 72
    pub t1: usize,  // 80
    pub t2: usize,  // 88
    pub s0: usize,  // 96
    pub s1: usize,  // 104
    pub a0: usize,  // 112
    pub a1: usize,  // 120
    pub a2: usize,  // 128
    pub a3: usize,  // 136
    pub a4: usize,  // 144
    pub a5: usize,  // 152
    pub a6: usize,  // 160
    pub a7: usize,  // 168
    pub s2: usize,  // 176
    pub s3: usize,  // 184
    pub s4: usize,  // 192
    pub s5: usize,  // 200
    pub s6: usize,  // 208
    pub s7: usize,  // 216
    pub s8: usize,  // 224
    pub s9: usize,  // 232
    pub s10: usize, // 240
    pub s11: usize, // 248
    pub t3: usize,  // 256
    pub t4: usize,  // 264
    pub t5: usize,  // 272
    pub t6: usize,  // 280
}

impl TrapFrame {
    /// The syscall argument registers `a0..a5`.
    pub fn syscall_args(&self) -> [usize; 6] {
        [self.a0, self.a1, self.a2, self.a3, self.a4, self.a5]
    }
}

/// Register file saved on the kernel stack by `kernelvec`. Field order is
/// the save layout of the assembly; do not reorder.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct KernelTrapFrame {
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
}

#[cfg(target_arch = "riscv64")]
mod handlers {
    use super::KernelTrapFrame;
    use crate::arch;
    use crate::arch::riscv::{self, trampoline};
    use crate::memlayout::{KSTACK_SIZE, TRAMPOLINE, TRAPFRAME};
    use crate::mm::page_fault::{self, FaultKind};
    use crate::{cpu, process, sched, syscall, timer};

    /// Install the kernel trap vector on this hart.
    pub fn init_hart() {
        riscv::w_stvec(trampoline::kernelvec as usize);
    }

    /// Service an external interrupt: claim from the PLIC, dispatch by
    /// source, complete.
    fn external_interrupt() {
        let hart = arch::cpu_id();
        if let Some(irq) = riscv::plic::claim(hart) {
            if irq == riscv::plic::uart_irq() {
                crate::drivers::uart::handle_irq();
            } else {
                log::warn!("unexpected external irq {irq}");
            }
            riscv::plic::complete(hart, irq);
        }
    }

    /// Traps taken while in supervisor mode. Interrupts get serviced;
    /// any exception here is a kernel bug.
    #[no_mangle]
    extern "C" fn kernel_trap(ktf: &mut KernelTrapFrame) {
        assert!(
            riscv::sstatus_spp_supervisor(),
            "kernel trap not from supervisor mode"
        );

        {
            // SAFETY: interrupts are off (hardware clears SIE on trap).
            let cpu = unsafe { cpu::mycpu() };
            if cpu.in_kernel_trap {
                panic!("nested kernel trap");
            }
            cpu.in_kernel_trap = true;
        }

        let cause = riscv::r_scause();
        if cause & riscv::SCAUSE_INTERRUPT != 0 {
            match cause & !riscv::SCAUSE_INTERRUPT {
                // Kernel threads are not preempted: just arm the next tick.
                riscv::SUPERVISOR_TIMER => timer::set_next_trigger(),
                riscv::SUPERVISOR_EXTERNAL => external_interrupt(),
                other => panic!("unknown kernel interrupt {other}"),
            }
        } else {
            crate::print::panic_begin();
            crate::println!(
                "kernel exception: scause {:#x}, stval {:#x}, sepc {:#x}",
                cause,
                riscv::r_stval(),
                riscv::r_sepc()
            );
            crate::println!("{ktf:#x?}");
            panic!("trap from kernel");
        }

        {
            // SAFETY: interrupts are still off.
            let cpu = unsafe { cpu::mycpu() };
            cpu.in_kernel_trap = false;
        }
    }

    /// Handle an interrupt, exception, or system call from user space.
    /// Entered from the trampoline with the kernel page table installed.
    #[no_mangle]
    pub extern "C" fn usertrap() -> ! {
        init_hart();
        assert!(
            !riscv::sstatus_spp_supervisor(),
            "user trap not from user mode"
        );

        let p = process::my_proc();
        {
            // SAFETY: only the owning kernel thread touches the trapframe
            // while the process runs.
            let tf = unsafe { p.trapframe() };
            tf.epc = riscv::r_sepc();
        }

        let cause = riscv::r_scause();
        let mut need_yield = false;

        if cause & riscv::SCAUSE_INTERRUPT != 0 {
            match cause & !riscv::SCAUSE_INTERRUPT {
                riscv::SUPERVISOR_TIMER => {
                    // Hart 0 owns the global tick stream.
                    if arch::cpu_id() == 0 {
                        timer::tick();
                    }
                    timer::set_next_trigger();
                    need_yield = true;
                }
                riscv::SUPERVISOR_EXTERNAL => external_interrupt(),
                other => {
                    log::error!("unknown user interrupt {other}, pid {}", p.pid());
                    p.set_killed();
                }
            }
        } else {
            match cause {
                riscv::USER_ENV_CALL => {
                    // sepc points at the ecall; resume after it.
                    // SAFETY: as above; the borrow ends before dispatch.
                    unsafe { p.trapframe() }.epc += 4;
                    arch::intr_on();
                    syscall::dispatch(p);
                    arch::intr_off();
                }
                riscv::INSTRUCTION_PAGE_FAULT
                | riscv::LOAD_PAGE_FAULT
                | riscv::STORE_PAGE_FAULT => {
                    let kind = match cause {
                        riscv::STORE_PAGE_FAULT => FaultKind::Store,
                        riscv::INSTRUCTION_PAGE_FAULT => FaultKind::Fetch,
                        _ => FaultKind::Load,
                    };
                    let addr = riscv::r_stval();
                    let mm = p.mm();
                    // SAFETY: the map outlives the process that owns it.
                    let mm_ref = unsafe { mm.as_ref() };
                    let result = {
                        let mut mi = mm_ref.inner.lock();
                        page_fault::handle_user_fault(&mut mi, kind, addr)
                    };
                    if let Err(err) = result {
                        log::error!(
                            "pid {} fault at {addr:#x} ({kind:?}): {err}, killed",
                            p.pid()
                        );
                        p.set_killed();
                    }
                }
                riscv::ILLEGAL_INSTRUCTION => {
                    log::error!(
                        "illegal instruction in pid {} at {:#x}, killed",
                        p.pid(),
                        riscv::r_sepc()
                    );
                    p.set_killed();
                }
                riscv::INSTRUCTION_MISALIGNED
                | riscv::LOAD_MISALIGNED
                | riscv::STORE_MISALIGNED => {
                    log::error!(
                        "misaligned access in pid {} at {:#x}, stval {:#x}, killed",
                        p.pid(),
                        riscv::r_sepc(),
                        riscv::r_stval()
                    );
                    p.set_killed();
                }
                other => {
                    log::error!(
                        "unknown user trap {other:#x}, stval {:#x}, pid {}, killed",
                        riscv::r_stval(),
                        p.pid()
                    );
                    p.set_killed();
                }
            }
        }

        if p.killed() {
            process::exit(-1);
        }
        if need_yield {
            sched::yield_now();
        }

        user_trap_ret()
    }

    /// Return to user space through the trampoline.
    pub fn user_trap_ret() -> ! {
        let p = process::my_proc();

        // Traps are routed back to uservec from here on; keep them off
        // until sret.
        arch::intr_off();
        let uservec_va = TRAMPOLINE + (trampoline::uservec as usize - trampoline::trampoline as usize);
        riscv::w_stvec(uservec_va);

        let user_satp = riscv::make_satp(p.page_table_root().0);

        // SAFETY: see usertrap.
        let tf = unsafe { p.trapframe() };
        tf.kernel_satp = riscv::r_satp();
        tf.kernel_sp = p.kstack + KSTACK_SIZE;
        tf.kernel_trap = usertrap as usize;
        tf.kernel_hartid = arch::cpu_id();

        riscv::sstatus_set_user_return();
        riscv::w_sepc(tf.epc);

        let userret_va =
            TRAMPOLINE + (trampoline::userret as usize - trampoline::trampoline as usize);
        // SAFETY: userret is mapped at this VA in both the kernel and the
        // user table; its ABI is (trapframe VA, user satp, user stvec).
        let userret_fn: extern "C" fn(usize, usize, usize) -> ! =
            unsafe { core::mem::transmute(userret_va) };
        userret_fn(TRAPFRAME, user_satp, uservec_va)
    }
}

#[cfg(target_arch = "riscv64")]
pub use handlers::{init_hart, user_trap_ret, usertrap};
