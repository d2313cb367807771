//! Ticks and the hart timer.
//!
//! Hart 0 owns the global tick counter, incremented from its user-mode
//! timer interrupts; sleepers rendezvous on the counter's channel. Every
//! hart arms its own next tick through the firmware TIME extension.

use crate::process;
use crate::sync::SpinLock;

/// Tick interval in timebase units, chosen for a 10 ms tick.
#[cfg(target_arch = "riscv64")]
fn tick_interval() -> u64 {
    use crate::arch::Board;
    match crate::arch::board() {
        // QEMU virt: 10 MHz timebase.
        Board::QemuVirt => 100_000,
        // JH7110: 4 MHz timebase.
        Board::VisionFive2 => 40_000,
    }
}

static TICKS: SpinLock<u64> = SpinLock::new("ticks", 0);

/// The channel sleepers of `sys_sleep` park on.
pub fn ticks_chan() -> usize {
    &TICKS as *const _ as usize
}

pub fn current_ticks() -> u64 {
    *TICKS.lock()
}

/// Advance the global tick and wake sleepers. Hart 0's user-trap timer
/// path only.
pub fn tick() {
    let mut ticks = TICKS.lock();
    *ticks += 1;
    drop(ticks);
    process::wakeup(ticks_chan());
}

/// Sleep until `n` ticks have elapsed. Returns `Killed` if the process
/// was killed while waiting.
pub fn sleep_ticks(n: u64) -> crate::error::KernelResult<()> {
    let mut ticks = TICKS.lock();
    let start = *ticks;
    while *ticks - start < n {
        if process::my_proc().killed() {
            return Err(crate::error::KernelError::Killed);
        }
        ticks = process::sleep(ticks_chan(), ticks);
    }
    Ok(())
}

/// Arm this hart's next timer interrupt.
#[cfg(target_arch = "riscv64")]
pub fn set_next_trigger() {
    use crate::arch::riscv;
    riscv::sbi::set_timer(riscv::r_time() + tick_interval());
}

/// Hart-local timer bring-up.
#[cfg(target_arch = "riscv64")]
pub fn init_hart() {
    crate::arch::riscv::enable_timer_interrupt();
    set_next_trigger();
}
