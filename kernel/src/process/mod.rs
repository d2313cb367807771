//! Processes.
//!
//! A fixed pool of process slots, each with a pre-assigned kernel stack
//! and trapframe page that are reused across slot generations. Mutable
//! state lives behind the per-process spinlock; parent links are table
//! indices, never owning pointers.

pub mod fork;
pub mod signal;
pub mod table;
pub mod wait;

use core::ptr::NonNull;

use crate::arch::Context;
use crate::error::KernelResult;
use crate::mm::vas::{Mm, Vma};
use crate::mm::PhysAddr;
use crate::sync::{SpinGuard, SpinLock};
use crate::trap::TrapFrame;
use crate::{cpu, sched};

pub use wait::{exit, kill, wait};

/// Number of process-table slots.
pub const NPROC: usize = 64;

/// Maximum argv entries accepted by exec.
pub const MAX_ARG: usize = 16;

/// Maximum length of an argv string or exec path, including the NUL.
pub const KSTRING_MAX: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Used => "used",
            ProcState::Sleeping => "sleeping",
            ProcState::Runnable => "runnable",
            ProcState::Running => "running",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Where the first context switch into a fresh slot lands.
#[derive(Clone, Copy)]
pub enum ProcEntry {
    /// Release the lock and return to user space.
    User,
    /// Release the lock, enable interrupts and run a kernel-thread body.
    Kthread { f: fn(usize), arg: usize },
}

/// Lock-protected process state.
pub struct ProcInner {
    pub state: ProcState,
    pub pid: i32,
    pub killed: bool,
    /// Opaque rendezvous token; non-zero only while sleeping.
    pub sleep_chan: usize,
    /// Parent slot index. Rewired to init on parent exit.
    pub parent: Option<usize>,
    pub exit_code: i32,
    /// Saved callee-save context for cooperative switches.
    pub context: Context,
    pub entry: ProcEntry,
    /// The address space; None only for unused slots.
    pub mm: Option<NonNull<Mm>>,
    /// The heap VMA inside `mm`, grown and shrunk by sbrk.
    pub brk_vma: Option<NonNull<Vma>>,
    pub brk: usize,
    pub signals: signal::SignalState,
    pub name: [u8; 16],
}

// SAFETY: the NonNull fields refer to pool objects whose access is
// serialized by this process's lock and the pointees' own locks.
unsafe impl Send for ProcInner {}

impl ProcInner {
    pub const fn unused() -> Self {
        Self {
            state: ProcState::Unused,
            pid: -1,
            killed: false,
            sleep_chan: 0,
            parent: None,
            exit_code: 0,
            context: Context::zeroed(),
            entry: ProcEntry::User,
            mm: None,
            brk_vma: None,
            brk: 0,
            signals: signal::SignalState::new(),
            name: [0; 16],
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let n = name.len().min(self.name.len() - 1);
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.name[n..].fill(0);
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }
}

/// One process-table slot.
pub struct Process {
    /// Slot index in the table.
    pub index: usize,
    /// Kernel virtual address of this slot's kernel stack page.
    pub kstack: usize,
    /// The slot's trapframe page, mapped at TRAPFRAME in the process's
    /// address space.
    pub trapframe_page: PhysAddr,
    pub inner: SpinLock<ProcInner>,
}

impl Process {
    /// This process's sleep/wakeup channel.
    pub fn channel(&self) -> usize {
        self as *const _ as usize
    }

    pub fn pid(&self) -> i32 {
        self.inner.lock().pid
    }

    pub fn killed(&self) -> bool {
        self.inner.lock().killed
    }

    pub fn set_killed(&self) {
        self.inner.lock().killed = true;
    }

    /// The process's address space. Panics on unused slots.
    pub fn mm(&self) -> NonNull<Mm> {
        self.inner.lock().mm.expect("process has no address space")
    }

    /// Root page-table page of the process's address space.
    pub fn page_table_root(&self) -> PhysAddr {
        let mm = self.mm();
        // SAFETY: the map outlives the process that owns it.
        let mm_ref = unsafe { mm.as_ref() };
        let inner = mm_ref.inner.lock();
        inner.pgt
    }

    /// The trapframe save area of this slot.
    ///
    /// # Safety
    ///
    /// Only the kernel thread currently running this process may touch the
    /// trapframe; callers must not keep the reference across a switch.
    pub unsafe fn trapframe(&self) -> &mut TrapFrame {
        // SAFETY: the trapframe page is pre-assigned to this slot and
        // reachable through the direct map; exclusivity is the caller's
        // contract.
        unsafe { &mut *(self.trapframe_page.kva() as *mut TrapFrame) }
    }
}

/// The process running on this hart. Panics outside process context.
pub fn my_proc() -> &'static Process {
    let idx = cpu::current_proc_index().expect("no current process");
    table::proc(idx)
}

/// Pid of the current process, or 0 from scheduler context.
pub fn current_pid() -> i32 {
    match cpu::current_proc_index() {
        Some(idx) => table::proc(idx).pid(),
        None => 0,
    }
}

/// Atomically release `guard` and sleep on `chan`; re-acquires the same
/// lock before returning. The process lock is taken before the condition
/// lock is dropped, so a waker holding the condition lock cannot race the
/// transition to Sleeping.
pub fn sleep<'a, T>(chan: usize, guard: SpinGuard<'a, T>) -> SpinGuard<'a, T> {
    let p = my_proc();

    let mut pg = p.inner.lock();
    let condition_lock = guard.unlock();

    pg.sleep_chan = chan;
    pg.state = ProcState::Sleeping;

    sched::sched(&mut pg);

    pg.sleep_chan = 0;
    drop(pg);

    condition_lock.lock()
}

/// Make every process sleeping on `chan` runnable.
pub fn wakeup(chan: usize) {
    let current = cpu::current_proc_index();
    for i in 0..NPROC {
        if Some(i) == current {
            continue;
        }
        let p = table::proc(i);
        let mut g = p.inner.lock();
        if g.state == ProcState::Sleeping && g.sleep_chan == chan {
            g.state = ProcState::Runnable;
            sched::queue::add_task(i);
        }
    }
}

/// Create a kernel thread. The first switch into it lands in `forkret`,
/// which releases the slot lock, enables interrupts and calls `f(arg)`;
/// the body terminates via `exit`.
pub fn spawn_kthread(name: &str, f: fn(usize), arg: usize) -> KernelResult<i32> {
    let (p, mut g) = table::alloc_proc()?;
    g.entry = ProcEntry::Kthread { f, arg };
    g.parent = table::init_proc_index();
    g.set_name(name);
    g.state = ProcState::Runnable;
    let pid = g.pid;
    sched::queue::add_task(p.index);
    drop(g);
    Ok(pid)
}

/// Landing point of the first switch into a fresh process. The scheduler
/// acquired the slot lock before switching here; release it and enter the
/// slot's body.
pub extern "C" fn forkret() -> ! {
    let p = my_proc();
    // SAFETY: the scheduler locked p.inner before switching to us.
    let entry = unsafe { p.inner.assume_locked().entry };
    // SAFETY: as above; the lock is held with no live guard.
    unsafe { p.inner.force_unlock() };

    match entry {
        ProcEntry::User => {
            #[cfg(target_arch = "riscv64")]
            crate::trap::user_trap_ret();
            #[cfg(not(target_arch = "riscv64"))]
            unreachable!("user return outside the riscv target");
        }
        ProcEntry::Kthread { f, arg } => {
            crate::arch::intr_on();
            f(arg);
            panic!("kernel thread returned; terminate with exit instead");
        }
    }
}
