//! The process table.
//!
//! `NPROC` slots allocated from the slab allocator at boot, each with its
//! kernel stack page and trapframe page pre-assigned. Slot allocation
//! scans for an unused entry; pids are monotonic under their own lock.

use spin::Once;

use crate::error::{KernelError, KernelResult};
use crate::memlayout::KSTACK_SIZE;
use crate::mm::slab::ObjectPool;
use crate::mm::{page_alloc, vas};
use crate::process::{forkret, ProcEntry, ProcInner, ProcState, Process, NPROC};
use crate::sync::{SpinGuard, SpinLock};

static PROC_POOL: ObjectPool<Process> = ObjectPool::new("proc");

static PROCS: Once<[&'static Process; NPROC]> = Once::new();

static PID: SpinLock<i32> = SpinLock::new("pid", 1);

/// Slot index of the init process: the first slot ever allocated.
static INIT_PROC: Once<usize> = Once::new();

/// Build the table. Boot hart only, after the page allocator is up.
pub fn init() {
    PROC_POOL.init(NPROC);

    let mut slots: [Option<&'static Process>; NPROC] = [None; NPROC];
    for (i, slot) in slots.iter_mut().enumerate() {
        let kstack = page_alloc::alloc_page().expect("proc init: kernel stack");
        let trapframe = page_alloc::alloc_page().expect("proc init: trapframe");
        let p = PROC_POOL
            .alloc_init(Process {
                index: i,
                kstack: kstack.kva(),
                trapframe_page: trapframe,
                inner: SpinLock::new("proc", ProcInner::unused()),
            })
            .expect("proc pool undersized");
        // SAFETY: pool objects live for the lifetime of the kernel; the
        // table never frees them.
        *slot = Some(unsafe { &*p.as_ptr() });
    }

    PROCS.call_once(|| slots.map(|s| s.expect("slot missing")));
    log::info!("process table: {NPROC} slots");
}

/// The slot at `index`.
pub fn proc(index: usize) -> &'static Process {
    PROCS.get().expect("process table not initialized")[index]
}

pub fn init_proc_index() -> Option<usize> {
    INIT_PROC.get().copied()
}

fn alloc_pid() -> i32 {
    let mut pid = PID.lock();
    let ret = *pid;
    *pid += 1;
    ret
}

/// Find an unused slot and prime it: fresh pid, cleared flags, context
/// aimed at `forkret` on the slot's kernel stack. Returns with the slot
/// lock held. The first allocation becomes the init process.
pub fn alloc_proc() -> KernelResult<(&'static Process, SpinGuard<'static, ProcInner>)> {
    for i in 0..NPROC {
        let p = proc(i);
        let mut g = p.inner.lock();
        if g.state != ProcState::Unused {
            continue;
        }

        g.pid = alloc_pid();
        g.state = ProcState::Used;
        g.killed = false;
        g.sleep_chan = 0;
        g.parent = None;
        g.exit_code = 0;
        g.mm = None;
        g.brk_vma = None;
        g.brk = 0;
        g.entry = ProcEntry::User;
        g.signals = super::signal::SignalState::new();
        g.name = [0; 16];

        g.context = crate::arch::Context::zeroed();
        g.context.ra = forkret as usize;
        g.context.sp = p.kstack + KSTACK_SIZE;

        // SAFETY: the slot's kernel stack page is idle while the slot is
        // unused.
        unsafe { core::ptr::write_bytes(p.kstack as *mut u8, 0, KSTACK_SIZE) };

        INIT_PROC.call_once(|| i);
        return Ok((p, g));
    }
    Err(KernelError::ProcessTableFull)
}

/// Return a slot to the unused state, releasing its address space. The
/// kernel stack and trapframe pages stay with the slot.
pub fn free_proc(g: &mut SpinGuard<'_, ProcInner>) {
    if let Some(mm) = g.mm.take() {
        vas::mm_free(mm);
    }
    g.brk_vma = None;
    g.brk = 0;
    g.state = ProcState::Unused;
    g.pid = -1;
    g.killed = false;
    g.sleep_chan = 0;
    g.parent = None;
    g.exit_code = 0;
    g.name = [0; 16];
}

/// Console Ctrl-P: one line per occupied slot.
pub fn dump() {
    crate::println!("idx\tpid\tstate\t\tparent\tname");
    for i in 0..NPROC {
        let p = proc(i);
        if p.inner.holding() {
            crate::println!("{i}\t?\t(locked by this hart)");
            continue;
        }
        let g = p.inner.lock();
        if g.state == ProcState::Unused {
            continue;
        }
        let parent = g.parent.map(|pi| pi as isize).unwrap_or(-1);
        crate::println!(
            "{i}\t{}\t{}\t{}\t{}",
            g.pid,
            g.state.as_str(),
            parent,
            g.name_str()
        );
    }
}
