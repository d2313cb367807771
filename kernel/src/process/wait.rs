//! Process exit, reaping and killing.
//!
//! The global wait lock orders exits against waits: reparenting, the
//! parent wakeup and the transition to zombie all happen under it, so a
//! parent scanning for exited children cannot miss the wakeup.

use crate::error::{KernelError, KernelResult};
use crate::process::{my_proc, table, wakeup, ProcState, NPROC};
use crate::sched;
use crate::sync::SpinLock;

/// Global wait lock; first in the lock order.
static WAIT_LOCK: SpinLock<()> = SpinLock::new("wait", ());

/// Run `f` under the wait lock (fork publishes the parent link this way).
pub(crate) fn with_wait_lock<R>(f: impl FnOnce() -> R) -> R {
    let _wl = WAIT_LOCK.lock();
    f()
}

/// Terminate the current process with `code`. Children are reparented to
/// init (waking it so it can reap orphaned zombies), the parent is woken,
/// and the slot turns zombie until a `wait` reaps it. Never returns.
pub fn exit(code: i32) -> ! {
    let p = my_proc();

    if table::init_proc_index() == Some(p.index) {
        panic!("init process exited");
    }

    let wl = WAIT_LOCK.lock();

    let init_idx = table::init_proc_index().expect("exit before init exists");
    let mut orphaned = false;
    for i in 0..NPROC {
        if i == p.index {
            continue;
        }
        let mut g = table::proc(i).inner.lock();
        if g.parent == Some(p.index) {
            g.parent = Some(init_idx);
            orphaned = true;
        }
    }
    if orphaned {
        wakeup(table::proc(init_idx).channel());
    }

    let parent = { p.inner.lock().parent };
    if let Some(pi) = parent {
        wakeup(table::proc(pi).channel());
    }

    let mut g = p.inner.lock();
    g.exit_code = code;
    g.state = ProcState::Zombie;
    drop(wl);

    sched::sched(&mut g);
    unreachable!("zombie was scheduled");
}

/// Wait for a child to exit. `pid <= 0` accepts any child; a positive
/// `pid` waits for that child specifically. Returns the reaped child's
/// pid and exit code, or `NoChildren` when the caller has no matching
/// children left.
pub fn wait(pid: i32) -> KernelResult<(i32, i32)> {
    let p = my_proc();

    let mut wl = WAIT_LOCK.lock();
    loop {
        let mut have_kids = false;
        for i in 0..NPROC {
            if i == p.index {
                continue;
            }
            let child = table::proc(i);
            let mut cg = child.inner.lock();
            if cg.parent != Some(p.index) {
                continue;
            }
            have_kids = true;
            if cg.state == ProcState::Zombie && (pid <= 0 || cg.pid == pid) {
                let reaped = (cg.pid, cg.exit_code);
                table::free_proc(&mut cg);
                return Ok(reaped);
            }
        }

        if !have_kids {
            return Err(KernelError::NoChildren);
        }
        if p.killed() {
            return Err(KernelError::Killed);
        }

        wl = super::sleep(p.channel(), wl);
    }
}

/// Mark the process with `pid` killed. A sleeping target becomes runnable
/// so it observes the mark at its next syscall or trap boundary.
pub fn kill(pid: i32) -> KernelResult<()> {
    for i in 0..NPROC {
        let p = table::proc(i);
        let mut g = p.inner.lock();
        if g.state != ProcState::Unused && g.pid == pid {
            g.killed = true;
            if g.state == ProcState::Sleeping {
                g.state = ProcState::Runnable;
                sched::queue::add_task(i);
            }
            return Ok(());
        }
    }
    Err(KernelError::InvalidArgument { name: "pid" })
}
