//! Fork.

use crate::error::{KernelError, KernelResult};
use crate::mm::copy_page;
use crate::mm::vas;
use crate::process::{my_proc, table, ProcState};
use crate::sched;

/// Duplicate the current process: a fresh slot, a copy of the address
/// space (demand paging materialises pages on both sides as needed), a
/// cloned trapframe with `a0 = 0` for the child, and a RUNNABLE child on
/// the queue. Any failure unwinds the child completely.
pub fn fork() -> KernelResult<i32> {
    let parent = my_proc();
    let parent_mm = parent.mm();

    // Snapshot the heap geometry before taking the child's lock: the brk
    // VMA of the copy is found again by its start address.
    let (brk_start, brk) = {
        let g = parent.inner.lock();
        let brk_vma = match g.brk_vma {
            Some(v) => v,
            None => return Err(KernelError::InvalidArgument { name: "fork" }),
        };
        // SAFETY: the parent map cannot change while the parent itself is
        // executing fork.
        let start = unsafe { brk_vma.as_ref().vm_start };
        (start, g.brk)
    };

    let (child, mut cg) = table::alloc_proc()?;

    let child_mm = match vas::mm_create(child.trapframe_page) {
        Some(mm) => mm,
        None => {
            table::free_proc(&mut cg);
            return Err(KernelError::OutOfMemory);
        }
    };
    cg.mm = Some(child_mm);

    // Parent map first, then the child's: the only place two maps are
    // held at once.
    let copied = {
        // SAFETY: both maps are pool objects kept alive by their owners.
        let pm = unsafe { parent_mm.as_ref() };
        let cm = unsafe { child_mm.as_ref() };
        let mut pmi = pm.inner.lock();
        let mut cmi = cm.inner.lock();
        let res = vas::mm_copy(&mut pmi, child_mm, &mut cmi);
        if res.is_ok() {
            cg.brk_vma = cmi.find_vma_starting(brk_start);
        }
        res
    };
    if copied.is_err() {
        cg.mm = None;
        vas::mm_free(child_mm);
        table::free_proc(&mut cg);
        return Err(KernelError::OutOfMemory);
    }
    cg.brk = brk;
    debug_assert!(cg.brk_vma.is_some(), "heap vma lost in copy");

    copy_page(child.trapframe_page, parent.trapframe_page);
    // SAFETY: the child is not running yet; its trapframe is ours.
    unsafe { child.trapframe() }.a0 = 0;

    let name = { parent.inner.lock().name };
    cg.name = name;
    let pid = cg.pid;
    drop(cg);

    // Publish the parent link under the wait lock so a concurrent exit
    // cannot miss the child while reparenting.
    super::wait::with_wait_lock(|| {
        child.inner.lock().parent = Some(parent.index);
    });

    {
        let mut g = child.inner.lock();
        g.state = ProcState::Runnable;
        sched::queue::add_task(child.index);
    }

    Ok(pid)
}
