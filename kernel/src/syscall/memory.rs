//! Memory system calls.

use crate::error::KernelError;
use crate::mm::vas;
use crate::process::my_proc;

/// Grow or shrink the program break by `n` bytes. Returns the old break
/// on success; `sbrk(0)` reports the current break without touching the
/// map. Shrinking below the heap base fails with `EINVAL` and changes
/// nothing.
pub fn sys_sbrk(n: i64) -> i64 {
    let p = my_proc();
    let (mm, brk_vma) = {
        let g = p.inner.lock();
        let mm = match g.mm {
            Some(mm) => mm,
            None => return KernelError::InvalidArgument { name: "brk" }.errno(),
        };
        let brk_vma = match g.brk_vma {
            Some(v) => v,
            None => return KernelError::InvalidArgument { name: "brk" }.errno(),
        };
        (mm, brk_vma)
    };

    // SAFETY: the map outlives its owning process.
    let mm_ref = unsafe { mm.as_ref() };
    let mut mi = mm_ref.inner.lock();

    // SAFETY: the heap VMA belongs to this map; its lock is held.
    let (start, end, flags) = unsafe {
        let v = brk_vma.as_ref();
        (v.vm_start, v.vm_end, v.flags)
    };

    let old_brk = end as i64;
    let new_brk = old_brk + n;
    if new_brk < start as i64 {
        log::warn!("sbrk: shrink below heap base requested");
        return KernelError::InvalidArgument { name: "n" }.errno();
    }

    match vas::mm_remap(&mut mi, brk_vma, start, new_brk as usize, flags) {
        Ok(()) => {
            drop(mi);
            p.inner.lock().brk = new_brk as usize;
            old_brk
        }
        Err(e) => e.errno(),
    }
}
