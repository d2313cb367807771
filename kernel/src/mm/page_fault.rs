//! User page-fault handling.
//!
//! The fault handler resolves the faulting PTE without allocating and
//! dispatches on its state: a lazy marker becomes a demand fill, a swap
//! marker becomes a swap-in, a present page missing `A`/`D` gets the bits
//! set in software (some implementations fault instead of maintaining
//! them in hardware), and anything else is fatal for the process.

use crate::error::{KernelError, KernelResult};
use crate::memlayout::{is_user_va, page_round_down, PAGE_SIZE};
use crate::mm::page_table::{walk, Pte, PteFlags};
use crate::mm::vas::{Backing, MmInner};
use crate::mm::{swap, zero_page};

/// The access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Load,
    Store,
    Fetch,
}

impl FaultKind {
    /// The permission bit this access requires.
    fn required(self) -> PteFlags {
        match self {
            FaultKind::Load => PteFlags::R,
            FaultKind::Store => PteFlags::W,
            FaultKind::Fetch => PteFlags::X,
        }
    }
}

/// Handle a user-mode page fault at `addr`. An error means the process
/// should be killed.
pub fn handle_user_fault(inner: &mut MmInner, kind: FaultKind, addr: usize) -> KernelResult<()> {
    if !is_user_va(addr) {
        return Err(KernelError::InvalidAddress { addr });
    }
    let va = page_round_down(addr);

    let pte = match walk(inner.pgt, va, false) {
        // SAFETY: the slot belongs to this map; the map lock is held.
        Some(slot) => unsafe { *slot.as_ptr() },
        None => Pte::empty(),
    };

    if pte.is_lazy() {
        return demand_fill(inner, va);
    }
    if pte.is_swapped() {
        return swap::swap_in(inner, va);
    }
    if pte.is_valid() {
        if !pte.is_user() || !pte.flags().contains(kind.required()) {
            return Err(KernelError::InvalidAddress { addr });
        }
        // Software A/D maintenance.
        let mut flags = pte.flags() | PteFlags::A;
        if kind == FaultKind::Store {
            flags |= PteFlags::D;
        }
        // SAFETY: the slot exists (the walk above found a valid entry).
        unsafe {
            let slot = walk(inner.pgt, va, false).expect("valid pte vanished");
            *slot.as_ptr() = Pte::new_leaf(pte.pa(), flags);
        }
        crate::arch::sfence_vma();
        return Ok(());
    }

    Err(KernelError::UnmappedMemory { addr })
}

/// Materialise the lazy page at `va`: allocate (stealing a victim page if
/// the allocator is dry), zero-fill, then overlay bytes from the backing
/// image when the address falls inside the file-backed prefix of its VMA.
pub fn demand_fill(inner: &mut MmInner, va: usize) -> KernelResult<()> {
    let vma = inner
        .find_vma(va)
        .ok_or(KernelError::UnmappedMemory { addr: va })?;
    // SAFETY: the VMA is owned by this map and the map lock is held.
    let (flags, backing, vm_start) = unsafe {
        let v = vma.as_ref();
        (v.flags, v.backing, v.vm_start)
    };

    let pa = swap::alloc_page_or_steal();
    zero_page(pa);

    if let Backing::Image {
        base,
        offset,
        filesz,
    } = backing
    {
        let seg_off = va - vm_start;
        if seg_off < filesz {
            let n = PAGE_SIZE.min(filesz - seg_off);
            // SAFETY: the image is a kernel-resident byte range covering
            // offset + seg_off + n, and the fresh page is ours.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (base + offset + seg_off) as *const u8,
                    pa.kva() as *mut u8,
                    n,
                );
            }
        }
    }

    let slot = match walk(inner.pgt, va, true) {
        Some(slot) => slot,
        None => {
            crate::mm::page_alloc::free_page(pa);
            return Err(KernelError::OutOfMemory);
        }
    };
    // SAFETY: the slot belongs to this map; the map lock is held.
    unsafe { *slot.as_ptr() = Pte::new_leaf(pa, flags.rwx() | PteFlags::U) };
    crate::arch::sfence_vma();
    Ok(())
}
