//! Per-process address spaces.
//!
//! An [`Mm`] owns an Sv39 root table and a singly linked list of [`Vma`]s.
//! Mapping a VMA installs demand markers only; physical pages materialise
//! through the page-fault path. All operations on a map run under its
//! spinlock; `Vma` objects are reached through raw pointers owned by the
//! list, which the lock serializes.

use core::ptr::NonNull;

use spin::Once;

use crate::error::{KernelError, KernelResult};
use crate::memlayout::{is_page_aligned, is_user_va, PAGE_SIZE, TRAMPOLINE, TRAPFRAME};
use crate::mm::page_table::{free_page_table, walk, Pte, PteFlags};
use crate::mm::slab::{ObjectPool, PoolStats};
use crate::mm::{copy_page, page_alloc, swap, uaccess, zero_page, PhysAddr};
use crate::sync::SpinLock;

/// How the pages of a VMA are filled on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Anonymous memory, zero on first access.
    Zero,
    /// File-backed: the first `filesz` bytes of the range come from the
    /// in-memory image at `base + offset`; the tail is zero (BSS).
    Image {
        /// Kernel address of the image start.
        base: usize,
        /// Byte offset of this segment within the image.
        offset: usize,
        /// Bytes of the range that come from the image.
        filesz: usize,
    },
}

/// A contiguous user address range with uniform permissions and a single
/// backing policy. `U` is implicit; `flags` carries R/W/X only.
pub struct Vma {
    pub vm_start: usize,
    pub vm_end: usize,
    pub flags: PteFlags,
    pub backing: Backing,
    pub owner: NonNull<Mm>,
    pub next: Option<NonNull<Vma>>,
}

pub struct MmInner {
    /// Root page-table page.
    pub pgt: PhysAddr,
    vma_head: Option<NonNull<Vma>>,
    refcnt: usize,
}

// SAFETY: the VMA list pointers are only followed under the map lock.
unsafe impl Send for MmInner {}

/// A process address space.
pub struct Mm {
    pub inner: SpinLock<MmInner>,
}

static MM_POOL: ObjectPool<Mm> = ObjectPool::new("mm");
static VMA_POOL: ObjectPool<Vma> = ObjectPool::new("vma");

/// Physical address of the trampoline page, recorded once at boot and
/// mapped into every address space.
static TRAMPOLINE_PA: Once<PhysAddr> = Once::new();

pub fn set_trampoline(pa: PhysAddr) {
    TRAMPOLINE_PA.call_once(|| pa);
}

/// Initialize the address-space and VMA pools. Boot hart only.
pub fn uvm_init() {
    MM_POOL.init(crate::process::NPROC * 2);
    VMA_POOL.init(crate::process::NPROC * 8);
}

pub fn mm_pool_stats() -> PoolStats {
    MM_POOL.stats()
}

pub fn vma_pool_stats() -> PoolStats {
    VMA_POOL.stats()
}

/// Half-open interval intersection.
pub const fn ranges_overlap(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    a_start < b_end && b_start < a_end
}

impl MmInner {
    /// Does `[start, end)` intersect any VMA other than `exclude`?
    fn overlaps(&self, start: usize, end: usize, exclude: Option<NonNull<Vma>>) -> bool {
        if start == end {
            return false;
        }
        let mut cur = self.vma_head;
        while let Some(v) = cur {
            // SAFETY: list nodes are owned by this map and the map lock is
            // held by the caller.
            let vma = unsafe { v.as_ref() };
            if Some(v) != exclude && ranges_overlap(start, end, vma.vm_start, vma.vm_end) {
                return true;
            }
            cur = vma.next;
        }
        false
    }

    /// The VMA containing `va`, if any.
    pub fn find_vma(&self, va: usize) -> Option<NonNull<Vma>> {
        let mut cur = self.vma_head;
        while let Some(v) = cur {
            // SAFETY: see overlaps.
            let vma = unsafe { v.as_ref() };
            if va >= vma.vm_start && va < vma.vm_end {
                return Some(v);
            }
            cur = vma.next;
        }
        None
    }

    /// The VMA whose `vm_start` equals `start` (works for empty VMAs,
    /// which containment lookup cannot find).
    pub fn find_vma_starting(&self, start: usize) -> Option<NonNull<Vma>> {
        let mut cur = self.vma_head;
        while let Some(v) = cur {
            // SAFETY: see overlaps.
            let vma = unsafe { v.as_ref() };
            if vma.vm_start == start {
                return Some(v);
            }
            cur = vma.next;
        }
        None
    }

    pub fn first_vma(&self) -> Option<NonNull<Vma>> {
        self.vma_head
    }
}

/// Create a fresh address space with the two structural mappings every
/// process carries: the shared trampoline page (read+exec) and the
/// per-process trapframe page (read/write), neither of which is a VMA.
pub fn mm_create(trapframe_pa: PhysAddr) -> Option<NonNull<Mm>> {
    let root = page_alloc::alloc_page()?;
    zero_page(root);

    let mm = match MM_POOL.alloc_init(Mm {
        inner: SpinLock::new("mm", MmInner {
            pgt: root,
            vma_head: None,
            refcnt: 1,
        }),
    }) {
        Some(mm) => mm,
        None => {
            page_alloc::free_page(root);
            return None;
        }
    };

    let trampoline_pa = *TRAMPOLINE_PA.get().expect("trampoline not recorded");
    let structural = [
        (TRAMPOLINE, trampoline_pa, PteFlags::R | PteFlags::X | PteFlags::A),
        (
            TRAPFRAME,
            trapframe_pa,
            PteFlags::R | PteFlags::W | PteFlags::A | PteFlags::D,
        ),
    ];

    for (va, pa, flags) in structural {
        match walk(root, va, true) {
            Some(mut pte) => {
                // SAFETY: walk returned a slot in a table owned by this
                // fresh, not-yet-shared map.
                unsafe { *pte.as_mut() = Pte::new_leaf(pa, flags) };
            }
            None => {
                free_page_table(root);
                MM_POOL.free(mm);
                return None;
            }
        }
    }

    Some(mm)
}

/// Allocate a VMA owned by `mm`. The caller fills in the range before
/// mapping it; until `mm_mappages` succeeds the object is loose and must
/// be returned with [`free_loose_vma`] on error paths.
pub fn create_vma(mm: NonNull<Mm>) -> Option<NonNull<Vma>> {
    VMA_POOL.alloc_init(Vma {
        vm_start: 0,
        vm_end: 0,
        flags: PteFlags::empty(),
        backing: Backing::Zero,
        owner: mm,
        next: None,
    })
}

/// Return a VMA that was never inserted into its map's list.
pub fn free_loose_vma(vma: NonNull<Vma>) {
    VMA_POOL.free(vma);
}

/// Install the demand mappings for `vma` and link it into its map.
///
/// Every leaf slot in the range is set to the lazy marker; no physical
/// pages are allocated. On failure all slots installed so far are rolled
/// back and the VMA is left loose for the caller to discard.
pub fn mm_mappages(inner: &mut MmInner, vma: NonNull<Vma>) -> KernelResult<()> {
    // SAFETY: the caller holds the map lock and the VMA is not yet shared.
    let v = unsafe { &mut *vma.as_ptr() };

    if !is_user_va(v.vm_start) || !is_user_va(v.vm_end) {
        panic!(
            "user mapping beyond the user window: [{:#x}, {:#x})",
            v.vm_start, v.vm_end
        );
    }
    assert!(is_page_aligned(v.vm_start) && is_page_aligned(v.vm_end));
    assert!(!v.flags.rwx().is_empty(), "VMA with empty permissions");

    if inner.overlaps(v.vm_start, v.vm_end, Some(vma)) {
        log::error!("mappages: overlap [{:#x}, {:#x})", v.vm_start, v.vm_end);
        return Err(KernelError::Overlap {
            start: v.vm_start,
            end: v.vm_end,
        });
    }

    let mut va = v.vm_start;
    while va < v.vm_end {
        let slot = match walk(inner.pgt, va, true) {
            Some(p) => p,
            None => {
                rollback_range(inner, v.vm_start, va);
                return Err(KernelError::OutOfMemory);
            }
        };
        // SAFETY: slot points into this map's tables; the map lock is held.
        unsafe {
            if !slot.as_ref().is_absent() {
                log::error!("mappages: remap at {va:#x}");
                rollback_range(inner, v.vm_start, va);
                return Err(KernelError::InvalidArgument { name: "va" });
            }
            *slot.as_ptr() = Pte::new_lazy(v.flags);
        }
        va += PAGE_SIZE;
    }
    crate::arch::sfence_vma();

    v.next = inner.vma_head;
    inner.vma_head = Some(vma);
    Ok(())
}

/// Clear the lazy slots `[start, end)` installed by a failed mappages.
fn rollback_range(inner: &mut MmInner, start: usize, end: usize) {
    let mut va = start;
    while va < end {
        if let Some(slot) = walk(inner.pgt, va, false) {
            // SAFETY: slot is in this map's tables under the map lock.
            unsafe { *slot.as_ptr() = Pte::empty() };
        }
        va += PAGE_SIZE;
    }
    crate::arch::sfence_vma();
}

/// Grow or shrink `vma` to `[start, end)` with the given permissions.
///
/// Two phases: first every page of the new range is made real — new pages
/// allocated eagerly, retained slots rewritten with the new flags — and
/// only then are pages outside the new range released. If allocation
/// fails in phase one, every introduced mapping is removed and retained
/// slots get their prior flags back, leaving the VMA untouched.
pub fn mm_remap(
    inner: &mut MmInner,
    vma: NonNull<Vma>,
    start: usize,
    end: usize,
    flags: PteFlags,
) -> KernelResult<()> {
    // SAFETY: caller holds the map lock; the VMA belongs to this map.
    let v = unsafe { &mut *vma.as_ptr() };

    assert!(is_page_aligned(start) && is_page_aligned(end));
    assert!(!flags.rwx().is_empty());

    if inner.overlaps(start, end, Some(vma)) {
        return Err(KernelError::Overlap { start, end });
    }

    let iter_start = start.min(v.vm_start);
    let iter_end = end.max(v.vm_end);

    // Phase one: populate and retag the new range.
    let mut va = iter_start;
    while va < iter_end {
        if va >= start && va < end {
            let slot = match walk(inner.pgt, va, true) {
                Some(p) => p,
                None => return remap_rollback(inner, v, iter_start, iter_end, start, end),
            };
            // SAFETY: slot is in this map's tables under the map lock.
            unsafe {
                let pte = *slot.as_ptr();
                *slot.as_ptr() = if pte.is_valid() {
                    Pte::new_leaf(pte.pa(), (pte.flags() - PteFlags::R - PteFlags::W - PteFlags::X) | flags.rwx())
                } else if pte.is_lazy() {
                    Pte::new_lazy(flags)
                } else if pte.is_swapped() {
                    Pte::new_swapped(pte.swap_slot(), flags)
                } else {
                    let pa = match page_alloc::alloc_page() {
                        Some(pa) => pa,
                        None => {
                            return remap_rollback(inner, v, iter_start, iter_end, start, end)
                        }
                    };
                    Pte::new_leaf(pa, flags.rwx() | PteFlags::U)
                };
            }
        }
        va += PAGE_SIZE;
    }

    // Phase two: release everything that fell outside the new range.
    let mut va = iter_start;
    while va < iter_end {
        if va < start || va >= end {
            release_slot(inner, va);
        }
        va += PAGE_SIZE;
    }
    crate::arch::sfence_vma();

    v.vm_start = start;
    v.vm_end = end;
    v.flags = flags.rwx();
    Ok(())
}

/// Undo a partially applied phase one of `mm_remap`.
fn remap_rollback(
    inner: &mut MmInner,
    v: &Vma,
    iter_start: usize,
    iter_end: usize,
    _start: usize,
    _end: usize,
) -> KernelResult<()> {
    let mut va = iter_start;
    while va < iter_end {
        if va < v.vm_start || va >= v.vm_end {
            // introduced by phase one; remove it again
            release_slot(inner, va);
        } else if let Some(slot) = walk(inner.pgt, va, false) {
            // retained; restore the old permissions
            // SAFETY: slot is in this map's tables under the map lock.
            unsafe {
                let pte = *slot.as_ptr();
                *slot.as_ptr() = if pte.is_valid() {
                    Pte::new_leaf(pte.pa(), (pte.flags() - PteFlags::R - PteFlags::W - PteFlags::X) | v.flags.rwx())
                } else if pte.is_lazy() {
                    Pte::new_lazy(v.flags)
                } else if pte.is_swapped() {
                    Pte::new_swapped(pte.swap_slot(), v.flags)
                } else {
                    pte
                };
            }
        }
        va += PAGE_SIZE;
    }
    crate::arch::sfence_vma();
    Err(KernelError::OutOfMemory)
}

/// Release whatever the leaf slot at `va` holds: a present page goes back
/// to the page allocator, a swapped page releases its slot, a lazy marker
/// is simply cleared.
fn release_slot(inner: &mut MmInner, va: usize) {
    if let Some(slot) = walk(inner.pgt, va, false) {
        // SAFETY: slot is in this map's tables under the map lock.
        unsafe {
            let pte = *slot.as_ptr();
            if pte.is_valid() {
                page_alloc::free_page(pte.pa());
            } else if pte.is_swapped() {
                swap::free_slot(pte.swap_slot());
            }
            *slot.as_ptr() = Pte::empty();
        }
    }
}

/// Fork copy: replicate every VMA of `parent` into `child` and copy page
/// contents. Pages that are lazy or swapped in the parent are materialised
/// on the way (demand paging runs in both directions). On failure every
/// VMA installed in the child is freed and the child map is left empty.
pub fn mm_copy(
    parent: &mut MmInner,
    child_mm: NonNull<Mm>,
    child: &mut MmInner,
) -> KernelResult<()> {
    let mut cur = parent.vma_head;
    while let Some(vp) = cur {
        // SAFETY: parent map lock is held.
        let pvma = unsafe { vp.as_ref() };

        let nv = match create_vma(child_mm) {
            Some(nv) => nv,
            None => return copy_unwind(child),
        };
        // SAFETY: nv is loose and exclusively ours.
        unsafe {
            let n = &mut *nv.as_ptr();
            n.vm_start = pvma.vm_start;
            n.vm_end = pvma.vm_end;
            n.flags = pvma.flags;
            // contents come from the parent, not from the original image
            n.backing = Backing::Zero;
        }
        if mm_mappages(child, nv).is_err() {
            free_loose_vma(nv);
            return copy_unwind(child);
        }

        let mut va = pvma.vm_start;
        while va < pvma.vm_end {
            let child_pa = match uaccess::resolve_user_page(child, va) {
                Some(pa) => pa,
                None => return copy_unwind(child),
            };
            let parent_pa = match uaccess::resolve_user_page(parent, va) {
                Some(pa) => pa,
                None => return copy_unwind(child),
            };
            copy_page(child_pa, parent_pa);
            va += PAGE_SIZE;
        }

        cur = pvma.next;
    }
    Ok(())
}

fn copy_unwind(child: &mut MmInner) -> KernelResult<()> {
    mm_free_pages(child);
    Err(KernelError::OutOfMemory)
}

/// Tear down every VMA of the map: release all leaf slots and return the
/// VMA objects to their pool. The page-table tree itself stays.
pub fn mm_free_pages(inner: &mut MmInner) {
    while let Some(v) = inner.vma_head {
        // SAFETY: the map lock is held and the list is being consumed.
        let (start, end, next) = unsafe {
            let vma = v.as_ref();
            (vma.vm_start, vma.vm_end, vma.next)
        };
        let mut va = start;
        while va < end {
            release_slot(inner, va);
            va += PAGE_SIZE;
        }
        inner.vma_head = next;
        VMA_POOL.free(v);
    }
    crate::arch::sfence_vma();
}

/// Release the whole address space: VMAs, backing pages, the page-table
/// tree, and — once the reference count drops to zero — the map object.
pub fn mm_free(mm: NonNull<Mm>) {
    // SAFETY: mm is a live pool object; the lock serializes teardown.
    let mm_ref = unsafe { mm.as_ref() };
    let mut inner = mm_ref.inner.lock();
    assert!(inner.refcnt > 0);
    mm_free_pages(&mut inner);
    free_page_table(inner.pgt);
    inner.refcnt -= 1;
    let dead = inner.refcnt == 0;
    drop(inner);
    if dead {
        MM_POOL.free(mm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_formula() {
        assert!(ranges_overlap(0x1000, 0x3000, 0x2000, 0x4000));
        assert!(ranges_overlap(0x2000, 0x4000, 0x1000, 0x3000));
        // containment in both directions
        assert!(ranges_overlap(0x0000, 0x8000, 0x2000, 0x3000));
        assert!(ranges_overlap(0x2000, 0x3000, 0x0000, 0x8000));
        // touching ranges do not overlap
        assert!(!ranges_overlap(0x1000, 0x2000, 0x2000, 0x3000));
        // empty ranges never overlap
        assert!(!ranges_overlap(0x2000, 0x2000, 0x1000, 0x3000));
    }
}
