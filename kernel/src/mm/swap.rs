//! RAM-backed swap tier.
//!
//! The swap area is a contiguous run of page-sized slots in physical
//! memory past the allocator region, reached through its own kernel
//! window (this machine model has no disk). A bitmap tracks slot usage;
//! every used slot is referenced by exactly one swapped PTE.
//!
//! When a demand fill finds the page allocator empty, a victim page is
//! stolen from another process: two passes over the process table, the
//! first preferring pages with `A = 0` and `D = 0`, the second taking
//! anything. Both passes failing means memory plus swap are exhausted,
//! which is fatal.

use crate::error::KernelResult;
use crate::memlayout::{is_page_aligned, PAGE_SIZE, SWAP_AREA_VA, SWAP_SLOTS};
use crate::mm::page_table::{walk, Pte, PteFlags};
use crate::mm::vas::MmInner;
use crate::mm::{page_alloc, PhysAddr};
use crate::process::{self, ProcState};
use crate::sync::SpinLock;

/// Slot-usage bitmap.
pub struct SwapMap {
    words: [u64; SWAP_SLOTS / 64],
    used: usize,
}

impl SwapMap {
    pub const fn new() -> Self {
        Self {
            words: [0; SWAP_SLOTS / 64],
            used: 0,
        }
    }

    /// Claim the lowest free slot.
    pub fn alloc_slot(&mut self) -> Option<usize> {
        for (wi, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                *word |= 1 << bit;
                self.used += 1;
                return Some(wi * 64 + bit);
            }
        }
        None
    }

    pub fn free_slot(&mut self, idx: usize) {
        let (wi, bit) = (idx / 64, idx % 64);
        assert!(self.words[wi] & (1 << bit) != 0, "free of free swap slot {idx}");
        self.words[wi] &= !(1 << bit);
        self.used -= 1;
    }

    pub fn is_used(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

static SWAP: SpinLock<SwapMap> = SpinLock::new("swap", SwapMap::new());

pub fn init() {
    log::info!(
        "swap: {} slots ({} KiB) at va {:#x}",
        SWAP_SLOTS,
        SWAP_SLOTS * PAGE_SIZE / 1024,
        SWAP_AREA_VA
    );
}

pub fn used_slots() -> usize {
    SWAP.lock().used()
}

/// Release a slot that is no longer referenced by any PTE.
pub fn free_slot(idx: usize) {
    SWAP.lock().free_slot(idx);
}

fn slot_kva(idx: usize) -> usize {
    SWAP_AREA_VA + idx * PAGE_SIZE
}

/// Bring the swapped page at `va` back in: allocate a fresh page (stealing
/// if needed), copy the slot's contents, release the slot and rewrite the
/// PTE as present with its preserved permissions.
pub fn swap_in(inner: &mut MmInner, va: usize) -> KernelResult<()> {
    assert!(is_page_aligned(va));

    let slot_ptr = walk(inner.pgt, va, false).expect("swap_in of unmapped va");
    // SAFETY: the slot belongs to this map; the map lock is held.
    let pte = unsafe { *slot_ptr.as_ptr() };
    assert!(pte.is_swapped(), "swap_in of non-swapped pte");
    let idx = pte.swap_slot();

    let pa = alloc_page_or_steal();
    // SAFETY: the slot window is a kernel mapping of the swap area and
    // the fresh page is ours; both span PAGE_SIZE bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(slot_kva(idx) as *const u8, pa.kva() as *mut u8, PAGE_SIZE)
    };
    free_slot(idx);

    // SAFETY: as above.
    unsafe { *slot_ptr.as_ptr() = Pte::new_leaf(pa, pte.flags().rwx() | PteFlags::U) };
    crate::arch::sfence_vma();
    Ok(())
}

/// Allocate a physical page, falling back to stealing a victim page from
/// another process when the allocator is exhausted. Total exhaustion of
/// memory and swap is fatal.
pub fn alloc_page_or_steal() -> PhysAddr {
    if let Some(pa) = page_alloc::alloc_page() {
        return pa;
    }
    swap_out()
}

/// Pick a victim page, write it to a free swap slot and return the freed
/// physical page. Pass 1 approximates a clock hand by requiring both
/// `A = 0` and `D = 0`; pass 2 takes any present user page.
fn swap_out() -> PhysAddr {
    let current = crate::cpu::current_proc_index();

    for check_ad in [true, false] {
        for i in 0..process::NPROC {
            if Some(i) == current {
                continue;
            }
            let p = process::table::proc(i);
            if p.inner.holding() {
                continue;
            }
            let guard = p.inner.lock();
            let stealable = matches!(
                guard.state,
                ProcState::Runnable | ProcState::Sleeping | ProcState::Zombie
            );
            if !stealable {
                continue;
            }
            let Some(mm) = guard.mm else { continue };
            // SAFETY: mm stays alive while the owner's process lock is
            // held; the victim is not running so its map is not installed
            // on any hart.
            let mm_ref = unsafe { mm.as_ref() };
            let mut mi = mm_ref.inner.lock();
            if let Some(pa) = grasp_page(&mut mi, check_ad) {
                return pa;
            }
        }
    }
    panic!("out of memory: no victim page and no free swap slot");
}

/// Scan the victim map for the first present user page that passes the
/// `A`/`D` filter, move it into a swap slot, and rewrite its PTE to the
/// swapped encoding (RWX preserved). Returns the freed physical page.
fn grasp_page(mi: &mut MmInner, check_ad: bool) -> Option<PhysAddr> {
    let mut cur = mi.first_vma();
    while let Some(v) = cur {
        // SAFETY: the victim's map lock is held.
        let (start, end, next) = unsafe {
            let vma = v.as_ref();
            (vma.vm_start, vma.vm_end, vma.next)
        };
        let mut va = start;
        while va < end {
            if let Some(slot) = walk(mi.pgt, va, false) {
                // SAFETY: slot belongs to the victim map, lock held.
                let pte = unsafe { *slot.as_ptr() };
                if pte.is_valid() && pte.is_user() {
                    let touched = pte.flags().intersects(PteFlags::A | PteFlags::D);
                    if !(check_ad && touched) {
                        let idx = SWAP.lock().alloc_slot()?;
                        let pa = pte.pa();
                        log::debug!("swap out: va {va:#x}, pa {:#x}, slot {idx}", pa.0);
                        // SAFETY: the page is live (its PTE is valid) and
                        // the slot window covers PAGE_SIZE bytes.
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                pa.kva() as *const u8,
                                slot_kva(idx) as *mut u8,
                                PAGE_SIZE,
                            );
                            *slot.as_ptr() = Pte::new_swapped(idx, pte.flags());
                        }
                        return Some(pa);
                    }
                }
            }
            va += PAGE_SIZE;
        }
        cur = next;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_accounting() {
        let mut map = SwapMap::new();
        assert_eq!(map.used(), 0);

        let a = map.alloc_slot().unwrap();
        let b = map.alloc_slot().unwrap();
        assert_ne!(a, b);
        assert!(map.is_used(a) && map.is_used(b));
        assert_eq!(map.used(), 2);

        map.free_slot(a);
        assert!(!map.is_used(a));
        assert_eq!(map.used(), 1);

        // the freed slot is handed out again
        assert_eq!(map.alloc_slot().unwrap(), a);
    }

    #[test]
    fn fills_a_whole_word() {
        let mut map = SwapMap::new();
        for i in 0..65 {
            assert_eq!(map.alloc_slot().unwrap(), i);
        }
        assert_eq!(map.used(), 65);
    }

    #[test]
    #[should_panic(expected = "free of free swap slot")]
    fn double_free_slot() {
        let mut map = SwapMap::new();
        let a = map.alloc_slot().unwrap();
        map.free_slot(a);
        map.free_slot(a);
    }
}
