//! Memory management.
//!
//! Layering, leaves first: the physical page allocator (`page_alloc`),
//! fixed-size object pools over it (`slab`), Sv39 page tables
//! (`page_table`, `kvm`), per-process address spaces with VMAs (`vas`),
//! user-space access helpers (`uaccess`), and the demand-paging/swap tier
//! (`page_fault`, `swap`).

pub mod kvm;
pub mod page_alloc;
pub mod page_fault;
pub mod page_table;
pub mod slab;
pub mod swap;
pub mod uaccess;
pub mod vas;

use crate::memlayout::{DIRECT_MAP_BASE, PAGE_SIZE};

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// The kernel virtual address of this physical address through the
    /// direct map.
    pub const fn kva(self) -> usize {
        self.0 + DIRECT_MAP_BASE
    }

    pub const fn from_kva(kva: usize) -> Self {
        Self(kva - DIRECT_MAP_BASE)
    }

    pub const fn is_page_aligned(self) -> bool {
        crate::memlayout::is_page_aligned(self.0)
    }
}

/// Fill a whole physical page with `byte`.
pub fn fill_page(pa: PhysAddr, byte: u8) {
    debug_assert!(pa.is_page_aligned());
    // SAFETY: pa is a page owned by the caller and reachable through the
    // direct map for exactly PAGE_SIZE bytes.
    unsafe { core::ptr::write_bytes(pa.kva() as *mut u8, byte, PAGE_SIZE) };
}

/// Zero a whole physical page.
pub fn zero_page(pa: PhysAddr) {
    fill_page(pa, 0);
}

/// Copy one whole page `src` -> `dst`.
pub fn copy_page(dst: PhysAddr, src: PhysAddr) {
    debug_assert!(dst.is_page_aligned() && src.is_page_aligned());
    // SAFETY: both pages are owned by the caller, distinct, and reachable
    // through the direct map.
    unsafe {
        core::ptr::copy_nonoverlapping(src.kva() as *const u8, dst.kva() as *mut u8, PAGE_SIZE)
    };
}

/// Initialize the memory subsystem on the boot hart: object pools for
/// address spaces and VMAs. The page allocator region is handed over by
/// the boot code, which knows where the kernel image ends.
pub fn init() {
    vas::uvm_init();
    swap::init();
}

/// Memory diagnostics for the Ctrl-Q console dump.
pub fn dump() {
    crate::println!(
        "mem: {} of {} pages free, {} swap slots used",
        page_alloc::free_page_count(),
        page_alloc::total_pages(),
        swap::used_slots(),
    );
    for stats in [vas::mm_pool_stats(), vas::vma_pool_stats()] {
        crate::println!(
            "pool {}: {} allocated, {} available, {} max",
            stats.name,
            stats.allocated,
            stats.available,
            stats.max
        );
    }
}
