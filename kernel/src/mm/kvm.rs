//! The kernel page table.
//!
//! Built once by the boot hart and installed on every hart:
//!
//! - an identity map of DRAM (the kernel image executes from its load
//!   address),
//! - the high direct map (`KVA = PA + DIRECT_MAP_BASE`) used for all
//!   by-physical-address data access,
//! - the swap-area window,
//! - identity-mapped device MMIO (UART, PLIC),
//! - the trampoline page at the top virtual address, so the user trap
//!   vector keeps executing across the satp switch.
//!
//! DRAM and the swap window use 2 MiB leaf PTEs at level 1; MMIO and the
//! trampoline use 4 KiB leaves.

use spin::Once;

use crate::memlayout::{
    DDR_BASE, DIRECT_MAP_BASE, PAGE_SIZE, PLIC_PHYS, PLIC_SIZE, SWAP_AREA_PA, SWAP_AREA_VA,
    SWAP_SLOTS, TRAMPOLINE, UART0_PHYS,
};
use crate::mm::page_table::{px, PageTable, Pte, PteFlags};
use crate::mm::{page_alloc, zero_page, PhysAddr};

const MEGAPAGE: usize = 2 * 1024 * 1024;

static KERNEL_ROOT: Once<PhysAddr> = Once::new();

pub fn kernel_root() -> PhysAddr {
    *KERNEL_ROOT.get().expect("kernel page table not built")
}

fn alloc_table() -> PhysAddr {
    let pa = page_alloc::alloc_page().expect("kvm: out of pages");
    zero_page(pa);
    pa
}

/// Install a 2 MiB leaf at level 1. `va` and `pa` must be 2 MiB aligned.
fn map_megapage(root: PhysAddr, va: usize, pa: PhysAddr, flags: PteFlags) {
    assert!(va % MEGAPAGE == 0 && pa.0 % MEGAPAGE == 0);
    // SAFETY: root and any table reached from it are pages owned by the
    // boot hart; nothing else runs during kvm construction.
    let top = unsafe { PageTable::from_pa(root) };
    let slot = px(2, va);
    if !top[slot].is_valid() {
        top[slot] = Pte::new_table(alloc_table());
    }
    let mid_pa = top[slot].pa();
    // SAFETY: as above.
    let mid = unsafe { PageTable::from_pa(mid_pa) };
    let entry = &mut mid[px(1, va)];
    assert!(entry.is_absent(), "kvm: megapage remap at {va:#x}");
    *entry = Pte::new_leaf(pa, flags);
}

/// Install a 4 KiB leaf, creating interior tables as needed.
fn map_page(root: PhysAddr, va: usize, pa: PhysAddr, flags: PteFlags) {
    assert!(va % PAGE_SIZE == 0 && pa.is_page_aligned());
    let mut table_pa = root;
    for level in [2, 1] {
        // SAFETY: boot-hart-owned tables, single threaded construction.
        let table = unsafe { PageTable::from_pa(table_pa) };
        let entry = &mut table[px(level, va)];
        if !entry.is_valid() {
            *entry = Pte::new_table(alloc_table());
        }
        assert!(!entry.is_leaf(), "kvm: walking through a megapage");
        table_pa = entry.pa();
    }
    // SAFETY: as above.
    let table = unsafe { PageTable::from_pa(table_pa) };
    let entry = &mut table[px(0, va)];
    assert!(entry.is_absent(), "kvm: remap at {va:#x}");
    *entry = Pte::new_leaf(pa, flags);
}

fn map_region_megapages(root: PhysAddr, va: usize, pa: usize, size: usize, flags: PteFlags) {
    let mut off = 0;
    while off < size {
        map_megapage(root, va + off, PhysAddr::new(pa + off), flags);
        off += MEGAPAGE;
    }
}

/// Build the kernel page table. Boot hart only, after the page allocator
/// is up. `dram_size` covers the kernel image, the allocator region and
/// the swap area; `trampoline_pa` is the physical location of the
/// trampoline page.
pub fn init(dram_size: usize, trampoline_pa: PhysAddr) {
    let rw = PteFlags::R | PteFlags::W | PteFlags::A | PteFlags::D;
    let rwx = rw | PteFlags::X;

    let root = alloc_table();

    // Kernel executes from the identity window.
    map_region_megapages(root, DDR_BASE, DDR_BASE, dram_size, rwx);

    // Data view of the same memory through the direct map.
    map_region_megapages(root, DIRECT_MAP_BASE + DDR_BASE, DDR_BASE, dram_size, rw);

    // The swap area window (the slots live past the managed region).
    map_region_megapages(root, SWAP_AREA_VA, SWAP_AREA_PA, SWAP_SLOTS * PAGE_SIZE, rw);

    // Device MMIO.
    map_page(root, UART0_PHYS, PhysAddr::new(UART0_PHYS), rw);
    map_region_megapages(root, PLIC_PHYS, PLIC_PHYS, PLIC_SIZE, rw);

    // The trampoline executes at the top VA on both sides of the user/
    // kernel satp switch.
    map_page(
        root,
        TRAMPOLINE,
        trampoline_pa,
        PteFlags::R | PteFlags::X | PteFlags::A,
    );

    KERNEL_ROOT.call_once(|| root);
    log::info!("kvm: kernel page table at {:#x}", root.0);
}

/// Point this hart's satp at the kernel page table.
#[cfg(target_arch = "riscv64")]
pub fn init_hart() {
    use crate::arch::riscv;
    crate::arch::sfence_vma();
    riscv::w_satp(riscv::make_satp(kernel_root().0));
    crate::arch::sfence_vma();
}
