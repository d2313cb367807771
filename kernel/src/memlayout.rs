//! Physical and virtual memory layout.
//!
//! The kernel executes from the identity-mapped window at its load address
//! and reaches arbitrary physical pages through the high direct map
//! (`KVA = PA + DIRECT_MAP_OFFSET`). The swap area lives in RAM past the
//! managed physical region and has its own kernel window.

/// Size of a physical page / virtual page.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Base of DRAM on both the QEMU virt machine and the JH7110.
pub const DDR_BASE: usize = 0x8000_0000;

/// Physical memory managed by the page allocator ends here. Everything
/// past the kernel image up to this address belongs to the allocator.
pub const PHYS_MEM_SIZE: usize = 0x800_0000; // 128 MiB
pub const PHYS_MEM_END: usize = DDR_BASE + PHYS_MEM_SIZE;

/// With `small-mem` the allocator region is clamped so the swap tier is
/// exercised by moderately sized workloads.
pub const SMALL_MEM_PAGES: usize = 640;

/// Base of the kernel direct mapping of physical memory.
pub const DIRECT_MAP_BASE: usize = 0xffff_ffc0_0000_0000;

/// The RAM-backed swap area: `SWAP_SLOTS` pages of physical memory placed
/// immediately after the managed region, mapped at a dedicated window.
pub const SWAP_AREA_VA: usize = 0xffff_ffe0_0000_0000;
pub const SWAP_AREA_PA: usize = PHYS_MEM_END;
pub const SWAP_SLOTS: usize = 8192; // 32 MiB

/// One beyond the highest user virtual address. One bit short of the Sv39
/// maximum so addresses never need sign extension.
pub const MAX_VA: usize = 1 << (9 + 9 + 9 + 12 - 1);

pub const USER_TOP: usize = MAX_VA;
/// The trampoline page sits at the top of every address space.
pub const TRAMPOLINE: usize = USER_TOP - PAGE_SIZE;
/// The per-process trapframe page sits directly below the trampoline.
pub const TRAPFRAME: usize = TRAMPOLINE - PAGE_SIZE;

/// Top of the user stack (exclusive); the stack VMA grows down from here.
pub const USTACK_START: usize = TRAPFRAME;
pub const USTACK_SIZE: usize = 16 * PAGE_SIZE;

/// Per-process kernel stack, one page, reused across slot generations.
pub const KSTACK_SIZE: usize = PAGE_SIZE;

// Device MMIO (identity mapped).

pub const UART0_PHYS: usize = 0x1000_0000;
pub const PLIC_PHYS: usize = 0x0c00_0000;
pub const PLIC_SIZE: usize = 0x40_0000;

pub const QEMU_UART0_IRQ: u32 = 10;
pub const VF2_UART0_IRQ: u32 = 32;

/// Round `x` down to a page boundary.
pub const fn page_round_down(x: usize) -> usize {
    x & !(PAGE_SIZE - 1)
}

/// Round `x` up to a page boundary.
pub const fn page_round_up(x: usize) -> usize {
    (x + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn is_page_aligned(x: usize) -> bool {
    x & (PAGE_SIZE - 1) == 0
}

/// True for virtual addresses the user page-table walk is defined on.
pub const fn is_user_va(va: usize) -> bool {
    va < MAX_VA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3001));
    }

    #[test]
    fn user_window() {
        assert!(is_user_va(0));
        assert!(is_user_va(TRAMPOLINE));
        assert!(!is_user_va(MAX_VA));
        assert_eq!(TRAPFRAME + PAGE_SIZE, TRAMPOLINE);
        assert_eq!(USTACK_START, TRAPFRAME);
    }
}
