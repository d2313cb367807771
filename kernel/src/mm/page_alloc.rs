//! Physical page allocator.
//!
//! A singly linked freelist threaded through the free pages themselves
//! (via the direct map). Pages are poisoned on free and on alloc so stale
//! reads show up as recognisable garbage instead of silent corruption.

use core::ptr::NonNull;

use crate::memlayout::{is_page_aligned, PAGE_SIZE};
use crate::mm::PhysAddr;
use crate::sync::SpinLock;

/// Byte written over a page handed out by `alloc_page`.
pub const POISON_ALLOC: u8 = 0xaf;
/// Byte written over a page returned to the freelist.
pub const POISON_FREE: u8 = 0xdd;

struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

struct Inner {
    freelist: Option<NonNull<FreeNode>>,
    /// Managed physical region `[base, end)`.
    base: usize,
    end: usize,
    free_pages: usize,
    total_pages: usize,
}

// SAFETY: the raw freelist pointers are only dereferenced under the lock.
unsafe impl Send for Inner {}

static PAGES: SpinLock<Inner> = SpinLock::new("page_allocator", Inner {
    freelist: None,
    base: 0,
    end: 0,
    free_pages: 0,
    total_pages: 0,
});

/// Hand the physical region `[base, base + size)` to the allocator.
/// Boot hart only, once.
pub fn init(base: usize, mut size: usize) {
    assert!(is_page_aligned(base) && is_page_aligned(size));

    if cfg!(feature = "small-mem") {
        size = size.min(crate::memlayout::SMALL_MEM_PAGES * PAGE_SIZE);
    }

    let mut inner = PAGES.lock();
    assert!(inner.total_pages == 0, "page allocator initialized twice");
    inner.base = base;
    inner.end = base + size;

    // Push from the top down so allocation proceeds from the bottom up.
    let mut pa = base + size;
    while pa > base {
        pa -= PAGE_SIZE;
        free_into(&mut inner, PhysAddr::new(pa));
    }
    inner.total_pages = inner.free_pages;
    drop(inner);

    log::info!(
        "page allocator: [{:#x}, {:#x}), {} pages",
        base,
        base + size,
        size / PAGE_SIZE
    );
}

fn free_into(inner: &mut Inner, pa: PhysAddr) {
    assert!(
        pa.is_page_aligned() && pa.0 >= inner.base && pa.0 < inner.end,
        "free of invalid page {:#x}",
        pa.0
    );
    crate::mm::fill_page(pa, POISON_FREE);
    let node = pa.kva() as *mut FreeNode;
    // SAFETY: the page is owned by the allocator and unused; the first
    // word through the direct map is ours to use as a link.
    unsafe {
        (*node).next = inner.freelist;
        inner.freelist = Some(NonNull::new_unchecked(node));
    }
    inner.free_pages += 1;
}

/// Allocate one page. Returns `None` on exhaustion — callers decide
/// whether that is fatal (the swap tier steals a victim page instead).
pub fn alloc_page() -> Option<PhysAddr> {
    let mut inner = PAGES.lock();
    let node = inner.freelist?;
    // SAFETY: nodes on the freelist point at free pages through the
    // direct map; the link word is valid until the page is reused.
    inner.freelist = unsafe { node.as_ref().next };
    inner.free_pages -= 1;
    drop(inner);

    let pa = PhysAddr::from_kva(node.as_ptr() as usize);
    crate::mm::fill_page(pa, POISON_ALLOC);
    Some(pa)
}

/// Return a page to the freelist.
pub fn free_page(pa: PhysAddr) {
    let mut inner = PAGES.lock();
    free_into(&mut inner, pa);
}

pub fn free_page_count() -> usize {
    PAGES.lock().free_pages
}

pub fn total_pages() -> usize {
    PAGES.lock().total_pages
}

/// End of the managed region; the boot code places the swap area here.
pub fn managed_end() -> usize {
    PAGES.lock().end
}
