//! Safe user-space memory access.
//!
//! All kernel reads and writes of user memory funnel through
//! [`resolve_user_page`], which translates a user VA and transparently
//! drives demand paging and swap-in for lazy or swapped PTEs. A
//! translation that still fails is an error, never a fall-through into a
//! raw pointer. The caller holds the map lock; buffers may straddle pages.

use crate::error::{KernelError, KernelResult};
use crate::memlayout::{is_page_aligned, page_round_down, PAGE_SIZE};
use crate::mm::page_table::walk;
use crate::mm::vas::MmInner;
use crate::mm::{page_fault, swap, PhysAddr};

/// Translate the user page at `va` (page-aligned) to its physical page,
/// materialising it if the PTE is lazy or swapped. Returns `None` when
/// the address is simply not mapped — an explicit optional, so physical
/// frame zero cannot be confused with failure.
pub fn resolve_user_page(inner: &mut MmInner, va: usize) -> Option<PhysAddr> {
    assert!(is_page_aligned(va), "unaligned user page {va:#x}");

    // SAFETY: walk returns slots in tables owned by this map; the caller
    // holds the map lock.
    let pte = unsafe { *walk(inner.pgt, va, false)?.as_ptr() };

    if pte.is_valid() {
        if !pte.is_user() {
            log::warn!("translation hit a kernel-only pte at {va:#x}");
            return None;
        }
        return Some(pte.pa());
    }

    if pte.is_lazy() {
        page_fault::demand_fill(inner, va).ok()?;
    } else if pte.is_swapped() {
        swap::swap_in(inner, va).ok()?;
    } else {
        return None;
    }

    // SAFETY: as above.
    let pte = unsafe { *walk(inner.pgt, va, false)?.as_ptr() };
    if pte.is_valid() && pte.is_user() {
        Some(pte.pa())
    } else {
        None
    }
}

/// Kernel address of the byte the user sees at `va`, if mapped.
pub fn user_addr(inner: &mut MmInner, va: usize) -> Option<usize> {
    let page = resolve_user_page(inner, page_round_down(va))?;
    Some(page.kva() + (va & (PAGE_SIZE - 1)))
}

/// Copy `dst.len()` bytes out of user memory starting at `src_va`.
pub fn copy_from_user(inner: &mut MmInner, dst: &mut [u8], mut src_va: usize) -> KernelResult<()> {
    let mut copied = 0;
    while copied < dst.len() {
        let page_va = page_round_down(src_va);
        let pa = resolve_user_page(inner, page_va)
            .ok_or(KernelError::InvalidAddress { addr: src_va })?;
        let off = src_va - page_va;
        let n = (PAGE_SIZE - off).min(dst.len() - copied);
        // SAFETY: the resolved page is live for PAGE_SIZE bytes through
        // the direct map and off + n <= PAGE_SIZE.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (pa.kva() + off) as *const u8,
                dst.as_mut_ptr().add(copied),
                n,
            );
        }
        copied += n;
        src_va += n;
    }
    Ok(())
}

/// Copy `src` into user memory starting at `dst_va`.
pub fn copy_to_user(inner: &mut MmInner, dst_va: usize, src: &[u8]) -> KernelResult<()> {
    let mut copied = 0;
    let mut va = dst_va;
    while copied < src.len() {
        let page_va = page_round_down(va);
        let pa =
            resolve_user_page(inner, page_va).ok_or(KernelError::InvalidAddress { addr: va })?;
        let off = va - page_va;
        let n = (PAGE_SIZE - off).min(src.len() - copied);
        // SAFETY: as in copy_from_user.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                (pa.kva() + off) as *mut u8,
                n,
            );
        }
        copied += n;
        va += n;
    }
    Ok(())
}

/// Copy a NUL-terminated string out of user memory into `dst`. Returns
/// the string length (excluding the NUL). Fails if no terminator shows up
/// within `dst.len()` bytes.
pub fn copy_str_from_user(
    inner: &mut MmInner,
    dst: &mut [u8],
    mut src_va: usize,
) -> KernelResult<usize> {
    let mut len = 0;
    while len < dst.len() {
        let kva = user_addr(inner, src_va).ok_or(KernelError::InvalidAddress { addr: src_va })?;
        // SAFETY: user_addr resolved this byte through the direct map.
        let byte = unsafe { *(kva as *const u8) };
        dst[len] = byte;
        if byte == 0 {
            return Ok(len);
        }
        len += 1;
        src_va += 1;
    }
    Err(KernelError::InvalidArgument { name: "string" })
}
