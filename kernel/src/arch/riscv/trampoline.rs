//! Trap entry stubs.
//!
//! Two vectors: the trampoline (`uservec`/`userret`), a single page mapped
//! at the top of every address space so traps can switch page tables
//! safely, and `kernelvec` for traps taken while in supervisor mode.
//!
//! The register save offsets below must match the field order of
//! [`crate::trap::TrapFrame`] and the kernelvec frame must match
//! [`crate::trap::KernelTrapFrame`].

use core::arch::global_asm;

use crate::memlayout::TRAPFRAME;

// The trapframe VA is baked into uservec below.
const _: () = assert!(TRAPFRAME == 0x3f_ffff_e000);

extern "C" {
    /// First byte of the trampoline page.
    pub fn trampoline();
    /// User trap entry, inside the trampoline page.
    pub fn uservec();
    /// User trap return, inside the trampoline page.
    pub fn userret();
    /// Kernel trap entry (direct mode vector).
    pub fn kernelvec();
}

global_asm!(
    r#"
    .section .text.trampoline
    .align 12
    .globl trampoline
trampoline:
    .globl uservec
    .align 4
# All traps from user mode arrive here. The trapframe page is mapped at a
# fixed virtual address in every process, so user registers can be saved
# before switching to the kernel page table.
uservec:
    csrw sscratch, a0
    # the trapframe page is mapped at MAXVA - 2 pages in every process
    li a0, 0x3fffffe000

    sd ra, 40(a0)
    sd sp, 48(a0)
    sd gp, 56(a0)
    sd tp, 64(a0)
    sd t0, 72(a0)
    sd t1, 80(a0)
    sd t2, 88(a0)
    sd s0, 96(a0)
    sd s1, 104(a0)
    sd a1, 120(a0)
    sd a2, 128(a0)
    sd a3, 136(a0)
    sd a4, 144(a0)
    sd a5, 152(a0)
    sd a6, 160(a0)
    sd a7, 168(a0)
    sd s2, 176(a0)
    sd s3, 184(a0)
    sd s4, 192(a0)
    sd s5, 200(a0)
    sd s6, 208(a0)
    sd s7, 216(a0)
    sd s8, 224(a0)
    sd s9, 232(a0)
    sd s10, 240(a0)
    sd s11, 248(a0)
    sd t3, 256(a0)
    sd t4, 264(a0)
    sd t5, 272(a0)
    sd t6, 280(a0)

    # the user a0 parked in sscratch
    csrr t0, sscratch
    sd t0, 112(a0)

    # kernel stack, hart id, trap handler, kernel page table
    ld sp, 8(a0)
    ld tp, 32(a0)
    ld t0, 16(a0)
    ld t1, 0(a0)

    sfence.vma zero, zero
    csrw satp, t1
    sfence.vma zero, zero

    jr t0

    .globl userret
    .align 4
# userret(a0: trapframe VA, a1: user satp, a2: user stvec)
# Restore user registers from the trapframe and sret to user mode.
userret:
    sfence.vma zero, zero
    csrw satp, a1
    sfence.vma zero, zero
    csrw stvec, a2

    ld ra, 40(a0)
    ld sp, 48(a0)
    ld gp, 56(a0)
    ld tp, 64(a0)
    ld t0, 72(a0)
    ld t1, 80(a0)
    ld t2, 88(a0)
    ld s0, 96(a0)
    ld s1, 104(a0)
    ld a1, 120(a0)
    ld a2, 128(a0)
    ld a3, 136(a0)
    ld a4, 144(a0)
    ld a5, 152(a0)
    ld a6, 160(a0)
    ld a7, 168(a0)
    ld s2, 176(a0)
    ld s3, 184(a0)
    ld s4, 192(a0)
    ld s5, 200(a0)
    ld s6, 208(a0)
    ld s7, 216(a0)
    ld s8, 224(a0)
    ld s9, 232(a0)
    ld s10, 240(a0)
    ld s11, 248(a0)
    ld t3, 256(a0)
    ld t4, 264(a0)
    ld t5, 272(a0)
    ld t6, 280(a0)

    ld a0, 112(a0)
    sret
"#
);

global_asm!(
    r#"
    .section .text
    .globl kernelvec
    .align 4
# Traps taken while in supervisor mode: save every register on the current
# kernel stack, hand the frame to kernel_trap, restore, sret.
kernelvec:
    addi sp, sp, -256

    sd ra, 0(sp)
    sd sp, 8(sp)
    sd gp, 16(sp)
    sd tp, 24(sp)
    sd t0, 32(sp)
    sd t1, 40(sp)
    sd t2, 48(sp)
    sd s0, 56(sp)
    sd s1, 64(sp)
    sd a0, 72(sp)
    sd a1, 80(sp)
    sd a2, 88(sp)
    sd a3, 96(sp)
    sd a4, 104(sp)
    sd a5, 112(sp)
    sd a6, 120(sp)
    sd a7, 128(sp)
    sd s2, 136(sp)
    sd s3, 144(sp)
    sd s4, 152(sp)
    sd s5, 160(sp)
    sd s6, 168(sp)
    sd s7, 176(sp)
    sd s8, 184(sp)
    sd s9, 192(sp)
    sd s10, 200(sp)
    sd s11, 208(sp)
    sd t3, 216(sp)
    sd t4, 224(sp)
    sd t5, 232(sp)
    sd t6, 240(sp)

    mv a0, sp
    call kernel_trap

    ld ra, 0(sp)
    ld gp, 16(sp)
    # tp holds the cpu id, do not restore from a possibly stale frame
    ld t0, 32(sp)
    ld t1, 40(sp)
    ld t2, 48(sp)
    ld s0, 56(sp)
    ld s1, 64(sp)
    ld a0, 72(sp)
    ld a1, 80(sp)
    ld a2, 88(sp)
    ld a3, 96(sp)
    ld a4, 104(sp)
    ld a5, 112(sp)
    ld a6, 120(sp)
    ld a7, 128(sp)
    ld s2, 136(sp)
    ld s3, 144(sp)
    ld s4, 152(sp)
    ld s5, 160(sp)
    ld s6, 168(sp)
    ld s7, 176(sp)
    ld s8, 184(sp)
    ld s9, 192(sp)
    ld s10, 200(sp)
    ld s11, 208(sp)
    ld t3, 216(sp)
    ld t4, 224(sp)
    ld t5, 232(sp)
    ld t6, 240(sp)

    addi sp, sp, 256
    sret
"#
);
