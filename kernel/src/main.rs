//! Boot.
//!
//! Hart 0 arrives from OpenSBI in `_entry`, relocates onto its per-cpu
//! stack and runs the platform-level init: console, PLIC, page
//! allocator, kernel page table, pools, process table, timer, then the
//! init program. Secondary harts are started through the HSM extension
//! one at a time, park on the fenced `HALT_SPECIFIC_INIT` flag, perform
//! hart-local init only and enter the scheduler.

#![cfg_attr(target_arch = "riscv64", no_std, no_main)]

#[cfg(target_arch = "riscv64")]
mod boot {
    use core::arch::{asm, global_asm};
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use oxbow_kernel::arch::riscv::{sbi, trampoline};
    use oxbow_kernel::arch::{self, Board};
    use oxbow_kernel::memlayout::{PAGE_SIZE, PHYS_MEM_END, PHYS_MEM_SIZE, SWAP_SLOTS};
    use oxbow_kernel::mm::{self, kvm, page_alloc, vas, PhysAddr};
    use oxbow_kernel::{cpu, loader, print, println, process, sched, syscall, timer, trap};

    global_asm!(
        r#"
    .section .text.entry
    .globl _entry
# OpenSBI enters here on the boot hart: a0 = hartid, a1 = dtb.
_entry:
    la sp, boot_stack_top
    call bootcpu_entry
1:
    j 1b

    .globl _entry_secondary
    .align 2
# HSM hart_start target: a0 = hartid, a1 = logical cpu id.
_entry_secondary:
    la sp, boot_stack_top
    call secondary_entry
1:
    j 1b

    .section .bss.stack
    .align 12
    .globl boot_stack
boot_stack:
    .space 4096 * 4
    .globl boot_stack_top
boot_stack_top:
"#
    );

    extern "C" {
        static sbss: u8;
        static ebss: u8;
        static ekernel: u8;
        fn _entry_secondary();
    }

    const PERCPU_STACK_SIZE: usize = 4 * PAGE_SIZE;

    #[repr(C, align(4096))]
    struct PerCpuStacks(UnsafeCell<[[u8; PERCPU_STACK_SIZE]; cpu::NCPU]>);

    // SAFETY: each hart runs on its own slice of the array; the slices
    // never alias.
    unsafe impl Sync for PerCpuStacks {}

    static PERCPU_STACKS: PerCpuStacks =
        PerCpuStacks(UnsafeCell::new([[0; PERCPU_STACK_SIZE]; cpu::NCPU]));

    fn percpu_stack_top(cpuid: usize) -> usize {
        PERCPU_STACKS.0.get() as usize + (cpuid + 1) * PERCPU_STACK_SIZE
    }

    static BOOTED_COUNT: AtomicUsize = AtomicUsize::new(0);
    static HALT_SPECIFIC_INIT: AtomicBool = AtomicBool::new(false);

    // ----------------------------------------------------------------
    // Early boot page table
    // ----------------------------------------------------------------
    //
    // The fine-grained kernel table is built by `kvm`, but building it
    // already needs the direct map (the page allocator threads its
    // freelist through page contents). Bridge the gap with a static
    // gigapage table: identity for the low 4 GiB (kernel image + MMIO,
    // RWX) and the same 4 GiB again at the direct-map base (RW).

    const GIGAPAGE: usize = 1 << 30;
    const PTE_V: u64 = 1 << 0;
    const PTE_RWX: u64 = 0b1110;
    const PTE_RW: u64 = 0b0110;
    const PTE_AD: u64 = 0b1100_0000;

    #[repr(C, align(4096))]
    struct BootPageTable([u64; 512]);

    const fn gigapage_pte(pa: usize, flags: u64) -> u64 {
        (((pa >> 12) as u64) << 10) | flags | PTE_V | PTE_AD
    }

    const fn boot_page_table() -> BootPageTable {
        let mut entries = [0u64; 512];
        let direct_map_slot =
            (oxbow_kernel::memlayout::DIRECT_MAP_BASE >> 30) & 0x1ff;
        let mut k = 0;
        while k < 4 {
            entries[k] = gigapage_pte(k * GIGAPAGE, PTE_RWX);
            entries[direct_map_slot + k] = gigapage_pte(k * GIGAPAGE, PTE_RW);
            k += 1;
        }
        BootPageTable(entries)
    }

    static BOOT_PAGE_TABLE: BootPageTable = boot_page_table();

    /// Turn on paging with the early table. The kernel executes from the
    /// identity window, so the switch is transparent.
    fn enable_boot_page_table() {
        use oxbow_kernel::arch::riscv;
        let root = core::ptr::addr_of!(BOOT_PAGE_TABLE) as usize;
        arch::sfence_vma();
        riscv::w_satp(riscv::make_satp(root));
        arch::sfence_vma();
    }

    fn clear_bss() {
        // SAFETY: [sbss, ebss) is the kernel's own zero-init region; the
        // boot stack lives outside it by linker-script construction.
        unsafe {
            let start = core::ptr::addr_of!(sbss) as usize;
            let end = core::ptr::addr_of!(ebss) as usize;
            core::ptr::write_bytes(start as *mut u8, 0, end - start);
        }
    }

    #[no_mangle]
    extern "C" fn bootcpu_entry(hartid: usize, _dtb: usize) -> ! {
        clear_bss();

        // SiFive U74 behind s-mode U-Boot: the real hartid was parked in
        // tp, and the UART/PLIC personalities differ.
        let mut mhartid = hartid;
        if sbi::get_mvendorid() == 0x489 && sbi::get_mimpid() == 0x4210427 {
            mhartid = arch::cpu_id();
            arch::set_board(Board::VisionFive2);
        } else {
            arch::set_board(Board::QemuVirt);
        }

        // The boot hart is always logical cpu 0.
        arch::set_cpu_id(0);
        // SAFETY: interrupts are off this early; no other accessor exists.
        unsafe { cpu::mycpu() }.hartid = mhartid;

        enable_boot_page_table();

        let target = bootcpu_init as usize;
        let sp = percpu_stack_top(0);
        // SAFETY: jumping to a diverging Rust function with a fresh,
        // owned stack.
        unsafe {
            asm!("mv sp, {sp}", "jr {target}",
                sp = in(reg) sp, target = in(reg) target, options(noreturn));
        }
    }

    #[no_mangle]
    extern "C" fn secondary_entry(hartid: usize, cpuid: usize) -> ! {
        arch::set_cpu_id(cpuid);
        // SAFETY: this hart's slot; interrupts are off.
        unsafe { cpu::mycpu() }.hartid = hartid;

        let target = secondary_init as usize;
        let sp = percpu_stack_top(cpuid);
        // SAFETY: as in bootcpu_entry.
        unsafe {
            asm!("mv sp, {sp}", "jr {target}",
                sp = in(reg) sp, target = in(reg) target, options(noreturn));
        }
    }

    /// Bring the other harts up through HSM, one at a time (they share
    /// the boot stack until each relocates).
    fn start_secondary_harts() {
        // SAFETY: interrupts are off during boot.
        let my_hart = unsafe { cpu::mycpu() }.hartid;
        let on_vf2 = arch::board() == Board::VisionFive2;

        let mut cpuid = 1;
        let max_hartid = if on_vf2 { cpu::NCPU + 1 } else { cpu::NCPU };
        for hartid in 0..max_hartid {
            if hartid == my_hart {
                continue;
            }
            // Hart 0 of the JH7110 is the S7 monitor core, not a U74.
            if on_vf2 && hartid == 0 {
                continue;
            }
            if cpuid >= cpu::NCPU {
                break;
            }

            let booted = BOOTED_COUNT.load(Ordering::Acquire);
            let ret = sbi::hart_start(hartid, _entry_secondary as usize, cpuid);
            if !ret.is_ok() {
                println!("hart {hartid}: hart_start failed ({})", ret.error);
                continue;
            }
            while BOOTED_COUNT.load(Ordering::Acquire) == booted {
                core::hint::spin_loop();
            }
            cpuid += 1;
        }
        println!("{cpuid} cpus online");
    }

    #[no_mangle]
    extern "C" fn bootcpu_init() -> ! {
        print::init_logging();
        trap::init_hart();
        oxbow_kernel::drivers::console::init();

        println!();
        println!("oxbow kernel booting, hart {}", arch::cpu_id());

        start_secondary_harts();

        oxbow_kernel::arch::riscv::plic::init();

        // SAFETY: ekernel is a linker symbol; only its address is taken.
        let kernel_end = unsafe { core::ptr::addr_of!(ekernel) as usize };
        let alloc_base = oxbow_kernel::memlayout::page_round_up(kernel_end);
        page_alloc::init(alloc_base, PHYS_MEM_END - alloc_base);

        let trampoline_pa = PhysAddr::new(trampoline::trampoline as usize);
        vas::set_trampoline(trampoline_pa);
        kvm::init(PHYS_MEM_SIZE + SWAP_SLOTS * PAGE_SIZE, trampoline_pa);
        kvm::init_hart();

        mm::init();
        process::table::init();
        syscall::init();
        loader::init();

        timer::init_hart();
        // SAFETY: boot path, interrupts off.
        let my_hart = unsafe { cpu::mycpu() }.hartid;
        oxbow_kernel::arch::riscv::plic::init_hart(my_hart);

        loader::load_init_app().expect("failed to load init");

        arch::memory_fence();
        HALT_SPECIFIC_INIT.store(true, Ordering::Release);
        arch::memory_fence();

        log::info!("hart {}: entering scheduler", arch::cpu_id());
        sched::scheduler()
    }

    #[no_mangle]
    extern "C" fn secondary_init() -> ! {
        BOOTED_COUNT.fetch_add(1, Ordering::Release);
        while !HALT_SPECIFIC_INIT.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        arch::memory_fence();

        trap::init_hart();
        kvm::init_hart();
        timer::init_hart();
        // SAFETY: boot path, interrupts off.
        let my_hart = unsafe { cpu::mycpu() }.hartid;
        oxbow_kernel::arch::riscv::plic::init_hart(my_hart);

        log::info!("hart {}: entering scheduler", arch::cpu_id());
        sched::scheduler()
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        use oxbow_kernel::arch::riscv;

        arch::intr_off();
        print::panic_begin();
        if print::claim_panic() {
            println!();
            println!("!! kernel panic on hart {}: {}", arch::cpu_id(), info);
            println!(
                "   sepc {:#x} scause {:#x} stval {:#x} satp {:#x}",
                riscv::r_sepc(),
                riscv::r_scause(),
                riscv::r_stval(),
                riscv::r_satp()
            );
        }
        // Either we printed the dump, or another hart owns it; park.
        loop {
            arch::wait_for_interrupt();
        }
    }
}

/// The kernel binary has no host-side behaviour; this target exists so
/// `cargo test`/`check` on the host can cover the workspace.
#[cfg(not(target_arch = "riscv64"))]
fn main() {}
