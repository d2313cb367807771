//! Platform-Level Interrupt Controller driver.
//!
//! One global PLIC per board aggregates external interrupt sources and
//! delivers them to hart contexts by priority.
//!
//! # Register map (base 0x0C00_0000 on both supported boards)
//!
//! | Region             | Offset     | Stride         |
//! |--------------------|------------|----------------|
//! | Priority           | 0x00_0000  | 4 bytes/source |
//! | Enable             | 0x00_2000  | 0x80/context   |
//! | Priority threshold | 0x20_0000  | 0x1000/context |
//! | Claim/complete     | 0x20_0004  | 0x1000/context |
//!
//! # Context mapping
//!
//! On QEMU virt, hart `h` has its S-mode context at `2h + 1`; on the
//! VisionFive 2 the S-mode context is `2h`.

use spin::Once;

use crate::arch::{self, Board};
use crate::memlayout::{PLIC_PHYS, QEMU_UART0_IRQ, VF2_UART0_IRQ};

const PLIC_PRIORITY_OFFSET: usize = 0x00_0000;
const PLIC_ENABLE_OFFSET: usize = 0x00_2000;
const PLIC_ENABLE_STRIDE: usize = 0x80;
const PLIC_THRESHOLD_OFFSET: usize = 0x20_0000;
const PLIC_CLAIM_OFFSET: usize = 0x20_0004;
const PLIC_CONTEXT_STRIDE: usize = 0x1000;

static PLIC: Once<Plic> = Once::new();

struct Plic {
    base: usize,
    board: Board,
}

impl Plic {
    fn new(base: usize, board: Board) -> Self {
        Self { base, board }
    }

    /// S-mode context id for a hart on this board.
    fn s_context(&self, hart: usize) -> usize {
        match self.board {
            Board::QemuVirt => 2 * hart + 1,
            Board::VisionFive2 => 2 * hart,
        }
    }

    #[inline]
    fn priority_addr(&self, irq: u32) -> *mut u32 {
        (self.base + PLIC_PRIORITY_OFFSET + irq as usize * 4) as *mut u32
    }

    #[inline]
    fn enable_addr(&self, irq: u32, context: usize) -> *mut u32 {
        (self.base + PLIC_ENABLE_OFFSET + context * PLIC_ENABLE_STRIDE + (irq as usize / 32) * 4)
            as *mut u32
    }

    #[inline]
    fn threshold_addr(&self, context: usize) -> *mut u32 {
        (self.base + PLIC_THRESHOLD_OFFSET + context * PLIC_CONTEXT_STRIDE) as *mut u32
    }

    #[inline]
    fn claim_complete_addr(&self, context: usize) -> *mut u32 {
        (self.base + PLIC_CLAIM_OFFSET + context * PLIC_CONTEXT_STRIDE) as *mut u32
    }

    fn set_priority(&self, irq: u32, priority: u32) {
        // SAFETY: priority_addr points into the PLIC MMIO region, identity
        // mapped by the kernel page table. write_volatile is required for
        // MMIO.
        unsafe { core::ptr::write_volatile(self.priority_addr(irq), priority) };
    }

    fn enable(&self, irq: u32, context: usize) {
        let addr = self.enable_addr(irq, context);
        // SAFETY: addr points at the context's enable word in PLIC MMIO.
        unsafe {
            let cur = core::ptr::read_volatile(addr);
            core::ptr::write_volatile(addr, cur | (1 << (irq % 32)));
        }
    }

    fn set_threshold(&self, context: usize, threshold: u32) {
        // SAFETY: threshold_addr points into PLIC MMIO.
        unsafe { core::ptr::write_volatile(self.threshold_addr(context), threshold) };
    }

    fn claim(&self, context: usize) -> u32 {
        // SAFETY: reading the claim register atomically claims the highest
        // priority pending interrupt for this context.
        unsafe { core::ptr::read_volatile(self.claim_complete_addr(context)) }
    }

    fn complete(&self, context: usize, irq: u32) {
        // SAFETY: writing the claimed id back signals completion.
        unsafe { core::ptr::write_volatile(self.claim_complete_addr(context), irq) };
    }
}

/// The external interrupt source of the UART on the active board.
pub fn uart_irq() -> u32 {
    match arch::board() {
        Board::QemuVirt => QEMU_UART0_IRQ,
        Board::VisionFive2 => VF2_UART0_IRQ,
    }
}

/// Board-level init: give the UART source a non-zero priority. Boot hart
/// only, before `init_hart`.
pub fn init() {
    let plic = PLIC.call_once(|| Plic::new(PLIC_PHYS, arch::board()));
    plic.set_priority(uart_irq(), 1);
    log::info!("plic: uart irq {} enabled", uart_irq());
}

/// Hart-local init: enable the UART source for this hart's S-mode context
/// and accept all priorities.
pub fn init_hart(hart: usize) {
    let plic = PLIC.get().expect("plic: init_hart before init");
    let ctx = plic.s_context(hart);
    plic.enable(uart_irq(), ctx);
    plic.set_threshold(ctx, 0);
    super::enable_external_interrupt();
}

/// Claim the next pending external interrupt for this hart, if any.
pub fn claim(hart: usize) -> Option<u32> {
    let plic = PLIC.get()?;
    let irq = plic.claim(plic.s_context(hart));
    if irq == 0 {
        None
    } else {
        Some(irq)
    }
}

/// Signal completion of a claimed interrupt.
pub fn complete(hart: usize, irq: u32) {
    if let Some(plic) = PLIC.get() {
        plic.complete(plic.s_context(hart), irq);
    }
}
