//! 8250-compatible UART.
//!
//! OpenSBI has already configured the line; the kernel only clears and
//! enables the FIFOs and turns on receive interrupts. On the VisionFive 2
//! the register offsets are shifted left by two and accessed as 32-bit
//! words; on QEMU they are byte registers.

use bitflags::bitflags;

use crate::arch::Board;

/// Receive holding register (read) / transmit holding register (write).
pub const RHR: usize = 0;
pub const THR: usize = 0;
/// Interrupt enable register.
pub const IER: usize = 1;
/// FIFO control register (write).
pub const FCR: usize = 2;
/// Line status register.
pub const LSR: usize = 5;

bitflags! {
    pub struct LsrFlags: u32 {
        /// Input byte waiting in RHR.
        const DATA_READY = 1 << 0;
        /// THR can accept another byte.
        const TX_IDLE = 1 << 5;
    }
}

pub const IER_RX_ENABLE: u32 = 1 << 0;
pub const FCR_FIFO_ENABLE: u32 = 1 << 0;
pub const FCR_FIFO_CLEAR: u32 = 3 << 1;

/// Byte offset of a register on the given board.
pub const fn reg_offset(reg: usize, board: Board) -> usize {
    match board {
        Board::QemuVirt => reg,
        Board::VisionFive2 => reg << 2,
    }
}

#[cfg(target_arch = "riscv64")]
mod mmio {
    use super::*;
    use crate::arch;
    use crate::cpu;
    use crate::memlayout::UART0_PHYS;

    fn read_reg(reg: usize) -> u32 {
        let board = arch::board();
        let addr = UART0_PHYS + reg_offset(reg, board);
        // SAFETY: addr lies inside the identity-mapped UART MMIO page;
        // volatile access is required for device registers.
        unsafe {
            match board {
                Board::QemuVirt => core::ptr::read_volatile(addr as *const u8) as u32,
                Board::VisionFive2 => core::ptr::read_volatile(addr as *const u32),
            }
        }
    }

    fn write_reg(reg: usize, val: u32) {
        let board = arch::board();
        let addr = UART0_PHYS + reg_offset(reg, board);
        // SAFETY: as in read_reg.
        unsafe {
            match board {
                Board::QemuVirt => core::ptr::write_volatile(addr as *mut u8, val as u8),
                Board::VisionFive2 => core::ptr::write_volatile(addr as *mut u32, val),
            }
        }
    }

    /// Reset the FIFOs and enable receive interrupts. Boot hart only.
    pub fn init() {
        write_reg(IER, 0x00);
        write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
        write_reg(IER, IER_RX_ENABLE);
    }

    /// Blocking transmit of one byte, interrupts masked locally for the
    /// duration of the spin.
    pub fn putc_sync(byte: u8) {
        cpu::push_off();
        while read_reg(LSR) & LsrFlags::TX_IDLE.bits() == 0 {
            core::hint::spin_loop();
        }
        write_reg(THR, byte as u32);
        cpu::pop_off();
    }

    fn getc() -> Option<u8> {
        if read_reg(LSR) & LsrFlags::DATA_READY.bits() != 0 {
            Some(read_reg(RHR) as u8)
        } else {
            None
        }
    }

    /// Drain the receive FIFO into the console line discipline.
    pub fn handle_irq() {
        while let Some(byte) = getc() {
            crate::drivers::console::intr(byte);
        }
    }
}

#[cfg(target_arch = "riscv64")]
pub use mmio::{handle_irq, init, putc_sync};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_shift_per_board() {
        assert_eq!(reg_offset(LSR, Board::QemuVirt), 5);
        assert_eq!(reg_offset(LSR, Board::VisionFive2), 20);
        assert_eq!(reg_offset(THR, Board::VisionFive2), 0);
    }
}
