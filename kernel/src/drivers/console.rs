//! Console: line-edited input, arbitrated output.
//!
//! Input is interrupt-driven into a 128-byte ring with three indices:
//! `r` (read), `w` (committed line boundary) and `e` (edit, possibly
//! ahead of `w`). Ctrl-U kills the current line, 0x7F erases one cell,
//! Ctrl-D commits and signals EOF, newline commits, Ctrl-P and Ctrl-Q
//! dump process and memory diagnostics. Readers sleep until a commit.
//!
//! Output goes byte-at-a-time through the UART with the transmit lock
//! held; user writes additionally take the kernel-print priority lock so
//! they never interleave with panic output.

use crate::error::{KernelError, KernelResult};
use crate::memlayout::PAGE_SIZE;
use crate::mm::{page_alloc, uaccess};
use crate::process;
use crate::sync::SpinLock;

pub const INPUT_BUF_SIZE: usize = 128;

const fn ctrl(c: u8) -> u8 {
    c - b'@'
}

const CTRL_D: u8 = ctrl(b'D');
const CTRL_P: u8 = ctrl(b'P');
const CTRL_Q: u8 = ctrl(b'Q');
const CTRL_U: u8 = ctrl(b'U');
const DEL: u8 = 0x7f;

/// What the discipline wants echoed for one input byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOp {
    Char(u8),
    /// Blank one cell (backspace, space, backspace).
    Rubout,
}

/// Side effect of feeding one byte to the discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    None,
    /// A full line (or EOF) was committed; wake readers.
    LineReady,
    /// Ctrl-P: dump the process table.
    ProcDump,
    /// Ctrl-Q: dump allocator state.
    MemDump,
}

/// The ring and its edit logic, free of device and process concerns so
/// the editing semantics stand alone.
pub struct LineDiscipline {
    buf: [u8; INPUT_BUF_SIZE],
    /// Read index (consumer).
    r: usize,
    /// Committed write index: bytes in `[r, w)` are readable.
    w: usize,
    /// Edit index: bytes in `[w, e)` are still editable.
    e: usize,
}

impl LineDiscipline {
    pub const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF_SIZE],
            r: 0,
            w: 0,
            e: 0,
        }
    }

    /// Feed one input byte; `echo` receives whatever should be printed
    /// back at the terminal.
    pub fn handle_input(&mut self, c: u8, echo: &mut dyn FnMut(EchoOp)) -> InputAction {
        match c {
            CTRL_P => InputAction::ProcDump,
            CTRL_Q => InputAction::MemDump,
            CTRL_U => {
                while self.e != self.w && self.buf[(self.e - 1) % INPUT_BUF_SIZE] != b'\n' {
                    self.e -= 1;
                    echo(EchoOp::Rubout);
                }
                InputAction::None
            }
            DEL => {
                if self.e != self.w {
                    self.e -= 1;
                    echo(EchoOp::Rubout);
                }
                InputAction::None
            }
            _ => {
                if c == 0 || self.e - self.r >= INPUT_BUF_SIZE {
                    return InputAction::None;
                }
                let c = if c == b'\r' { b'\n' } else { c };
                echo(EchoOp::Char(c));
                self.buf[self.e % INPUT_BUF_SIZE] = c;
                self.e += 1;
                if c == b'\n' || c == CTRL_D || self.e - self.r == INPUT_BUF_SIZE {
                    self.w = self.e;
                    InputAction::LineReady
                } else {
                    InputAction::None
                }
            }
        }
    }

    /// Next committed byte, if any.
    pub fn pop(&mut self) -> Option<u8> {
        if self.r == self.w {
            return None;
        }
        let c = self.buf[self.r % INPUT_BUF_SIZE];
        self.r += 1;
        Some(c)
    }

    /// Put the last popped byte back (Ctrl-D is preserved so the next
    /// read returns zero bytes).
    pub fn unpop(&mut self) {
        self.r -= 1;
    }

    pub fn has_committed(&self) -> bool {
        self.r != self.w
    }

    /// Committed write index; test hook for commit accounting.
    pub fn committed_index(&self) -> usize {
        self.w
    }
}

static CONS: SpinLock<LineDiscipline> = SpinLock::new("cons", LineDiscipline::new());

/// Output arbitration between concurrent writers.
static TX_LOCK: SpinLock<()> = SpinLock::new("uart_tx", ());

fn cons_chan() -> usize {
    &CONS as *const _ as usize
}

/// Low-level console byte output. After a panic all output takes the
/// firmware path, bypassing the interrupt-driven UART entirely.
#[cfg(target_arch = "riscv64")]
pub fn putc(c: u8) {
    use crate::drivers::uart;

    if crate::print::panicked() {
        crate::arch::riscv::sbi::console_putchar(c);
        return;
    }
    match c {
        b'\n' => {
            uart::putc_sync(b'\r');
            uart::putc_sync(b'\n');
        }
        0x08 => {
            uart::putc_sync(0x08);
            uart::putc_sync(b' ');
            uart::putc_sync(0x08);
        }
        _ => uart::putc_sync(c),
    }
}

/// Host builds have no console; output is dropped.
#[cfg(not(target_arch = "riscv64"))]
pub fn putc(_c: u8) {}

fn echo(op: EchoOp) {
    match op {
        EchoOp::Char(c) => putc(c),
        EchoOp::Rubout => putc(0x08),
    }
}

/// Receive-interrupt entry: feed one byte through the discipline.
pub fn intr(c: u8) {
    let mut cons = CONS.lock();
    match cons.handle_input(c, &mut echo) {
        InputAction::LineReady => process::wakeup(cons_chan()),
        InputAction::ProcDump => process::table::dump(),
        InputAction::MemDump => crate::mm::dump(),
        InputAction::None => {}
    }
}

/// Boot-hart console bring-up.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    crate::drivers::uart::init();
    log::info!("console: uart irq enabled");
}

/// The write syscall: copy at most one page from user space, then emit it
/// under the transmit lock and the kernel-print priority lock.
pub fn user_console_write(user_buf: usize, len: usize) -> KernelResult<usize> {
    if len == 0 {
        return Err(KernelError::InvalidArgument { name: "len" });
    }
    let len = len.min(PAGE_SIZE);

    let bounce = page_alloc::alloc_page().ok_or(KernelError::OutOfMemory)?;
    // SAFETY: the bounce page is exclusively ours for PAGE_SIZE bytes.
    let kbuf = unsafe { core::slice::from_raw_parts_mut(bounce.kva() as *mut u8, PAGE_SIZE) };

    let p = process::my_proc();
    let mm = p.mm();
    // SAFETY: the map outlives its owning process.
    let mm_ref = unsafe { mm.as_ref() };
    let copied = {
        let mut mi = mm_ref.inner.lock();
        uaccess::copy_from_user(&mut mi, &mut kbuf[..len], user_buf)
    };
    if let Err(e) = copied {
        page_alloc::free_page(bounce);
        return Err(e);
    }

    {
        let _kprint = crate::print::acquire_kprint();
        let _tx = TX_LOCK.lock();
        for &b in &kbuf[..len] {
            putc(b);
        }
    }

    page_alloc::free_page(bounce);
    Ok(len)
}

/// The read syscall: sleep until a committed line exists, then hand bytes
/// up one at a time, stopping at newline or EOF. A Ctrl-D that ends a
/// non-empty read stays buffered so the next read returns zero bytes.
pub fn user_console_read(user_buf: usize, len: usize) -> KernelResult<usize> {
    let p = process::my_proc();
    let mut read = 0;

    let mut cons = CONS.lock();
    while read < len {
        while !cons.has_committed() {
            if p.killed() {
                return Err(KernelError::Killed);
            }
            cons = process::sleep(cons_chan(), cons);
        }

        let c = cons.pop().expect("committed byte vanished");

        if c == CTRL_D {
            if read > 0 {
                cons.unpop();
            }
            break;
        }

        let mm = p.mm();
        // SAFETY: the map outlives its owning process.
        let mm_ref = unsafe { mm.as_ref() };
        let stored = {
            let mut mi = mm_ref.inner.lock();
            uaccess::copy_to_user(&mut mi, user_buf + read, &[c])
        };
        if stored.is_err() {
            break;
        }
        read += 1;

        if c == b'\n' {
            break;
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn feed(ld: &mut LineDiscipline, bytes: &[u8]) -> (Vec<EchoOp>, usize) {
        let mut echoed = Vec::new();
        let mut commits = 0;
        for &b in bytes {
            if ld.handle_input(b, &mut |op| echoed.push(op)) == InputAction::LineReady {
                commits += 1;
            }
        }
        (echoed, commits)
    }

    #[test]
    fn kill_line_then_retype() {
        let mut ld = LineDiscipline::new();
        let w_before = ld.committed_index();

        let (_, commits) = feed(&mut ld, &[b'a', b'b', CTRL_U, b'c', b'd', b'\n']);
        assert_eq!(commits, 1);
        // the reader sees exactly "cd\n"
        assert_eq!(ld.pop(), Some(b'c'));
        assert_eq!(ld.pop(), Some(b'd'));
        assert_eq!(ld.pop(), Some(b'\n'));
        assert_eq!(ld.pop(), None);
        assert_eq!(ld.committed_index(), w_before + 3);
    }

    #[test]
    fn delete_erases_one_cell() {
        let mut ld = LineDiscipline::new();
        let (echoed, _) = feed(&mut ld, &[b'x', b'y', DEL, b'\n']);
        assert_eq!(ld.pop(), Some(b'x'));
        assert_eq!(ld.pop(), Some(b'\n'));
        assert!(echoed.contains(&EchoOp::Rubout));
    }

    #[test]
    fn delete_stops_at_committed_boundary() {
        let mut ld = LineDiscipline::new();
        feed(&mut ld, &[b'a', b'\n']);
        // the committed line cannot be erased
        feed(&mut ld, &[DEL, DEL]);
        assert_eq!(ld.pop(), Some(b'a'));
        assert_eq!(ld.pop(), Some(b'\n'));
    }

    #[test]
    fn carriage_return_becomes_newline() {
        let mut ld = LineDiscipline::new();
        let (_, commits) = feed(&mut ld, &[b'h', b'i', b'\r']);
        assert_eq!(commits, 1);
        assert_eq!(ld.pop(), Some(b'h'));
        assert_eq!(ld.pop(), Some(b'i'));
        assert_eq!(ld.pop(), Some(b'\n'));
    }

    #[test]
    fn ctrl_d_commits_without_translation() {
        let mut ld = LineDiscipline::new();
        let (_, commits) = feed(&mut ld, &[b'q', CTRL_D]);
        assert_eq!(commits, 1);
        assert_eq!(ld.pop(), Some(b'q'));
        assert_eq!(ld.pop(), Some(CTRL_D));
        // a reader that stopped before the Ctrl-D can push it back
        ld.unpop();
        assert_eq!(ld.pop(), Some(CTRL_D));
    }

    #[test]
    fn full_buffer_commits() {
        let mut ld = LineDiscipline::new();
        let bytes: Vec<u8> = (0..INPUT_BUF_SIZE).map(|_| b'z').collect();
        let (_, commits) = feed(&mut ld, &bytes);
        assert_eq!(commits, 1);
        for _ in 0..INPUT_BUF_SIZE {
            assert_eq!(ld.pop(), Some(b'z'));
        }
        assert_eq!(ld.pop(), None);
    }

    #[test]
    fn control_p_q_are_dispatch_only() {
        let mut ld = LineDiscipline::new();
        let mut echoed = Vec::new();
        assert_eq!(
            ld.handle_input(CTRL_P, &mut |op| echoed.push(op)),
            InputAction::ProcDump
        );
        assert_eq!(
            ld.handle_input(CTRL_Q, &mut |op| echoed.push(op)),
            InputAction::MemDump
        );
        assert!(echoed.is_empty());
        assert!(!ld.has_committed());
    }
}
