//! Console printing, the kernel logger and panic coordination.
//!
//! Two test-and-set flags arbitrate the UART: the kernel-print flag makes
//! printers (and user console writes) mutually exclusive, and the panic
//! flag gives the first panicking hart absolute priority — once it is
//! set, printers stop taking the flag and all bytes go out over the
//! firmware console path.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

static PANICKED: AtomicBool = AtomicBool::new(false);
static PANIC_CLAIMED: AtomicBool = AtomicBool::new(false);
static KPRINT_BUSY: AtomicBool = AtomicBool::new(false);

/// Has any hart panicked?
pub fn panicked() -> bool {
    PANICKED.load(Ordering::Acquire)
}

/// Flag the system as panicked. Every console byte from here on takes
/// the firmware path.
pub fn panic_begin() {
    PANICKED.store(true, Ordering::Release);
}

/// True for exactly one caller: the hart that gets to print the dump.
/// Everyone else parks.
pub fn claim_panic() -> bool {
    PANIC_CLAIMED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// Guard for the kernel-print priority flag.
pub struct KprintGuard {
    active: bool,
}

/// Take the print flag, unless a panic is in progress — panic output must
/// not wait on ordinary printers. Interrupts stay masked for the hold so
/// an interrupt handler that prints cannot deadlock against a printer it
/// interrupted on the same hart.
pub fn acquire_kprint() -> KprintGuard {
    crate::cpu::push_off();
    loop {
        if panicked() {
            return KprintGuard { active: false };
        }
        if KPRINT_BUSY
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return KprintGuard { active: true };
        }
        core::hint::spin_loop();
    }
}

impl Drop for KprintGuard {
    fn drop(&mut self) {
        if self.active {
            KPRINT_BUSY.store(false, Ordering::Release);
        }
        crate::cpu::pop_off();
    }
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            crate::drivers::console::putc(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _guard = acquire_kprint();
    let _ = ConsoleWriter.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

// ---------------------------------------------------------------------------
// log backend
// ---------------------------------------------------------------------------

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!("[{:>5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Route the `log` macros to the console. Boot hart only.
pub fn init_logging() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(if cfg!(feature = "verbose") {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    });
}
