//! Kernel error types.
//!
//! Structured errors replace bare integer returns inside the kernel; the
//! syscall boundary converts them to the negative errno values of the ABI
//! via [`KernelError::errno`].

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Page, slab or swap-slot allocation failed.
    OutOfMemory,
    /// The process table has no free slot.
    ProcessTableFull,
    /// A user virtual address could not be translated.
    UnmappedMemory { addr: usize },
    /// A user pointer or range failed validation.
    InvalidAddress { addr: usize },
    /// Generic bad argument (alignment, empty permissions, bad range).
    InvalidArgument { name: &'static str },
    /// A requested mapping overlaps an existing VMA.
    Overlap { start: usize, end: usize },
    /// `exec` of a name that is not in the application table.
    NotFound { name: &'static str },
    /// `wait` with no children to reap.
    NoChildren,
    /// The process was killed while blocked.
    Killed,
    /// A malformed ELF image.
    BadElf { reason: &'static str },
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Errno values surfaced to userspace as negative returns.
pub mod errno {
    pub const ENOENT: i64 = 2;
    pub const ECHILD: i64 = 10;
    pub const ENOMEM: i64 = 12;
    pub const EINVAL: i64 = 22;
}

impl KernelError {
    /// The negative integer this error presents as at the syscall boundary.
    pub fn errno(self) -> i64 {
        match self {
            KernelError::OutOfMemory | KernelError::ProcessTableFull => -errno::ENOMEM,
            KernelError::UnmappedMemory { .. }
            | KernelError::InvalidAddress { .. }
            | KernelError::InvalidArgument { .. }
            | KernelError::Overlap { .. } => -errno::EINVAL,
            KernelError::NotFound { .. } | KernelError::BadElf { .. } => -errno::ENOENT,
            KernelError::NoChildren => -errno::ECHILD,
            // Killed surfaces as a bare -1 so `sleep` and `wait` report a
            // killed process the way userspace expects.
            KernelError::Killed => -1,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::ProcessTableFull => write!(f, "process table full"),
            KernelError::UnmappedMemory { addr } => write!(f, "unmapped address {addr:#x}"),
            KernelError::InvalidAddress { addr } => write!(f, "invalid address {addr:#x}"),
            KernelError::InvalidArgument { name } => write!(f, "invalid argument: {name}"),
            KernelError::Overlap { start, end } => {
                write!(f, "overlapping range [{start:#x}, {end:#x})")
            }
            KernelError::NotFound { name } => write!(f, "no such application: {name}"),
            KernelError::NoChildren => write!(f, "no children"),
            KernelError::Killed => write!(f, "killed"),
            KernelError::BadElf { reason } => write!(f, "bad elf: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(KernelError::OutOfMemory.errno(), -12);
        assert_eq!(KernelError::InvalidArgument { name: "len" }.errno(), -22);
        assert_eq!(KernelError::NotFound { name: "x" }.errno(), -2);
        assert_eq!(KernelError::NoChildren.errno(), -10);
        assert_eq!(KernelError::Killed.errno(), -1);
    }
}
