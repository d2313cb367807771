//! System call dispatch.
//!
//! A closed, numbered table. Arguments arrive in `a0..a5` of the saved
//! trapframe, the number in `a7`; the single return value is written back
//! to `a0`. Errors surface as negative errno values.

pub mod io;
pub mod memory;
pub mod process;

use crate::process::Process;

/// System call numbers.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 1,
    Exec = 2,
    Exit = 3,
    Wait = 4,
    GetPid = 5,
    GetPPid = 6,
    Kill = 7,

    Sleep = 10,
    Yield = 11,

    Sbrk = 20,

    Read = 22,
    Write = 23,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exec),
            3 => Ok(Syscall::Exit),
            4 => Ok(Syscall::Wait),
            5 => Ok(Syscall::GetPid),
            6 => Ok(Syscall::GetPPid),
            7 => Ok(Syscall::Kill),
            10 => Ok(Syscall::Sleep),
            11 => Ok(Syscall::Yield),
            20 => Ok(Syscall::Sbrk),
            22 => Ok(Syscall::Read),
            23 => Ok(Syscall::Write),
            _ => Err(()),
        }
    }
}

/// Initialize syscall-layer resources (the exec string pool).
pub fn init() {
    process::init_kstr_pool();
}

/// Decode and run the system call pending in `p`'s trapframe.
pub fn dispatch(p: &'static Process) {
    let (number, args) = {
        // SAFETY: only the owning kernel thread touches the trapframe
        // while the process is in a syscall.
        let tf = unsafe { p.trapframe() };
        (tf.a7, tf.syscall_args())
    };

    let ret: i64 = match Syscall::try_from(number) {
        Ok(syscall) => handle(syscall, args),
        Err(()) => {
            log::error!("unknown syscall {number} from pid {}", p.pid());
            -1
        }
    };

    // Handlers may have rewritten the trapframe (exec); fetch it again.
    // SAFETY: as above.
    unsafe { p.trapframe() }.a0 = ret as usize;
}

fn handle(syscall: Syscall, args: [usize; 6]) -> i64 {
    match syscall {
        Syscall::Fork => process::sys_fork(),
        Syscall::Exec => process::sys_exec(args[0], args[1]),
        Syscall::Exit => process::sys_exit(args[0] as i32),
        Syscall::Wait => process::sys_wait(args[0] as i32, args[1]),
        Syscall::GetPid => process::sys_getpid(),
        Syscall::GetPPid => process::sys_getppid(),
        Syscall::Kill => process::sys_kill(args[0] as i32),
        Syscall::Sleep => process::sys_sleep(args[0] as u64),
        Syscall::Yield => process::sys_yield(),
        Syscall::Sbrk => memory::sys_sbrk(args[0] as i64),
        Syscall::Read => io::sys_read(args[0], args[1], args[2]),
        Syscall::Write => io::sys_write(args[0], args[1], args[2]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_decode() {
        assert_eq!(Syscall::try_from(1), Ok(Syscall::Fork));
        assert_eq!(Syscall::try_from(11), Ok(Syscall::Yield));
        assert_eq!(Syscall::try_from(20), Ok(Syscall::Sbrk));
        assert_eq!(Syscall::try_from(23), Ok(Syscall::Write));
        assert!(Syscall::try_from(0).is_err());
        assert!(Syscall::try_from(21).is_err());
        assert!(Syscall::try_from(99).is_err());
    }
}
