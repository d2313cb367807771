//! Process-lifecycle system calls.

use core::ptr::NonNull;

use crate::error::KernelError;
use crate::loader;
use crate::mm::slab::ObjectPool;
use crate::mm::uaccess;
use crate::process::{self, fork, my_proc, table, KSTRING_MAX, MAX_ARG};
use crate::{sched, timer};

/// Bounce buffer for exec paths and argv strings.
struct KStr([u8; KSTRING_MAX]);

static KSTR_POOL: ObjectPool<KStr> = ObjectPool::new("kstr");

pub(super) fn init_kstr_pool() {
    KSTR_POOL.init(MAX_ARG * 4);
}

pub fn sys_fork() -> i64 {
    match fork::fork() {
        Ok(pid) => pid as i64,
        Err(e) => e.errno(),
    }
}

/// Copy the path and argv strings out of user space, then hand over to
/// the loader. The caller's map survives any failure.
pub fn sys_exec(path_va: usize, argv_va: usize) -> i64 {
    let p = my_proc();
    let mm = p.mm();

    let mut bufs: [Option<NonNull<KStr>>; MAX_ARG] = [None; MAX_ARG];
    let mut lens = [0usize; MAX_ARG];
    let mut argc = 0;

    let path = match KSTR_POOL.alloc() {
        Some(b) => b,
        None => return KernelError::OutOfMemory.errno(),
    };
    let mut path_len = 0;

    let copied = {
        // SAFETY: the map outlives its owning process.
        let mm_ref = unsafe { mm.as_ref() };
        let mut mi = mm_ref.inner.lock();

        // SAFETY: path is an exclusive pool slot.
        let path_buf = unsafe { &mut (*path.as_ptr()).0 };
        let result = uaccess::copy_str_from_user(&mut mi, path_buf, path_va).map(|n| {
            path_len = n;
        });

        result.and_then(|()| {
            while argc < MAX_ARG {
                let mut ptr_bytes = [0u8; 8];
                uaccess::copy_from_user(&mut mi, &mut ptr_bytes, argv_va + argc * 8)?;
                let arg_va = usize::from_le_bytes(ptr_bytes);
                if arg_va == 0 {
                    break;
                }
                let buf = KSTR_POOL
                    .alloc()
                    .ok_or(KernelError::OutOfMemory)?;
                bufs[argc] = Some(buf);
                // SAFETY: buf is an exclusive pool slot.
                let bytes = unsafe { &mut (*buf.as_ptr()).0 };
                lens[argc] = uaccess::copy_str_from_user(&mut mi, bytes, arg_va)?;
                argc += 1;
            }
            Ok(())
        })
    };

    let ret = match copied {
        Err(e) => e.errno(),
        Ok(()) => {
            // SAFETY: path is still our exclusive slot.
            let path_bytes = unsafe { &path.as_ref().0[..path_len] };
            let name = core::str::from_utf8(path_bytes).unwrap_or("");
            match loader::find_app(name) {
                None => KernelError::NotFound { name: "exec" }.errno(),
                Some(app) => {
                    let mut args: [&[u8]; MAX_ARG] = [&[]; MAX_ARG];
                    for (i, buf) in bufs.iter().take(argc).enumerate() {
                        if let Some(b) = buf {
                            // SAFETY: each buffer is an exclusive pool slot.
                            args[i] = unsafe { &(&(*b.as_ptr()).0)[..lens[i]] };
                        }
                    }
                    match loader::exec(p, app, &args[..argc]) {
                        Ok(new_argc) => new_argc as i64,
                        Err(e) => e.errno(),
                    }
                }
            }
        }
    };

    KSTR_POOL.free(path);
    for buf in bufs.iter().flatten() {
        KSTR_POOL.free(*buf);
    }
    ret
}

pub fn sys_exit(code: i32) -> i64 {
    process::exit(code)
}

pub fn sys_wait(pid: i32, status_va: usize) -> i64 {
    match process::wait(pid) {
        Ok((child_pid, code)) => {
            if status_va != 0 {
                let p = my_proc();
                let mm = p.mm();
                // SAFETY: the map outlives its owning process.
                let mm_ref = unsafe { mm.as_ref() };
                let mut mi = mm_ref.inner.lock();
                if uaccess::copy_to_user(&mut mi, status_va, &code.to_le_bytes()).is_err() {
                    return KernelError::InvalidAddress { addr: status_va }.errno();
                }
            }
            child_pid as i64
        }
        Err(e) => e.errno(),
    }
}

pub fn sys_getpid() -> i64 {
    my_proc().pid() as i64
}

/// Parent pid, or 0 for a parentless process.
pub fn sys_getppid() -> i64 {
    let parent = { my_proc().inner.lock().parent };
    match parent {
        Some(idx) => table::proc(idx).pid() as i64,
        None => 0,
    }
}

pub fn sys_kill(pid: i32) -> i64 {
    match process::kill(pid) {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

/// Sleep for `n` ticks on the global tick channel; −1 if killed first.
pub fn sys_sleep(n: u64) -> i64 {
    match timer::sleep_ticks(n) {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

pub fn sys_yield() -> i64 {
    sched::yield_now();
    0
}
