//! Console I/O system calls. The fd argument is accepted for ABI shape
//! but everything is the console.

use crate::drivers::console;

pub fn sys_read(_fd: usize, buf_va: usize, len: usize) -> i64 {
    match console::user_console_read(buf_va, len) {
        Ok(n) => n as i64,
        Err(e) => e.errno(),
    }
}

pub fn sys_write(_fd: usize, buf_va: usize, len: usize) -> i64 {
    match console::user_console_write(buf_va, len) {
        Ok(n) => n as i64,
        Err(e) => e.errno(),
    }
}
