//! Process termination primitives.
//!
//! Two ways out: an immediate exit for startup failures, and the plain
//! `exit` system call for controlled termination. `exit_group` is not in the
//! strict-mode allow list, so the latter must use `SYS_exit`.

use std::ffi::c_int;

/// Leave immediately with `code`: no finalizers, no stdio flush.
pub fn exit_immediately(code: i32) -> ! {
    // SAFETY: _exit never returns and touches no process state.
    unsafe { libc::_exit(code as c_int) }
}

/// Terminate through `SYS_exit`, the one exit path strict mode allows.
pub fn terminate(code: i32) -> ! {
    loop {
        // SAFETY: SYS_exit takes a single integer and does not return on
        // success; the loop covers the theoretical failure.
        unsafe {
            libc::syscall(libc::SYS_exit, code as libc::c_long);
        }
    }
}
