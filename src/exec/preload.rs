//! C ABI surface of the preloaded library.
//!
//! Exports the process entry point, the allocator family, the program-break
//! call and the exit family. Everything funnels into one process-wide
//! [`ShimContext`].
//!
//! The loader hands `__libc_start_main` the program's entry points; the
//! real one is called with wrappers in their place. A wrapper is only
//! passed where the loader supplied a callback: a non-null init slot makes
//! modern glibc skip the program's own constructors.

use crate::config::types::{Result, ShimError, StartupStatus};
use crate::exec::lifecycle::{EntryPoints, ShimContext};
use crate::kernel::process::{exit_immediately, terminate};
use crate::kernel::symbols::{FiniFn, InitFn, MainFn};
use crate::kernel::LinuxHost;
use std::ffi::{c_char, c_int, c_void};
use std::ptr::{self, NonNull};

static CONTEXT: ShimContext<LinuxHost> = ShimContext::new(LinuxHost);

fn set_errno(code: c_int) {
    // SAFETY: the calling thread's errno slot is always valid.
    unsafe { *libc::__errno_location() = code };
}

/// Leave without running finalizers. `_exit` is `exit_group`, which
/// restricted mode forbids, so past PreMain this has to be `SYS_exit`.
fn leave(code: c_int) -> ! {
    if CONTEXT.is_restricted() {
        terminate(code)
    }
    exit_immediately(code)
}

/// Startup-fatal errors leave immediately; everything else is `fallback`.
fn fatal(err: &ShimError, fallback: StartupStatus) -> ! {
    let status = err.startup_status().unwrap_or(fallback);
    leave(status.code())
}

/// Map an allocation outcome to the C convention: pointer or null + ENOMEM.
/// A region that cannot be reserved at all is still fatal.
fn into_raw(result: Result<NonNull<u8>>) -> *mut c_void {
    match result {
        Ok(payload) => payload.as_ptr().cast(),
        Err(err) => {
            if let Some(status) = err.startup_status() {
                leave(status.code());
            }
            set_errno(libc::ENOMEM);
            ptr::null_mut()
        }
    }
}

fn controlled_exit(code: c_int) -> ! {
    let _ = CONTEXT.shutdown();
    let _ = CONTEXT.finish();
    terminate(code)
}

fn run_pre_main(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) {
    match CONTEXT.pre_main() {
        // SAFETY: the program's own init, called with main's arguments.
        Ok(Some(init)) => unsafe { init(argc, argv, envp) },
        Ok(None) => {}
        Err(err) => fatal(&err, StartupStatus::RestrictedModeFailed),
    }
}

unsafe extern "C" fn init_wrapper(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) {
    run_pre_main(argc, argv, envp);
}

unsafe extern "C" fn main_wrapper(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    if CONTEXT.pre_main_pending() {
        run_pre_main(argc, argv, envp);
    }
    let main = match CONTEXT.enter_main() {
        Ok(main) => main,
        Err(err) => fatal(&err, StartupStatus::MainReturned),
    };
    // SAFETY: the program's real main with the arguments the loader gave us.
    let code = unsafe { main(argc, argv, envp) };
    controlled_exit(code)
}

unsafe extern "C" fn fini_wrapper() {
    CONTEXT.run_fini();
}

unsafe extern "C" fn rtld_fini_wrapper() {
    CONTEXT.run_rtld_fini();
}

/// # Safety
/// Called by the C runtime's startup code only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: Option<InitFn>,
    fini: Option<FiniFn>,
    rtld_fini: Option<FiniFn>,
    stack_end: *mut c_void,
) -> c_int {
    let entry = EntryPoints {
        main,
        init,
        fini,
        rtld_fini,
    };
    let real_start_main = match CONTEXT.hook(entry) {
        Ok(real) => real,
        Err(err) => fatal(&err, StartupStatus::ResolveFailed),
    };

    let init = init.map(|_| init_wrapper as InitFn);
    let fini = fini.map(|_| fini_wrapper as FiniFn);
    let rtld_fini = rtld_fini.map(|_| rtld_fini_wrapper as FiniFn);
    // SAFETY: resolved from the C library with this exact signature.
    unsafe { real_start_main(main_wrapper, argc, argv, init, fini, rtld_fini, stack_end) }
}

/// # Safety
/// C `malloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    into_raw(CONTEXT.allocate(size))
}

/// # Safety
/// C `free` contract; rejected pointers are reported, not trusted.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let _ = CONTEXT.free(ptr.cast());
}

/// # Safety
/// C `calloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    into_raw(CONTEXT.allocate_zeroed(count, size))
}

/// # Safety
/// C `realloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match CONTEXT.resize(ptr.cast(), size) {
        Ok(Some(payload)) => payload.as_ptr().cast(),
        Ok(None) => ptr::null_mut(),
        Err(err) => into_raw(Err(err)),
    }
}

/// # Safety
/// `memptr` must be valid for a pointer write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, align: usize, size: usize) -> c_int {
    if !align.is_power_of_two() || align % std::mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    match CONTEXT.allocate_aligned(align, size) {
        Ok(payload) => {
            // SAFETY: caller guarantees `memptr` is writable.
            unsafe { *memptr = payload.as_ptr().cast() };
            0
        }
        Err(err) => match err.startup_status() {
            Some(status) => leave(status.code()),
            None => libc::ENOMEM,
        },
    }
}

/// # Safety
/// C11 `aligned_alloc` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    match CONTEXT.allocate_aligned(align, size) {
        Err(ShimError::InvalidAlignment { .. }) => {
            set_errno(libc::EINVAL);
            ptr::null_mut()
        }
        result => into_raw(result),
    }
}

/// # Safety
/// Legacy `memalign` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    unsafe { aligned_alloc(align, size) }
}

/// # Safety
/// `ptr` is null or was returned by this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    CONTEXT.usable_size(ptr.cast()).unwrap_or(0)
}

/// Program break over the private arena. Shrinking is not supported.
///
/// # Safety
/// C `sbrk` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sbrk(increment: libc::intptr_t) -> *mut c_void {
    match CONTEXT.break_by(increment) {
        Ok(previous) => previous.as_ptr().cast(),
        Err(err) => {
            if let Some(status) = err.startup_status() {
                leave(status.code());
            }
            set_errno(libc::ENOMEM);
            usize::MAX as *mut c_void
        }
    }
}

/// Controlled termination: handlers, real finalizers, flush, `SYS_exit`.
///
/// # Safety
/// C `exit` contract.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn exit(code: c_int) -> ! {
    controlled_exit(code)
}

/// # Safety
/// `callback` must stay callable until process exit.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn atexit(callback: Option<unsafe extern "C" fn()>) -> c_int {
    match CONTEXT.register_at_exit(callback) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// # Safety
/// `callback` must stay callable with `arg` until process exit.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __cxa_atexit(
    callback: Option<unsafe extern "C" fn(*mut c_void)>,
    arg: *mut c_void,
    _dso_handle: *mut c_void,
) -> c_int {
    match CONTEXT.register_at_exit_with_arg(callback, arg) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}
