//! Runtime entry-point types and resolution of the real `__libc_start_main`.

use crate::config::types::{Result, ShimError};
use std::ffi::{c_char, c_int, c_void, CStr};

/// Program `main(argc, argv, envp)`
pub type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;

/// Init callback handed to `__libc_start_main`; glibc passes `main`'s arguments
pub type InitFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char);

/// Fini and rtld_fini callbacks
pub type FiniFn = unsafe extern "C" fn();

/// `__libc_start_main`
pub type StartMainFn = unsafe extern "C" fn(
    MainFn,
    c_int,
    *mut *mut c_char,
    Option<InitFn>,
    Option<FiniFn>,
    Option<FiniFn>,
    *mut c_void,
) -> c_int;

pub const START_MAIN_SYMBOL: &str = "__libc_start_main";
const START_MAIN_SYMBOL_C: &CStr = c"__libc_start_main";
const LIBC_SONAME: &CStr = c"libc.so.6";

/// Lookup capability for the runtime's real process-entry function.
pub trait EntryResolver {
    fn resolve_start_main(&self) -> Result<StartMainFn>;
}

/// Resolve the next definition after this shim in lookup order, falling back
/// to an explicit `dlopen` of the C library.
pub fn resolve_next_start_main() -> Result<StartMainFn> {
    // SAFETY: RTLD_NEXT lookup of a NUL-terminated symbol name.
    let mut symbol = unsafe { libc::dlsym(libc::RTLD_NEXT, START_MAIN_SYMBOL_C.as_ptr()) };

    if symbol.is_null() {
        // SAFETY: NUL-terminated soname; the handle is intentionally never closed.
        let handle = unsafe { libc::dlopen(LIBC_SONAME.as_ptr(), libc::RTLD_LOCAL | libc::RTLD_LAZY) };
        if !handle.is_null() {
            symbol = unsafe { libc::dlsym(handle, START_MAIN_SYMBOL_C.as_ptr()) };
        }
    }

    if symbol.is_null() {
        return Err(ShimError::ResolveEntry {
            symbol: START_MAIN_SYMBOL,
        });
    }

    // SAFETY: the C library exports __libc_start_main with exactly this signature.
    Ok(unsafe { std::mem::transmute::<*mut c_void, StartMainFn>(symbol) })
}
