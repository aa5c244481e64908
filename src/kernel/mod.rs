//! Thin wrappers around the kernel and C runtime primitives the shim needs.
//!
//! All `unsafe` FFI is concentrated here with explicit SAFETY comments.
//! Dependency direction: symbols -> stdio -> seccomp -> process

pub mod process;
pub mod seccomp;
pub mod stdio;
pub mod symbols;

use crate::config::types::Result;
use seccomp::RestrictedMode;
use stdio::Console;
use symbols::{EntryResolver, StartMainFn};

/// Every host capability the lifecycle needs.
pub trait Host: EntryResolver + RestrictedMode + Console {}

impl<T: EntryResolver + RestrictedMode + Console> Host for T {}

/// The real process: dynamic loader, C stdio and the seccomp prctl.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl EntryResolver for LinuxHost {
    fn resolve_start_main(&self) -> Result<StartMainFn> {
        symbols::resolve_next_start_main()
    }
}

impl RestrictedMode for LinuxHost {
    fn install_restricted_mode(&self) -> Result<()> {
        seccomp::install_strict_mode()
    }
}

impl Console for LinuxHost {
    fn flush_stdio(&self) {
        stdio::flush_all();
    }

    fn announce(&self, line: &str) {
        stdio::announce(line);
    }

    fn prime_stdin(&self) -> Result<()> {
        stdio::prime_stdin()
    }

    fn report_invalid_free(&self, addr: usize) {
        stdio::report_invalid_free(addr);
    }
}
