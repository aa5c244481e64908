//! rustbox-shim: an in-process sandbox for judged programs
//! Loaded with `LD_PRELOAD`, it takes over process entry, locks the program into
//! seccomp strict mode before `main`, and serves every allocation from a private
//! pre-reserved region so the program never needs `brk`/`mmap` again.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::symbols`]: Resolution of the real `__libc_start_main`
//! - [`kernel::stdio`]: C stdio flushing, the sentinel line, stdin priming
//! - [`kernel::seccomp`]: Strict-mode installation and status
//! - [`kernel::process`]: Immediate exit and the strict-mode exit path
//!
//! ## Private Heap ([`heap`])
//! - [`heap::region`]: Region reservation and the bump cursor
//! - [`heap::block`]: Block header layout
//! - [`heap::allocator`]: First-fit free list with split and coalesce
//!
//! ## Execution Control ([`exec`])
//! - [`exec::lifecycle`]: Phases, the shim context and controlled termination
//! - [`exec::finalizers`]: Bounded exit-handler registry
//! - `exec::preload`: Exported C ABI (feature `preload`)
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: Heap size from the environment
//! - [`config::types`]: Error type and startup exit statuses
//!
//! ## Observability ([`observability`])
//! - [`observability::logging`]: `env_logger` setup
//!
//! # Design Principles
//!
//! 1. **Nothing allocates under the allocator** - errors carry plain data,
//!    diagnostics are formatted on the stack
//! 2. **Startup failures are loud** - fixed exit statuses 120 to 123
//! 3. **Termination is idempotent** - every handler and finalizer runs once,
//!    even when `exit` is re-entered
//! 4. **Single thread by contract** - no locks on the hot path

#[cfg(all(feature = "preload", feature = "cli"))]
compile_error!(
    "features `preload` and `cli` are mutually exclusive; build the library with \
     `--no-default-features --features preload`"
);

// Kernel Primitives
pub mod kernel;

// Private Heap
pub mod heap;

// Execution Control
pub mod exec;

// Configuration
pub mod config;

// Observability
pub mod observability;

// Launcher
#[cfg(feature = "cli")]
pub mod cli;

pub use config::settings::ShimConfig;
pub use config::types::{Result, ShimError, StartupStatus};
pub use exec::lifecycle::{EntryPoints, Phase, ShimContext};
pub use heap::Heap;
pub use kernel::{Host, LinuxHost};
