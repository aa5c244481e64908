/// Core error and status types for the rustbox shim
use crate::exec::lifecycle::Phase;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed process exit statuses for startup-fatal conditions.
///
/// These are emitted through an immediate exit that bypasses registered
/// finalizers. Any other status is the sandboxed program's own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupStatus {
    /// The real process-entry function could not be resolved
    #[serde(rename = "resolve_failed")]
    ResolveFailed,
    /// The restricted execution mode could not be installed
    #[serde(rename = "restricted_mode_failed")]
    RestrictedModeFailed,
    /// `main` ran outside controlled termination (never expected)
    #[serde(rename = "main_returned")]
    MainReturned,
    /// The private memory region could not be reserved
    #[serde(rename = "region_reserve_failed")]
    RegionReserveFailed,
}

impl StartupStatus {
    pub const ALL: [StartupStatus; 4] = [
        StartupStatus::ResolveFailed,
        StartupStatus::RestrictedModeFailed,
        StartupStatus::MainReturned,
        StartupStatus::RegionReserveFailed,
    ];

    pub fn code(self) -> i32 {
        match self {
            StartupStatus::ResolveFailed => 120,
            StartupStatus::RestrictedModeFailed => 121,
            StartupStatus::MainReturned => 122,
            StartupStatus::RegionReserveFailed => 123,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    pub fn description(self) -> &'static str {
        match self {
            StartupStatus::ResolveFailed => "could not resolve the real process entry point",
            StartupStatus::RestrictedModeFailed => "could not install restricted (seccomp) mode",
            StartupStatus::MainReturned => "main returned without controlled termination",
            StartupStatus::RegionReserveFailed => "could not reserve the private heap region",
        }
    }
}

impl std::fmt::Display for StartupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// Custom error types for the shim.
///
/// Apart from `Io`, variants carry plain data only; building one on the
/// allocator path must never allocate.
#[derive(Error, Debug)]
pub enum ShimError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to reserve {capacity} byte region: {errno}")]
    RegionReserve {
        capacity: usize,
        errno: nix::errno::Errno,
    },

    #[error("Out of memory: requested {requested} bytes, {remaining} remaining")]
    OutOfMemory { requested: usize, remaining: usize },

    #[error("Negative break increment {increment} rejected")]
    NegativeIncrement { increment: isize },

    #[error("Invalid free at {addr:#x}")]
    InvalidFree { addr: usize },

    #[error("Invalid alignment {align}")]
    InvalidAlignment { align: usize },

    #[error("Heap state is already borrowed")]
    Reentrant,

    #[error("Finalizer registry full ({capacity} entries)")]
    RegistryFull { capacity: usize },

    #[error("Null callback rejected")]
    NullCallback,

    #[error("Failed to resolve {symbol}")]
    ResolveEntry { symbol: &'static str },

    #[error("Failed to install restricted mode: {0}")]
    RestrictedMode(nix::errno::Errno),

    #[error("Illegal lifecycle transition {from:?} -> {to:?}")]
    Phase { from: Phase, to: Phase },
}

impl ShimError {
    /// Exit status to use when this error aborts process startup.
    pub fn startup_status(&self) -> Option<StartupStatus> {
        match self {
            ShimError::RegionReserve { .. } => Some(StartupStatus::RegionReserveFailed),
            ShimError::ResolveEntry { .. } => Some(StartupStatus::ResolveFailed),
            ShimError::RestrictedMode(_) => Some(StartupStatus::RestrictedModeFailed),
            _ => None,
        }
    }
}

impl From<nix::errno::Errno> for ShimError {
    fn from(err: nix::errno::Errno) -> Self {
        ShimError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type alias for shim operations
pub type Result<T> = std::result::Result<T, ShimError>;
