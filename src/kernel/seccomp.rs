// Restricted execution mode (seccomp strict)
//
// Strict mode leaves the process with read(2), write(2), _exit(2) and
// sigreturn(2). It is installed exactly once, during pre-main, and can never
// be lifted.

use crate::config::types::{Result, ShimError};

/// Installs the irreversible restricted execution mode.
pub trait RestrictedMode {
    fn install_restricted_mode(&self) -> Result<()>;
}

/// Seccomp mode of the calling process, as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeccompMode {
    Disabled,
    Strict,
    Filter,
}

impl std::fmt::Display for SeccompMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeccompMode::Disabled => write!(f, "disabled"),
            SeccompMode::Strict => write!(f, "strict"),
            SeccompMode::Filter => write!(f, "filter"),
        }
    }
}

/// Enter seccomp strict mode.
/// Must run after every syscall the program needs outside read/write/exit
/// has already happened (region mapped, stdio primed).
pub fn install_strict_mode() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: PR_SET_SECCOMP with SECCOMP_MODE_STRICT takes no pointers.
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_STRICT as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc == -1 {
            return Err(ShimError::RestrictedMode(nix::errno::Errno::last()));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(ShimError::RestrictedMode(nix::errno::Errno::ENOSYS))
    }
}

/// Query the current seccomp mode.
/// Never call this once strict mode is active: prctl itself is then fatal.
pub fn current_mode() -> Result<SeccompMode> {
    // SAFETY: PR_GET_SECCOMP takes no pointers.
    let rc = unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) };
    match rc {
        0 => Ok(SeccompMode::Disabled),
        1 => Ok(SeccompMode::Strict),
        2 => Ok(SeccompMode::Filter),
        _ => Err(nix::errno::Errno::last().into()),
    }
}

/// Check if seccomp is supported on this system
pub fn is_seccomp_supported() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/sys/kernel/seccomp").exists() || current_mode().is_ok()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Get seccomp support status for capability reporting
pub fn seccomp_status() -> String {
    if is_seccomp_supported() {
        "available".to_string()
    } else {
        "unavailable".to_string()
    }
}
