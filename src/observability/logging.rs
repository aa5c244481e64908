//! `env_logger` setup for both the preloaded shim and the launcher.

use std::sync::atomic::{AtomicBool, Ordering};

/// Filter variable read by the preloaded shim. Quiet unless set.
pub const SHIM_LOG_ENV: &str = "RUSTBOX_SHIM_LOG";

static SHIM_LOGGING: AtomicBool = AtomicBool::new(false);

/// Install the shim's logger once.
///
/// Timestamps and terminal colour probing stay off: both issue system calls
/// that restricted mode would kill the process for.
pub fn init_shim_logging() {
    if SHIM_LOGGING.swap(true, Ordering::SeqCst) {
        return;
    }
    let env = env_logger::Env::new().filter_or(SHIM_LOG_ENV, "off");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_module_path(false)
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}

/// Launcher logging, driven by `RUST_LOG`.
pub fn init_cli_logging() {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .try_init();
}
