//! Execution control
//!
//! Process lifecycle around the sandboxed program's `main`.

pub mod finalizers;
pub mod lifecycle;
#[cfg(feature = "preload")]
pub mod preload;
