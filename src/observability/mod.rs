//! Observability
//!
//! Structured logging through the `log` facade.

pub mod logging;
