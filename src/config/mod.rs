//! Configuration and shared type definitions.
//!
//! - `types`: error enum, result alias, startup exit statuses
//! - `settings`: heap size configuration from the environment

pub mod settings;
pub mod types;
