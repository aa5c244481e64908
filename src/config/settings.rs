//! Heap configuration read from the judge harness environment.
//!
//! Reading happens before the allocator exists (and sometimes from inside the
//! first `malloc`), so nothing here may allocate.

use serde::Serialize;
use std::ffi::CStr;

/// Environment variable holding the arena capacity in bytes.
pub const HEAP_SIZE_ENV: &str = "EASYSANDBOX_HEAPSIZE";
const HEAP_SIZE_ENV_C: &CStr = c"EASYSANDBOX_HEAPSIZE";

/// 8 MiB
pub const DEFAULT_HEAP_SIZE: usize = 8 * 1024 * 1024;

/// Where the effective heap size came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HeapSizeSource {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "environment")]
    Environment,
    /// Variable was set but malformed, zero, or overflowing
    #[serde(rename = "fallback")]
    Fallback,
}

/// Shim configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ShimConfig {
    /// Total bytes reserved for the private region
    pub heap_size: usize,
    pub source: HeapSizeSource,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            source: HeapSizeSource::Default,
        }
    }
}

impl ShimConfig {
    pub const fn with_heap_size(heap_size: usize) -> Self {
        Self {
            heap_size,
            source: HeapSizeSource::Environment,
        }
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        // SAFETY: getenv returns null or a pointer into the environment block,
        // which stays valid because nothing in the shim mutates the environment.
        let raw = unsafe { libc::getenv(HEAP_SIZE_ENV_C.as_ptr()) };
        if raw.is_null() {
            return Self::default();
        }
        let value = unsafe { CStr::from_ptr(raw) };
        Self::from_value(value.to_str().ok())
    }

    /// Resolve a raw variable value. `None` means the variable was present
    /// but not valid UTF-8.
    pub fn from_value(value: Option<&str>) -> Self {
        match value.and_then(parse_size) {
            Some(heap_size) if heap_size > 0 => Self::with_heap_size(heap_size),
            _ => Self {
                heap_size: DEFAULT_HEAP_SIZE,
                source: HeapSizeSource::Fallback,
            },
        }
    }
}

/// Parse a byte count: decimal digits with an optional `K`, `M` or `G`
/// (binary) suffix. Surrounding whitespace is ignored.
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, shift) = match text.as_bytes().last()? {
        b'k' | b'K' => (&text[..text.len() - 1], 10),
        b'm' | b'M' => (&text[..text.len() - 1], 20),
        b'g' | b'G' => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let base: usize = digits.parse().ok()?;
    base.checked_mul(1usize << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_suffixed_sizes() {
        assert_eq!(parse_size("65536"), Some(65536));
        assert_eq!(parse_size(" 64K "), Some(65536));
        assert_eq!(parse_size("8m"), Some(DEFAULT_HEAP_SIZE));
        assert_eq!(parse_size("1G"), Some(1 << 30));
    }

    #[test]
    fn parse_rejects_malformed_sizes() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("K"), None);
        assert_eq!(parse_size("-4096"), None);
        assert_eq!(parse_size("12abc"), None);
        assert_eq!(parse_size("1.5M"), None);
        assert_eq!(parse_size("99999999999999999999999"), None);
    }

    #[test]
    fn malformed_value_falls_back_to_default() {
        let config = ShimConfig::from_value(Some("lots"));
        assert_eq!(config.heap_size, DEFAULT_HEAP_SIZE);
        assert_eq!(config.source, HeapSizeSource::Fallback);

        let config = ShimConfig::from_value(Some("0"));
        assert_eq!(config.source, HeapSizeSource::Fallback);

        let config = ShimConfig::from_value(None);
        assert_eq!(config.source, HeapSizeSource::Fallback);
    }

    #[test]
    fn valid_value_is_used() {
        let config = ShimConfig::from_value(Some("1048576"));
        assert_eq!(config.heap_size, 1 << 20);
        assert_eq!(config.source, HeapSizeSource::Environment);
    }

    #[test]
    fn default_is_eight_mib() {
        let config = ShimConfig::default();
        assert_eq!(config.heap_size, 8_388_608);
        assert_eq!(config.source, HeapSizeSource::Default);
    }
}
