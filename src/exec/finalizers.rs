//! Bounded registry of program exit handlers.
//!
//! Fixed capacity, no growth: the registry lives inside the shim context and
//! registration may happen before (or underneath) the allocator.

use crate::config::types::{Result, ShimError};
use std::ffi::c_void;

/// Maximum number of registered handlers.
pub const MAX_FINALIZERS: usize = 1024;

/// One registered exit handler
#[derive(Clone, Copy, Debug)]
pub enum Finalizer {
    /// `atexit(fn)`
    Plain(unsafe extern "C" fn()),
    /// `__cxa_atexit(fn, arg, dso)`
    WithArg {
        callback: unsafe extern "C" fn(*mut c_void),
        arg: *mut c_void,
    },
}

impl Finalizer {
    /// Invoke the handler.
    ///
    /// # Safety
    /// The callback must still be valid to call with its registered argument.
    pub unsafe fn invoke(self) {
        match self {
            Finalizer::Plain(callback) => callback(),
            Finalizer::WithArg { callback, arg } => callback(arg),
        }
    }
}

/// LIFO storage for up to [`MAX_FINALIZERS`] handlers
#[derive(Debug)]
pub struct FinalizerRegistry {
    slots: [Option<Finalizer>; MAX_FINALIZERS],
    len: usize,
}

impl Default for FinalizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FinalizerRegistry {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_FINALIZERS],
            len: 0,
        }
    }

    /// Append a handler; fails once the registry is full.
    pub fn push(&mut self, finalizer: Finalizer) -> Result<()> {
        if self.len == MAX_FINALIZERS {
            return Err(ShimError::RegistryFull {
                capacity: MAX_FINALIZERS,
            });
        }
        self.slots[self.len] = Some(finalizer);
        self.len += 1;
        Ok(())
    }

    /// Remove and return the most recently registered handler. The slot is
    /// cleared before the caller gets to run it.
    pub fn pop(&mut self) -> Option<Finalizer> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        self.slots[self.len].take()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        MAX_FINALIZERS
    }
}
