//! Private memory region and the bump cursor over it.
//!
//! The region is mapped once, before restricted mode is installed, and is the
//! only memory the allocator ever hands out.

use crate::config::types::{Result, ShimError};
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Fixed-capacity anonymous mapping.
#[derive(Debug)]
pub struct Region {
    base: NonNull<u8>,
    capacity: usize,
}

impl Region {
    /// Map `capacity` zeroed, private, read/write bytes.
    pub fn reserve(capacity: usize) -> Result<Self> {
        let length = NonZeroUsize::new(capacity).ok_or(ShimError::RegionReserve {
            capacity,
            errno: nix::errno::Errno::EINVAL,
        })?;

        // SAFETY: a fresh anonymous mapping at a kernel-chosen address cannot
        // alias any existing Rust object.
        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|errno| ShimError::RegionReserve { capacity, errno })?;

        Ok(Self {
            base: base.cast::<u8>(),
            capacity,
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: base/capacity describe exactly the mapping created in reserve().
        let _ = unsafe { munmap(self.base.cast(), self.capacity) };
    }
}

/// Monotonic cursor into a [`Region`].
///
/// Invariant: `0 <= cursor <= capacity`; the cursor only moves forward.
#[derive(Debug)]
pub struct Arena {
    region: Region,
    cursor: usize,
}

impl Arena {
    pub fn new(region: Region) -> Self {
        Self { region, cursor: 0 }
    }

    pub fn reserve(capacity: usize) -> Result<Self> {
        Region::reserve(capacity).map(Self::new)
    }

    /// Grant `increment` fresh bytes and return the start of the grant.
    ///
    /// Leaves the cursor untouched on failure.
    pub fn bump(&mut self, increment: usize) -> Result<NonNull<u8>> {
        let remaining = self.remaining();
        if increment > remaining {
            return Err(ShimError::OutOfMemory {
                requested: increment,
                remaining,
            });
        }
        let start = self.end();
        self.cursor += increment;
        Ok(start)
    }

    /// Program-break flavoured bump. Negative increments are rejected; the
    /// cursor never moves backwards.
    pub fn break_by(&mut self, increment: isize) -> Result<NonNull<u8>> {
        if increment < 0 {
            return Err(ShimError::NegativeIncrement { increment });
        }
        self.bump(increment as usize)
    }

    pub fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    /// First byte past the granted prefix.
    pub fn end(&self) -> NonNull<u8> {
        // SAFETY: cursor <= capacity, so the result stays within or one past the mapping.
        unsafe { NonNull::new_unchecked(self.region.base().as_ptr().add(self.cursor)) }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    pub fn remaining(&self) -> usize {
        self.region.capacity() - self.cursor
    }

    /// Whether `addr` lies in the granted prefix.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base().as_ptr() as usize;
        addr >= base && addr < base + self.cursor
    }
}
