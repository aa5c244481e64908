//! In-band block header.
//!
//! Every block starts with a `BlockHeader`; the payload handed to the program
//! begins immediately after it. Headers sit at multiples of [`HEADER_SIZE`]
//! from the region base, so payloads inherit that alignment.

use std::mem;
use std::ptr::NonNull;

/// Block metadata stored at the start of every block.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct BlockHeader {
    pub prev: *mut BlockHeader,
    pub next: *mut BlockHeader,
    /// Bytes including this header
    pub size: usize,
    /// A full word so any bit pattern read during pointer validation is valid
    pub flags: usize,
}

const ALLOCATED: usize = 1;

/// Size of a header and the allocation unit for block sizes.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Payload alignment guaranteed by plain allocations.
pub const MIN_ALIGN: usize = 16;

const _: () = assert!(HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(HEADER_SIZE.is_power_of_two());

/// Round `n` up to a multiple of `multiple` (a power of two).
#[inline]
pub const fn round_up(n: usize, multiple: usize) -> Option<usize> {
    match n.checked_add(multiple - 1) {
        Some(v) => Some(v & !(multiple - 1)),
        None => None,
    }
}

/// Block size needed to hold `payload` bytes.
#[inline]
pub fn block_size_for(payload: usize) -> Option<usize> {
    round_up(payload.checked_add(HEADER_SIZE)?, HEADER_SIZE)
}

impl BlockHeader {
    /// Write a fresh, unlinked free header at `at`.
    ///
    /// # Safety
    /// `at` must be valid for writes of `HEADER_SIZE` bytes and aligned to it.
    pub unsafe fn init(at: NonNull<u8>, size: usize) -> *mut BlockHeader {
        let block = at.as_ptr().cast::<BlockHeader>();
        block.write(BlockHeader {
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            size,
            flags: 0,
        });
        block
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.flags & ALLOCATED != 0
    }

    #[inline]
    pub fn set_allocated(&mut self, allocated: bool) {
        if allocated {
            self.flags |= ALLOCATED;
        } else {
            self.flags &= !ALLOCATED;
        }
    }

    /// Payload address of `block`.
    ///
    /// # Safety
    /// `block` must point at a live header.
    #[inline]
    pub unsafe fn payload(block: *mut BlockHeader) -> NonNull<u8> {
        NonNull::new_unchecked(block.cast::<u8>().add(HEADER_SIZE))
    }

    /// First byte past `block`.
    ///
    /// # Safety
    /// `block` must point at a live header.
    #[inline]
    pub unsafe fn end(block: *mut BlockHeader) -> *mut u8 {
        block.cast::<u8>().add((*block).size)
    }

    /// Header address for a payload pointer. Does not validate.
    #[inline]
    pub fn from_payload(ptr: NonNull<u8>) -> *mut BlockHeader {
        ptr.as_ptr().wrapping_sub(HEADER_SIZE).cast::<BlockHeader>()
    }
}
