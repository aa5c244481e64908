//! First-fit free-list allocator over the arena.
//!
//! Blocks form a doubly linked list in address order covering every byte the
//! allocator has taken from the arena. Free neighbours are merged as soon as
//! they appear, so no two adjacent blocks are ever both free.
//!
//! None of this code allocates, logs, or calls back into the program: it runs
//! underneath `malloc` itself.

use super::block::{block_size_for, BlockHeader, HEADER_SIZE};
use super::region::Arena;
use crate::config::types::{Result, ShimError};
use std::ptr::{self, NonNull};

/// Smallest raw grab requested from the arena when the list has no fit.
pub const MIN_GRAB: usize = 64 * 1024;

/// Snapshot of one block, for inspection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Header offset from the region base
    pub offset: usize,
    /// Bytes including the header
    pub size: usize,
    pub allocated: bool,
}

/// Block allocator state
#[derive(Debug)]
pub struct Heap {
    arena: Arena,
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
}

impl Heap {
    pub fn new(arena: Arena) -> Self {
        Self {
            arena,
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// Reserve a fresh region of `capacity` bytes and build a heap on it.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Arena::reserve(capacity).map(Self::new)
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Raw arena access for program-break emulation.
    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    /// `malloc`: first fit, split, mark allocated.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.place(size, HEADER_SIZE)
    }

    /// `posix_memalign` / `aligned_alloc`: `align` must be a power of two.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(ShimError::InvalidAlignment { align });
        }
        self.place(size, align.max(HEADER_SIZE))
    }

    /// `calloc`: overflow of `count * size` is an allocation failure.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Result<NonNull<u8>> {
        let total = count.checked_mul(size).ok_or(ShimError::OutOfMemory {
            requested: usize::MAX,
            remaining: self.arena.remaining(),
        })?;
        let payload = self.allocate(total)?;
        // SAFETY: the block's payload holds at least `total` bytes.
        unsafe { ptr::write_bytes(payload.as_ptr(), 0, total) };
        Ok(payload)
    }

    /// `free`: null is ignored; an unknown or already-free pointer is
    /// reported and leaves the heap untouched.
    pub fn free(&mut self, ptr: *mut u8) -> Result<()> {
        let Some(payload) = NonNull::new(ptr) else {
            return Ok(());
        };
        let block = self.validate(payload)?;
        // SAFETY: validate() proved `block` is a linked, allocated header.
        unsafe {
            (*block).set_allocated(false);
            self.coalesce(block);
            self.coalesce((*block).prev);
        }
        Ok(())
    }

    /// `realloc`: always allocate, copy the common prefix, then free.
    ///
    /// Returns `Ok(None)` when `new_size` is zero (the old block is freed).
    /// On allocation failure the old block is left intact.
    pub fn resize(&mut self, ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_size).map(Some);
        };
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let block = self.validate(old)?;
        // SAFETY: validated header.
        let old_payload = unsafe { (*block).size } - HEADER_SIZE;
        let new = self.allocate(new_size)?;
        // SAFETY: both payloads are live, distinct blocks of at least the copied length.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_payload.min(new_size)) };
        self.free(old.as_ptr())?;
        Ok(Some(new))
    }

    /// `malloc_usable_size`
    pub fn usable_size(&self, ptr: *mut u8) -> Result<usize> {
        let payload = NonNull::new(ptr).ok_or(ShimError::InvalidFree { addr: 0 })?;
        let block = self.validate(payload)?;
        // SAFETY: validated header.
        Ok(unsafe { (*block).size } - HEADER_SIZE)
    }

    /// Walk the list head to tail.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            cursor: self.head,
        }
    }

    fn place(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let oom = ShimError::OutOfMemory {
            requested: size,
            remaining: self.arena.remaining(),
        };
        let required = block_size_for(size).ok_or(oom)?;

        // SAFETY: every pointer followed below is a header linked into this heap.
        unsafe {
            let (block, lead) = match self.first_fit(required, align) {
                Some(found) => found,
                None => {
                    let slack = if align > HEADER_SIZE { align } else { 0 };
                    let wanted = required.checked_add(slack).ok_or(ShimError::OutOfMemory {
                        requested: size,
                        remaining: self.arena.remaining(),
                    })?;
                    let block = self.grow(wanted)?;
                    (block, lead_for(block, align))
                }
            };

            let block = if lead > 0 { self.carve(block, lead) } else { block };
            if (*block).size - required > HEADER_SIZE {
                let rest = self.carve(block, required);
                self.coalesce(rest);
            }
            (*block).set_allocated(true);
            Ok(BlockHeader::payload(block))
        }
    }

    /// Earliest free block that fits `required` bytes once its payload is
    /// pushed up to `align`.
    unsafe fn first_fit(&self, required: usize, align: usize) -> Option<(*mut BlockHeader, usize)> {
        let mut block = self.head;
        while !block.is_null() {
            if !(*block).is_allocated() {
                let lead = lead_for(block, align);
                if lead.checked_add(required).is_some_and(|need| (*block).size >= need) {
                    return Some((block, lead));
                }
            }
            block = (*block).next;
        }
        None
    }

    /// Obtain a free block of at least `wanted` bytes from the arena, either
    /// by extending a free tail that ends at the cursor or by appending.
    unsafe fn grow(&mut self, wanted: usize) -> Result<*mut BlockHeader> {
        let tail = self.tail;
        if !tail.is_null()
            && !(*tail).is_allocated()
            && BlockHeader::end(tail) == self.arena.end().as_ptr()
        {
            let (_, granted) = self.bump_amortized(wanted - (*tail).size, 0)?;
            (*tail).size += granted;
            return Ok(tail);
        }

        // Raw sbrk() grants can leave the cursor off a header boundary.
        let pad = (HEADER_SIZE - self.arena.cursor() % HEADER_SIZE) % HEADER_SIZE;
        let (start, granted) = self.bump_amortized(wanted, pad)?;
        let block = BlockHeader::init(start, granted);
        (*block).prev = self.tail;
        if self.tail.is_null() {
            self.head = block;
        } else {
            (*self.tail).next = block;
        }
        self.tail = block;
        Ok(block)
    }

    /// Bump at least `MIN_GRAB` bytes, falling back to exactly `needed`.
    /// Returns the start past `pad` and the usable size granted.
    fn bump_amortized(&mut self, needed: usize, pad: usize) -> Result<(NonNull<u8>, usize)> {
        let preferred = needed.max(MIN_GRAB);
        let attempt = |arena: &mut Arena, size: usize| -> Result<(NonNull<u8>, usize)> {
            let total = size.checked_add(pad).ok_or(ShimError::OutOfMemory {
                requested: size,
                remaining: arena.remaining(),
            })?;
            let start = arena.bump(total)?;
            // SAFETY: the grant covers `pad + size` bytes.
            Ok((unsafe { NonNull::new_unchecked(start.as_ptr().add(pad)) }, size))
        };
        match attempt(&mut self.arena, preferred) {
            Ok(grant) => Ok(grant),
            Err(_) if preferred > needed => attempt(&mut self.arena, needed),
            Err(err) => Err(err),
        }
    }

    /// Shrink `block` to `at` bytes and splice a free block holding the rest
    /// right after it. Returns the new block.
    unsafe fn carve(&mut self, block: *mut BlockHeader, at: usize) -> *mut BlockHeader {
        let rest = block.cast::<u8>().add(at).cast::<BlockHeader>();
        let next = (*block).next;
        rest.write(BlockHeader {
            prev: block,
            next,
            size: (*block).size - at,
            flags: 0,
        });
        if next.is_null() {
            self.tail = rest;
        } else {
            (*next).prev = rest;
        }
        (*block).next = rest;
        (*block).size = at;
        rest
    }

    /// Absorb the successor of `block` when both are free and contiguous.
    unsafe fn coalesce(&mut self, block: *mut BlockHeader) {
        if block.is_null() || (*block).is_allocated() {
            return;
        }
        let next = (*block).next;
        if next.is_null() || (*next).is_allocated() || BlockHeader::end(block) != next.cast::<u8>()
        {
            return;
        }
        (*block).size += (*next).size;
        let after = (*next).next;
        (*block).next = after;
        if after.is_null() {
            self.tail = block;
        } else {
            (*after).prev = block;
        }
    }

    /// Map a payload pointer back to its header, rejecting anything that is
    /// not a live allocated block of this heap.
    fn validate(&self, payload: NonNull<u8>) -> Result<*mut BlockHeader> {
        let addr = payload.as_ptr() as usize;
        let invalid = ShimError::InvalidFree { addr };
        let block = BlockHeader::from_payload(payload);
        if addr < HEADER_SIZE || !self.is_header_slot(block) {
            return Err(invalid);
        }

        // SAFETY: `block` lies inside the granted prefix on a header boundary;
        // every field is a plain word, so reading arbitrary bytes is sound.
        unsafe {
            let size = (*block).size;
            let fits = size >= HEADER_SIZE
                && size % HEADER_SIZE == 0
                && (block as usize)
                    .checked_add(size)
                    .is_some_and(|end| end <= self.arena.end().as_ptr() as usize);
            if !fits || !self.is_linked(block) || !(*block).is_allocated() {
                return Err(invalid);
            }
        }
        Ok(block)
    }

    fn is_header_slot(&self, block: *mut BlockHeader) -> bool {
        let addr = block as usize;
        let base = self.arena.base().as_ptr() as usize;
        self.arena.contains(addr)
            && (addr - base) % HEADER_SIZE == 0
            && addr + HEADER_SIZE <= self.arena.end().as_ptr() as usize
    }

    unsafe fn is_linked(&self, block: *mut BlockHeader) -> bool {
        let prev = (*block).prev;
        let next = (*block).next;
        let prev_ok = if prev.is_null() {
            block == self.head
        } else {
            self.is_header_slot(prev) && (*prev).next == block
        };
        let next_ok = if next.is_null() {
            block == self.tail
        } else {
            self.is_header_slot(next) && (*next).prev == block
        };
        prev_ok && next_ok
    }
}

/// Padding that pushes the payload of `block` up to `align`. Always zero or a
/// multiple of `HEADER_SIZE`, so a non-zero lead forms a valid free block.
fn lead_for(block: *mut BlockHeader, align: usize) -> usize {
    let payload = block as usize + HEADER_SIZE;
    let aligned = (payload + align - 1) & !(align - 1);
    aligned - payload
}

/// Iterator over the block list
pub struct Blocks<'a> {
    heap: &'a Heap,
    cursor: *mut BlockHeader,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.cursor.is_null() {
            return None;
        }
        // SAFETY: the cursor walks headers linked into `heap`, which is
        // borrowed for the iterator's lifetime.
        unsafe {
            let block = self.cursor;
            self.cursor = (*block).next;
            Some(BlockInfo {
                offset: block as usize - self.heap.arena.base().as_ptr() as usize,
                size: (*block).size,
                allocated: (*block).is_allocated(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(capacity: usize) -> Heap {
        Heap::with_capacity(capacity).expect("reserve test heap")
    }

    fn assert_tiles(heap: &Heap) {
        let mut expected = 0;
        let mut prev_free = false;
        for block in heap.blocks() {
            assert_eq!(block.offset, expected, "gap or overlap at {:#x}", block.offset);
            assert_eq!(block.size % HEADER_SIZE, 0);
            assert!(!(prev_free && !block.allocated), "adjacent free blocks");
            prev_free = !block.allocated;
            expected += block.size;
        }
        assert_eq!(expected, heap.arena().cursor());
    }

    #[test]
    fn first_allocation_grabs_minimum() {
        let mut heap = heap(1 << 20);
        let p = heap.allocate(10).unwrap();
        assert_eq!(heap.arena().cursor(), MIN_GRAB);
        assert_eq!(p.as_ptr() as usize % 16, 0);
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].size, 2 * HEADER_SIZE);
        assert!(blocks[0].allocated);
        assert!(!blocks[1].allocated);
        assert_tiles(&heap);
    }

    #[test]
    fn small_excess_is_not_split() {
        let mut heap = heap(1 << 20);
        // Exactly fills the first grab except for one header's worth.
        let p = heap.allocate(MIN_GRAB - 2 * HEADER_SIZE).unwrap();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, MIN_GRAB);
        assert_eq!(heap.usable_size(p.as_ptr()).unwrap(), MIN_GRAB - HEADER_SIZE);
    }

    #[test]
    fn first_fit_prefers_lowest_address() {
        let mut heap = heap(1 << 20);
        let a = heap.allocate(256).unwrap();
        let _guard1 = heap.allocate(16).unwrap();
        let b = heap.allocate(256).unwrap();
        let _guard2 = heap.allocate(16).unwrap();
        heap.free(b.as_ptr()).unwrap();
        heap.free(a.as_ptr()).unwrap();
        let c = heap.allocate(100).unwrap();
        assert_eq!(c, a);
        assert_tiles(&heap);
    }

    #[test]
    fn free_null_is_noop() {
        let mut heap = heap(1 << 20);
        heap.free(ptr::null_mut()).unwrap();
        assert_eq!(heap.arena().cursor(), 0);
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let mut heap = heap(1 << 20);
        heap.allocate(8).unwrap();
        let mut local = [0u8; 64];
        let err = heap.free(local.as_mut_ptr()).unwrap_err();
        assert!(matches!(err, ShimError::InvalidFree { .. }));
        assert_tiles(&heap);
    }

    #[test]
    fn interior_pointer_is_rejected() {
        let mut heap = heap(1 << 20);
        let p = heap.allocate(256).unwrap();
        let inner = unsafe { p.as_ptr().add(HEADER_SIZE) };
        assert!(heap.free(inner).is_err());
        let before: Vec<_> = heap.blocks().collect();
        assert!(before[0].allocated);
        heap.free(p.as_ptr()).unwrap();
    }

    #[test]
    fn grow_extends_free_tail() {
        let mut heap = heap(1 << 20);
        let a = heap.allocate(100).unwrap();
        // Tail is the free remainder of the first grab; a request larger than
        // it extends the tail in place instead of appending a new block.
        heap.allocate(MIN_GRAB).unwrap();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 3);
        assert!(blocks[1].allocated);
        assert_eq!(blocks[1].offset, block_size_for(100).unwrap());
        heap.free(a.as_ptr()).unwrap();
        assert_tiles(&heap);
    }

    #[test]
    fn exact_fit_fallback_uses_last_bytes() {
        let mut heap = heap(MIN_GRAB + 3 * HEADER_SIZE);
        heap.allocate(MIN_GRAB - HEADER_SIZE).unwrap();
        assert_eq!(heap.arena().cursor(), MIN_GRAB);
        // Less than a full grab remains; the exact request still succeeds.
        heap.allocate(2 * HEADER_SIZE).unwrap();
        assert_eq!(heap.arena().remaining(), 0);
        assert_tiles(&heap);
    }

    #[test]
    fn aligned_allocation_carves_lead_block() {
        let mut heap = heap(1 << 20);
        heap.allocate(8).unwrap();
        let p = heap.allocate_aligned(4096, 100).unwrap();
        assert_eq!(p.as_ptr() as usize % 4096, 0);
        assert_tiles(&heap);
        heap.free(p.as_ptr()).unwrap();
        assert_tiles(&heap);
    }

    #[test]
    fn small_alignment_is_plain_allocation() {
        let mut heap = heap(1 << 20);
        let p = heap.allocate_aligned(8, 40).unwrap();
        assert_eq!(p.as_ptr() as usize % 16, 0);
        assert_eq!(heap.blocks().next().unwrap().size, block_size_for(40).unwrap());
    }

    #[test]
    fn bad_alignment_is_rejected() {
        let mut heap = heap(1 << 20);
        let err = heap.allocate_aligned(48, 10).unwrap_err();
        assert!(matches!(err, ShimError::InvalidAlignment { align: 48 }));
        assert_eq!(heap.arena().cursor(), 0);
    }

    #[test]
    fn zeroed_allocation_clears_reused_block() {
        let mut heap = heap(1 << 20);
        let p = heap.allocate(64).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0xAB, 64) };
        heap.free(p.as_ptr()).unwrap();
        let q = heap.allocate_zeroed(8, 8).unwrap();
        assert_eq!(q, p);
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zeroed_overflow_fails_cleanly() {
        let mut heap = heap(1 << 20);
        let err = heap.allocate_zeroed(usize::MAX, 2).unwrap_err();
        assert!(matches!(err, ShimError::OutOfMemory { .. }));
        assert_eq!(heap.arena().cursor(), 0);
    }

    #[test]
    fn huge_request_does_not_overflow() {
        let mut heap = heap(1 << 20);
        assert!(heap.allocate(usize::MAX).is_err());
        assert!(heap.allocate_aligned(1 << 12, usize::MAX - 64).is_err());
        assert_eq!(heap.arena().cursor(), 0);
    }

    #[test]
    fn resize_failure_keeps_original() {
        let mut heap = heap(MIN_GRAB);
        let p = heap.allocate(16).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 7, 16) };
        assert!(heap.resize(p.as_ptr(), 1 << 20).is_err());
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 7));
        heap.free(p.as_ptr()).unwrap();
    }

    #[test]
    fn raw_break_space_is_never_absorbed() {
        let mut heap = heap(1 << 20);
        let a = heap.allocate(100).unwrap();
        heap.allocate(MIN_GRAB).unwrap();
        let raw = heap.arena_mut().break_by(40).unwrap();
        let b = heap.allocate(MIN_GRAB).unwrap();
        // New block starts past the raw grant, re-aligned to a header boundary.
        assert!(b.as_ptr() as usize > raw.as_ptr() as usize + 40);
        heap.free(b.as_ptr()).unwrap();
        heap.free(a.as_ptr()).unwrap();
        let blocks: Vec<_> = heap.blocks().collect();
        let last = blocks.last().unwrap();
        let before = &blocks[blocks.len() - 2];
        assert!(before.offset + before.size < last.offset);
    }
}
