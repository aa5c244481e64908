//! Integration tests for the private heap
//!
//! These exercise the allocator through its public surface only and check
//! the structural invariants after every step.

use proptest::prelude::*;
use rustbox_shim::heap::{Arena, Heap, HEADER_SIZE, MIN_GRAB};
use rustbox_shim::ShimError;
use std::ptr::NonNull;

fn heap(capacity: usize) -> Heap {
    Heap::with_capacity(capacity).expect("reserve heap")
}

/// Blocks tile the granted prefix exactly, in address order, and no two
/// neighbours are both free.
fn assert_tiling(heap: &Heap) {
    let mut expected = 0;
    let mut prev_free = false;
    for block in heap.blocks() {
        assert_eq!(block.offset, expected, "gap or overlap at {:#x}", block.offset);
        assert!(block.size >= HEADER_SIZE);
        assert!(!(prev_free && !block.allocated), "uncoalesced free pair at {:#x}", block.offset);
        prev_free = !block.allocated;
        expected += block.size;
    }
    assert_eq!(expected, heap.arena().cursor());
}

fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), byte, len) };
}

fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
}

#[test]
fn test_bump_is_monotonic() {
    let mut arena = Arena::reserve(4096).unwrap();
    let base = arena.base().as_ptr() as usize;
    let mut last = 0;
    for step in [0, 1, 7, 64, 1000] {
        let start = arena.bump(step).unwrap().as_ptr() as usize - base;
        assert_eq!(start, last);
        last += step;
        assert_eq!(arena.cursor(), last);
    }
    assert!(arena.bump(4096).is_err());
    assert_eq!(arena.cursor(), last);
}

#[test]
fn test_out_of_memory_leaves_cursor_unchanged() {
    let mut heap = heap(65536);
    heap.allocate(1).unwrap();
    let cursor = heap.arena().cursor();

    let err = heap.allocate(200_000).unwrap_err();
    assert!(matches!(err, ShimError::OutOfMemory { .. }));
    assert_eq!(heap.arena().cursor(), cursor);
    assert_tiling(&heap);
}

#[test]
fn test_double_free_is_rejected_without_corruption() {
    let mut heap = heap(1 << 20);
    let a = heap.allocate(48).unwrap();
    let b = heap.allocate(48).unwrap();
    heap.free(a.as_ptr()).unwrap();
    let before: Vec<_> = heap.blocks().collect();

    let err = heap.free(a.as_ptr()).unwrap_err();
    assert!(matches!(err, ShimError::InvalidFree { addr } if addr == a.as_ptr() as usize));
    assert_eq!(heap.blocks().collect::<Vec<_>>(), before);

    heap.free(b.as_ptr()).unwrap();
    assert_tiling(&heap);
}

#[test]
fn test_neighbours_coalesce() {
    let mut heap = heap(1 << 20);
    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(100).unwrap();
    let _c = heap.allocate(100).unwrap();
    let block = heap.blocks().next().unwrap().size;

    heap.free(a.as_ptr()).unwrap();
    heap.free(b.as_ptr()).unwrap();

    let first = heap.blocks().next().unwrap();
    assert!(!first.allocated);
    assert_eq!(first.size, 2 * block);
    assert_tiling(&heap);
}

#[test]
fn test_freed_space_is_split_and_reused() {
    let mut heap = heap(1 << 20);
    let big = heap.allocate(1000).unwrap();
    let _guard = heap.allocate(16).unwrap();
    heap.free(big.as_ptr()).unwrap();
    let cursor = heap.arena().cursor();

    let x = heap.allocate(100).unwrap();
    let y = heap.allocate(100).unwrap();
    assert_eq!(x, big);
    assert!((y.as_ptr() as usize) < big.as_ptr() as usize + 1000);
    assert_eq!(heap.arena().cursor(), cursor);
    assert_tiling(&heap);
}

#[test]
fn test_resize_copies_common_prefix() {
    let mut heap = heap(1 << 20);
    let p = heap.allocate(16).unwrap();
    for (i, byte) in unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), 16) }
        .iter_mut()
        .enumerate()
    {
        *byte = i as u8;
    }

    let grown = heap.resize(p.as_ptr(), 64).unwrap().unwrap();
    assert_eq!(bytes(grown, 16), (0..16).collect::<Vec<u8>>().as_slice());

    let shrunk = heap.resize(grown.as_ptr(), 8).unwrap().unwrap();
    assert_eq!(bytes(shrunk, 8), &[0, 1, 2, 3, 4, 5, 6, 7]);
    assert!(heap.free(grown.as_ptr()).is_err());
    assert_tiling(&heap);
}

#[test]
fn test_resize_to_zero_is_free() {
    let mut freed = heap(1 << 20);
    let mut resized = heap(1 << 20);
    for heap in [&mut freed, &mut resized] {
        heap.allocate(40).unwrap();
        heap.allocate(200).unwrap();
    }
    let q_freed = freed.blocks().nth(1).unwrap().offset + HEADER_SIZE;
    let q_resized = resized.blocks().nth(1).unwrap().offset + HEADER_SIZE;

    freed
        .free(unsafe { freed.arena().base().as_ptr().add(q_freed) })
        .unwrap();
    let result = resized
        .resize(unsafe { resized.arena().base().as_ptr().add(q_resized) }, 0)
        .unwrap();

    assert!(result.is_none());
    assert_eq!(
        freed.blocks().collect::<Vec<_>>(),
        resized.blocks().collect::<Vec<_>>()
    );
}

#[test]
fn test_resize_null_is_allocate() {
    let mut heap = heap(1 << 20);
    let p = heap.resize(std::ptr::null_mut(), 32).unwrap().unwrap();
    assert!(heap.usable_size(p.as_ptr()).unwrap() >= 32);
}

#[test]
fn test_small_heap_is_usable_to_the_end() {
    // Smaller than one amortised grab: growth falls back to exact sizes.
    let mut heap = heap(MIN_GRAB / 2);
    let mut live = Vec::new();
    while let Ok(p) = heap.allocate(1000) {
        live.push(p);
    }
    assert!(!live.is_empty());
    assert!(heap.arena().remaining() < 1000 + 2 * HEADER_SIZE);
    assert_tiling(&heap);
}

#[derive(Clone, Debug)]
enum Op {
    Allocate(usize),
    Free(usize),
    Resize(usize, usize),
    Zeroed(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3000).prop_map(Op::Allocate),
        any::<usize>().prop_map(Op::Free),
        (any::<usize>(), 0usize..3000).prop_map(|(i, n)| Op::Resize(i, n)),
        (0usize..64, 0usize..64).prop_map(|(c, n)| Op::Zeroed(c, n)),
    ]
}

proptest! {
    #[test]
    fn random_sequences_keep_invariants(ops in proptest::collection::vec(op(), 1..120)) {
        let mut heap = heap(256 * 1024);
        // (payload, requested length, fill byte)
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            let tag = (step % 251) as u8 + 1;
            match op {
                Op::Allocate(size) => {
                    if let Ok(p) = heap.allocate(size) {
                        fill(p, size, tag);
                        live.push((p, size, tag));
                    }
                }
                Op::Zeroed(count, size) => {
                    if let Ok(p) = heap.allocate_zeroed(count, size) {
                        prop_assert!(bytes(p, count * size).iter().all(|&b| b == 0));
                        fill(p, count * size, tag);
                        live.push((p, count * size, tag));
                    }
                }
                Op::Free(index) if !live.is_empty() => {
                    let (p, _, _) = live.swap_remove(index % live.len());
                    prop_assert!(heap.free(p.as_ptr()).is_ok());
                }
                Op::Resize(index, size) if !live.is_empty() => {
                    let slot = index % live.len();
                    let (p, len, old_tag) = live[slot];
                    match heap.resize(p.as_ptr(), size) {
                        Ok(Some(q)) => {
                            let kept = len.min(size);
                            prop_assert!(bytes(q, kept).iter().all(|&b| b == old_tag));
                            fill(q, size, tag);
                            live[slot] = (q, size, tag);
                        }
                        Ok(None) => {
                            prop_assert_eq!(size, 0);
                            live.swap_remove(slot);
                        }
                        Err(err) => {
                            let is_oom = matches!(err, ShimError::OutOfMemory { .. });
                            prop_assert!(is_oom);
                        }
                    }
                }
                Op::Free(_) | Op::Resize(..) => {}
            }

            assert_tiling(&heap);
            prop_assert_eq!(heap.blocks().filter(|b| b.allocated).count(), live.len());
            for &(p, len, byte) in &live {
                prop_assert_eq!(p.as_ptr() as usize % 16, 0);
                prop_assert!(bytes(p, len).iter().all(|&b| b == byte));
            }
        }
    }
}
