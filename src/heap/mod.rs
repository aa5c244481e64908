//! Private heap: one pre-reserved region, a bump cursor, and a first-fit
//! block list on top.
//!
//! Dependency direction: region -> block -> allocator

pub mod allocator;
pub mod block;
pub mod region;

pub use allocator::{BlockInfo, Heap, MIN_GRAB};
pub use block::{BlockHeader, HEADER_SIZE};
pub use region::{Arena, Region};
