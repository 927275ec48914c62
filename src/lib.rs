//! A deterministic fixed-buffer allocator ([`mcheap`]) and an
//! allocation-tracking wrapper that can sit in front of it, or in front of
//! any other allocator, ([`heaps`]).
//!
//! ```
//! use mcheap_heaps::mcheap::McHeap;
//! use mcheap_heaps::heaps::Heaps;
//!
//! static TRACKED: Heaps<McHeap<4096>> = Heaps::new(McHeap::new());
//!
//! let p = TRACKED.alloc_here(64).expect("allocation");
//! assert_eq!(TRACKED.allocation_count(), 1);
//! TRACKED.free_here(Some(p));
//! ```

#![no_std]

pub mod config;
pub mod heaps;
pub mod mcheap;
mod utils;

pub use heaps::{Heaps, PlatformAlloc, PlatformRealloc};
pub use mcheap::{McHeap, McHeapAt};
pub use utils::locked::Locked;
