//! Compile-time configuration for the allocator and its tracker.
//!
//! `MCHEAP_SIZE` has no fixed constant here: it is the `SIZE` const generic
//! parameter on [`crate::mcheap::McHeap`], chosen per `static` instance
//! rather than globally for the crate. `MCHEAP_ALIGNMENT` and the two HEAPS
//! behavior switches, by contrast, apply uniformly, so they live here.

/// Alignment applied to every section's payload address and to every
/// stored size. 16 bytes covers the common SSE/NEON vector alignment; a
/// consumer needing a different alignment can fork this constant.
pub const MCHEAP_ALIGNMENT: usize = 16;

/// When set, a zero-size [`crate::heaps::Heaps::realloc`] call is treated as
/// a resize request rather than a free, for underlying allocators whose
/// `realloc` does not free on a zero-size request.
pub const REALLOC_ZERO_DOESNT_FREE: bool = cfg!(feature = "realloc-zero-doesnt-free");

/// When set, skip the live-list walk and underlying integrity check
/// performed before every mutating HEAPS operation.
pub const NO_PRE_OPERATION_WALK_CHECK: bool = cfg!(feature = "no-pre-operation-walk-check");
