//! Interior mutability for single-threaded global state.
//!
//! `static` values in Rust are shared (`&T`), so mutating one requires
//! bypassing the borrow checker deliberately. `Locked<A>` does that with an
//! `UnsafeCell`, the same way a `static ALLOCATOR: Locked<FreeList>` would in
//! any freestanding target. It is sound only because this crate never runs
//! two operations concurrently; there is no lock here, just the promise.
//! Multi-threaded hosts need a real mutex instead.
//!
//! [`McHeap`](crate::mcheap::McHeap) and [`Heaps`](crate::heaps::Heaps) are
//! `Sync` on their own and never need this wrapper. It exists for a
//! [`PlatformAlloc`](crate::heaps::PlatformAlloc) implementor whose own
//! state is not already `Sync`:
//!
//! ```
//! use core::ptr::NonNull;
//! use mcheap_heaps::heaps::PlatformAlloc;
//! use mcheap_heaps::Locked;
//!
//! struct Bump {
//!     buffer: [u8; 256],
//!     used: usize,
//! }
//!
//! struct BumpAllocator(Locked<Bump>);
//!
//! impl PlatformAlloc for BumpAllocator {
//!     fn platform_alloc(&self, size: usize) -> Option<NonNull<u8>> {
//!         let state = self.0.lock();
//!         if state.used + size > state.buffer.len() {
//!             return None;
//!         }
//!         let ptr = unsafe { state.buffer.as_mut_ptr().add(state.used) };
//!         state.used += size;
//!         NonNull::new(ptr)
//!     }
//!
//!     fn platform_free(&self, _ptr: NonNull<u8>) {}
//! }
//!
//! static ALLOCATOR: BumpAllocator = BumpAllocator(Locked::new(Bump { buffer: [0; 256], used: 0 }));
//! assert!(ALLOCATOR.platform_alloc(16).is_some());
//! ```

use core::cell::UnsafeCell;

pub struct Locked<A> {
    inner: UnsafeCell<A>,
}

unsafe impl<A> Sync for Locked<A> {}

impl<A> Locked<A> {
    pub const fn new(inner: A) -> Self {
        Locked {
            inner: UnsafeCell::new(inner),
        }
    }

    /// # Safety
    /// The caller must not hold another live reference obtained from a
    /// previous `lock()` call, and must not call this reentrantly.
    pub fn lock(&self) -> &mut A {
        unsafe { &mut *self.inner.get() }
    }
}
