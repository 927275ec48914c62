//! HEAPS: an allocation-tracking wrapper over any underlying allocator.
//!
//! `Heaps<A>` interposes on every request to an allocator implementing
//! [`PlatformAlloc`] (and, for `realloc`/`calloc`/`report`, the stronger
//! [`PlatformRealloc`]). Every tracked allocation gets a [`Record`] header
//! prepended in front of its payload, linked into a LIFO list rooted at
//! `head`. The wrapper never allocates through any interface but the one it
//! wraps: its own bookkeeping (in particular the array built by [`Heaps::report`])
//! goes through the same `platform_alloc`/`platform_realloc` calls a caller's
//! own allocations do.
//!
//! `file`/`line` call-site parameters stand in for the original's
//! `__FILE__`/`__LINE__` macro capture; the `_here` methods use
//! `#[track_caller]` to provide the same convenience without a macro.

use crate::config::{self, MCHEAP_ALIGNMENT};
use crate::mcheap::{McHeap, McHeapAt};
use core::cell::Cell;
use core::mem::size_of;
use core::panic::Location;
use core::ptr::{self, NonNull};

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A plug-in contract for the allocator HEAPS wraps. `platform_check` and
/// `platform_largest_free` default to doing nothing useful (always intact,
/// zero headroom) for allocators that have no cheaper way to answer them.
pub trait PlatformAlloc {
    fn platform_alloc(&self, size: usize) -> Option<NonNull<u8>>;
    fn platform_free(&self, ptr: NonNull<u8>);

    fn platform_check(&self) -> bool {
        true
    }

    fn platform_largest_free(&self) -> usize {
        0
    }
}

/// The stronger contract `realloc`, `calloc`, and `report` require. Kept as
/// a separate trait (rather than an optional method on [`PlatformAlloc`])
/// so those three methods simply do not exist on `Heaps<A>` for an `A` that
/// cannot reallocate, a compile-time rejection where the original relied
/// on the `realloc`/`alloc` macro being defined at all.
pub trait PlatformRealloc: PlatformAlloc {
    fn platform_realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>>;
}

impl<const SIZE: usize> PlatformAlloc for McHeap<SIZE> {
    fn platform_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate(size)
    }

    fn platform_free(&self, ptr: NonNull<u8>) {
        self.free(Some(ptr));
    }

    fn platform_check(&self) -> bool {
        self.is_intact()
    }

    fn platform_largest_free(&self) -> usize {
        self.largest_free()
    }
}

impl<const SIZE: usize> PlatformRealloc for McHeap<SIZE> {
    fn platform_realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.reallocate(ptr, size)
    }
}

impl PlatformAlloc for McHeapAt {
    fn platform_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate(size)
    }

    fn platform_free(&self, ptr: NonNull<u8>) {
        self.free(Some(ptr));
    }

    fn platform_check(&self) -> bool {
        self.is_intact()
    }

    fn platform_largest_free(&self) -> usize {
        self.largest_free()
    }
}

impl PlatformRealloc for McHeapAt {
    fn platform_realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.reallocate(ptr, size)
    }
}

#[repr(C)]
struct Record {
    size: usize,
    file: &'static str,
    line: u32,
    next: *mut Record,
}

const RECORD_HDR: usize = align_up(size_of::<Record>(), MCHEAP_ALIGNMENT);

fn record_content(r: *mut Record) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked((r as *mut u8).add(RECORD_HDR)) }
}

fn record_from_content(ptr: NonNull<u8>) -> *mut Record {
    unsafe { ptr.as_ptr().sub(RECORD_HDR) as *mut Record }
}

fn record_raw(r: *mut Record) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(r as *mut u8) }
}

/// A live tracked allocation, as surfaced by [`Heaps::allocation_list`].
#[derive(Clone, Copy)]
pub struct AllocationInfo {
    pub size: usize,
    pub file: &'static str,
    pub line: u32,
    pub content: NonNull<u8>,
}

fn record_info(r: *mut Record) -> AllocationInfo {
    unsafe {
        AllocationInfo {
            size: (*r).size,
            file: (*r).file,
            line: (*r).line,
            content: record_content(r),
        }
    }
}

/// Iterator over the live list, most-recently-allocated first.
pub struct AllocationIter<'h> {
    cursor: *mut Record,
    _marker: core::marker::PhantomData<&'h ()>,
}

impl<'h> Iterator for AllocationIter<'h> {
    type Item = AllocationInfo;

    fn next(&mut self) -> Option<AllocationInfo> {
        if self.cursor.is_null() {
            return None;
        }
        let info = record_info(self.cursor);
        self.cursor = unsafe { (*self.cursor).next };
        Some(info)
    }
}

/// The call site and size of the largest allocation ever made through a
/// given [`Heaps`] instance.
#[derive(Clone, Copy)]
pub struct LargestAllocation {
    pub size: usize,
    pub file: &'static str,
    pub line: u32,
}

/// A single per-call-site aggregation row, as produced by [`Heaps::report`].
#[derive(Clone, Copy)]
pub struct ReportEntry {
    pub file: &'static str,
    pub line: u32,
    pub count: usize,
    pub size: usize,
}

impl ReportEntry {
    pub fn compare_descending_size(a: &ReportEntry, b: &ReportEntry) -> core::cmp::Ordering {
        b.size.cmp(&a.size)
    }

    pub fn compare_descending_count(a: &ReportEntry, b: &ReportEntry) -> core::cmp::Ordering {
        b.count.cmp(&a.count)
    }
}

/// Routes a HEAPS diagnostic through `log::error!`. Opt into this as the
/// error handler when the host already has a `log` backend installed;
/// otherwise diagnostics are silently dropped unless a handler is supplied.
#[cfg(feature = "log")]
pub fn log_error_handler(msg: &str, file: &'static str, line: u32) {
    log::error!("{msg} at {file}:{line}");
}

/// An allocation-tracking wrapper around an allocator `A`.
pub struct Heaps<A> {
    allocator: A,
    head: Cell<*mut Record>,
    allocation_count: Cell<usize>,
    allocation_count_peak: Cell<usize>,
    headroom: Cell<usize>,
    largest_allocation: Cell<LargestAllocation>,
    error_handler: Option<fn(&str, &'static str, u32)>,
}

unsafe impl<A: Sync> Sync for Heaps<A> {}

impl<A: PlatformAlloc> Heaps<A> {
    pub const fn new(allocator: A) -> Self {
        Self::with_error_handler_opt(allocator, None)
    }

    pub const fn with_error_handler(allocator: A, handler: fn(&str, &'static str, u32)) -> Self {
        Self::with_error_handler_opt(allocator, Some(handler))
    }

    const fn with_error_handler_opt(allocator: A, handler: Option<fn(&str, &'static str, u32)>) -> Self {
        Self {
            allocator,
            head: Cell::new(ptr::null_mut()),
            allocation_count: Cell::new(0),
            allocation_count_peak: Cell::new(0),
            headroom: Cell::new(usize::MAX),
            largest_allocation: Cell::new(LargestAllocation { size: 0, file: "", line: 0 }),
            error_handler: handler,
        }
    }

    fn report_error(&self, msg: &str, file: &'static str, line: u32) {
        if let Some(handler) = self.error_handler {
            handler(msg, file, line);
        }
    }

    /// Walk the live list and compare its length against `allocation_count`,
    /// then consult the underlying allocator's own integrity check. Both are
    /// advisory: a mismatch reports `"heap broken"` but the caller's
    /// operation still proceeds. Skipped entirely when the
    /// `no-pre-operation-walk-check` feature is enabled.
    fn check_heap(&self, file: &'static str, line: u32) {
        if config::NO_PRE_OPERATION_WALK_CHECK {
            return;
        }
        let mut count = 0usize;
        let mut cur = self.head.get();
        unsafe {
            while !cur.is_null() {
                count += 1;
                cur = (*cur).next;
            }
        }
        if count != self.allocation_count.get() || !self.allocator.platform_check() {
            self.report_error("heap broken", file, line);
        }
    }

    fn link(&self, record: *mut Record) {
        unsafe {
            (*record).next = self.head.get();
        }
        self.head.set(record);
        let count = self.allocation_count.get() + 1;
        self.allocation_count.set(count);
        if count > self.allocation_count_peak.get() {
            self.allocation_count_peak.set(count);
        }
        unsafe {
            let size = (*record).size;
            if size > self.largest_allocation.get().size {
                self.largest_allocation.set(LargestAllocation {
                    size,
                    file: (*record).file,
                    line: (*record).line,
                });
            }
        }
    }

    /// Unlink `record` by pointer identity. Returns whether it was found.
    fn unlink(&self, record: *mut Record) -> bool {
        unsafe {
            let mut link = self.head.as_ptr();
            while !(*link).is_null() {
                if *link == record {
                    *link = (*record).next;
                    self.allocation_count.set(self.allocation_count.get() - 1);
                    return true;
                }
                link = &mut (*(*link)).next;
            }
        }
        false
    }

    fn find(&self, content: NonNull<u8>) -> *mut Record {
        let mut cur = self.head.get();
        unsafe {
            while !cur.is_null() {
                if record_content(cur) == content {
                    return cur;
                }
                cur = (*cur).next;
            }
        }
        ptr::null_mut()
    }

    fn track_headroom(&self) {
        let free = self.allocator.platform_largest_free();
        if free < self.headroom.get() {
            self.headroom.set(free);
        }
    }

    pub fn alloc(&self, size: usize, file: &'static str, line: u32) -> Option<NonNull<u8>> {
        self.check_heap(file, line);
        let Some(raw) = self.allocator.platform_alloc(RECORD_HDR + size) else {
            self.report_error("allocation failed", file, line);
            return None;
        };
        let record = raw.as_ptr() as *mut Record;
        unsafe {
            (*record).size = size;
            (*record).file = file;
            (*record).line = line;
        }
        self.link(record);
        self.track_headroom();
        Some(record_content(record))
    }

    #[track_caller]
    pub fn alloc_here(&self, size: usize) -> Option<NonNull<u8>> {
        let loc = Location::caller();
        self.alloc(size, loc.file(), loc.line())
    }

    pub fn free(&self, ptr: Option<NonNull<u8>>, file: &'static str, line: u32) -> Option<NonNull<u8>> {
        self.check_heap(file, line);
        if let Some(ptr) = ptr {
            let record = self.find(ptr);
            if record.is_null() {
                self.report_error("false free", file, line);
                return None;
            }
            self.unlink(record);
            self.allocator.platform_free(record_raw(record));
        }
        None
    }

    #[track_caller]
    pub fn free_here(&self, ptr: Option<NonNull<u8>>) {
        let loc = Location::caller();
        self.free(ptr, loc.file(), loc.line());
    }

    pub fn calloc(&self, count: usize, size: usize, file: &'static str, line: u32) -> Option<NonNull<u8>> {
        self.check_heap(file, line);
        let payload = count.saturating_mul(size);
        let Some(raw) = self.allocator.platform_alloc(RECORD_HDR + payload) else {
            self.report_error("calloc failed", file, line);
            return None;
        };
        let record = raw.as_ptr() as *mut Record;
        unsafe {
            (*record).size = payload;
            (*record).file = file;
            (*record).line = line;
            ptr::write_bytes(record_content(record).as_ptr(), 0, payload);
        }
        self.link(record);
        self.track_headroom();
        Some(record_content(record))
    }

    #[track_caller]
    pub fn calloc_here(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let loc = Location::caller();
        self.calloc(count, size, loc.file(), loc.line())
    }

    pub fn allocation_count(&self) -> usize {
        self.allocation_count.get()
    }

    pub fn allocation_count_peak(&self) -> usize {
        self.allocation_count_peak.get()
    }

    /// The minimum "largest free" observed across every successful
    /// alloc/realloc this instance has performed, or `usize::MAX` if none
    /// has ever succeeded. Never updated by `free`.
    pub fn headroom(&self) -> usize {
        self.headroom.get()
    }

    pub fn largest_allocation(&self) -> LargestAllocation {
        self.largest_allocation.get()
    }

    pub fn allocation_list(&self) -> AllocationIter<'_> {
        AllocationIter {
            cursor: self.head.get(),
            _marker: core::marker::PhantomData,
        }
    }
}

impl<A: PlatformRealloc> Heaps<A> {
    /// Resizes a tracked allocation. `ptr == None` degenerates to `alloc`;
    /// `size == 0` degenerates to `free` unless the `realloc-zero-doesnt-free`
    /// feature treats it as a resize to zero payload bytes instead.
    pub fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        file: &'static str,
        line: u32,
    ) -> Option<NonNull<u8>> {
        self.check_heap(file, line);
        let Some(ptr) = ptr else {
            let Some(raw) = self.allocator.platform_realloc(None, RECORD_HDR + size) else {
                self.report_error("allocation via heaps_realloc() failed", file, line);
                return None;
            };
            let record = raw.as_ptr() as *mut Record;
            unsafe {
                (*record).size = size;
                (*record).file = file;
                (*record).line = line;
            }
            self.link(record);
            self.track_headroom();
            return Some(record_content(record));
        };

        let record = self.find(ptr);
        if record.is_null() {
            self.report_error("false free via heaps_realloc()", file, line);
            return None;
        }

        let freeing = size == 0 && !config::REALLOC_ZERO_DOESNT_FREE;
        if freeing {
            self.unlink(record);
            self.allocator.platform_realloc(Some(record_raw(record)), 0);
            return None;
        }

        // Unlink before reallocating: the underlying allocator may move the
        // section (MCHEAP's extend-down preference memmoves it to a lower
        // address), which would overwrite this record's `next` field at its
        // old location. Splicing that stale pointer into the list after the
        // fact is undefined behavior, so the record must already be out of
        // the list before the memory under it can be disturbed.
        self.unlink(record);
        let Some(raw) = self.allocator.platform_realloc(Some(record_raw(record)), RECORD_HDR + size) else {
            // Realloc failure leaves the original block untouched at its
            // original address, so the old record is still valid; relink it.
            self.link(record);
            self.report_error("heaps_realloc() failed", file, line);
            return None;
        };
        let new_record = raw.as_ptr() as *mut Record;
        unsafe {
            (*new_record).size = size;
            (*new_record).file = file;
            (*new_record).line = line;
        }
        self.link(new_record);
        self.track_headroom();
        Some(record_content(new_record))
    }

    #[track_caller]
    pub fn realloc_here(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let loc = Location::caller();
        self.realloc(ptr, size, loc.file(), loc.line())
    }

    /// Build a per-call-site aggregation of the current live list.
    ///
    /// The array is allocated through this same interface, and is therefore
    /// itself a live record. Rather than special-case that, the array is
    /// grown one slot larger than the number of distinct call sites seen so
    /// far at every step, and after the walk a final entry describing
    /// `head` (which by construction is this very array's own record) is
    /// appended. The caller is responsible for freeing the returned slice
    /// through [`Heaps::free`] (its address is exactly the slice's base).
    pub fn report(&self, file: &'static str, line: u32) -> Option<&mut [ReportEntry]> {
        let mut array: Option<NonNull<u8>> = None;
        let mut distinct = 0usize;
        let mut cur = self.head.get();

        unsafe {
            while !cur.is_null() {
                let rec_file = (*cur).file;
                let rec_line = (*cur).line;
                let rec_size = (*cur).size;
                let next = (*cur).next;

                let existing = array.and_then(|a| {
                    let entries = core::slice::from_raw_parts_mut(a.as_ptr() as *mut ReportEntry, distinct);
                    entries.iter_mut().find(|e| e.file == rec_file && e.line == rec_line)
                });

                match existing {
                    Some(entry) => {
                        entry.count += 1;
                        entry.size += rec_size;
                    }
                    None => {
                        let new_distinct = distinct + 1;
                        let new_size = (new_distinct + 1) * size_of::<ReportEntry>();
                        match self.realloc(array, new_size, file, line) {
                            Some(grown) => {
                                array = Some(grown);
                                distinct = new_distinct;
                                let entries =
                                    core::slice::from_raw_parts_mut(grown.as_ptr() as *mut ReportEntry, distinct);
                                entries[distinct - 1] = ReportEntry {
                                    file: rec_file,
                                    line: rec_line,
                                    count: 1,
                                    size: rec_size,
                                };
                            }
                            None => {
                                if let Some(a) = array {
                                    self.free(Some(a), file, line);
                                }
                                return None;
                            }
                        }
                    }
                }
                cur = next;
            }
        }

        let array = array?;
        let head = self.head.get();
        unsafe {
            let entries = core::slice::from_raw_parts_mut(array.as_ptr() as *mut ReportEntry, distinct + 1);
            entries[distinct] = ReportEntry {
                file: (*head).file,
                line: (*head).line,
                count: 1,
                size: (*head).size,
            };
            Some(entries)
        }
    }

    #[track_caller]
    pub fn report_here(&self) -> Option<&mut [ReportEntry]> {
        let loc = Location::caller();
        self.report(loc.file(), loc.line())
    }

    pub fn calloc_via_realloc(&self, count: usize, size: usize, file: &'static str, line: u32) -> Option<NonNull<u8>> {
        let payload = count.saturating_mul(size);
        let ptr = self.realloc(None, payload, file, line)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, payload) };
        Some(ptr)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::mcheap::McHeap;

    fn fresh() -> Heaps<McHeap<4096>> {
        Heaps::new(McHeap::new())
    }

    #[test]
    fn lifo_linkage_matches_scenario() {
        let h = fresh();
        h.alloc(101, "file-one", 1).unwrap();
        h.alloc(102, "file-two", 2).unwrap();
        let p3 = h.alloc(103, "file-three", 3).unwrap();

        let sizes: std::vec::Vec<(&str, usize)> = h.allocation_list().map(|i| (i.file, i.size)).collect();
        assert_eq!(sizes, [("file-three", 103), ("file-two", 102), ("file-one", 101)]);

        h.free(Some(p3), "file-three", 3);
        let sizes: std::vec::Vec<(&str, usize)> = h.allocation_list().map(|i| (i.file, i.size)).collect();
        assert_eq!(sizes, [("file-two", 102), ("file-one", 101)]);
    }

    #[test]
    fn peak_tracks_the_high_water_mark() {
        let h = fresh();
        let mut ptrs = std::vec::Vec::new();
        for i in 0..7 {
            ptrs.push(h.alloc(8, "loop", i).unwrap());
        }
        assert_eq!(h.allocation_count(), 7);
        assert_eq!(h.allocation_count_peak(), 7);
        for p in ptrs {
            h.free(Some(p), "loop", 0);
        }
        assert_eq!(h.allocation_count(), 0);
        assert_eq!(h.allocation_count_peak(), 7);
    }

    #[test]
    fn calloc_zero_fills() {
        let h = fresh();
        let p = h.calloc(100, 2, "file", 1).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 200) };
        assert!(bytes.iter().all(|&b| b == 0));
        h.free(Some(p), "file", 1);
    }

    #[test]
    fn false_free_is_detected_and_does_not_change_count() {
        static SEEN: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
        let h = Heaps::with_error_handler(McHeap::<4096>::new(), |msg, _, _| {
            assert_eq!(msg, "false free");
            SEEN.store(true, core::sync::atomic::Ordering::SeqCst);
        });
        let p = h.alloc(16, "f", 1).unwrap();
        let before = h.allocation_count();
        let bogus = unsafe { NonNull::new_unchecked(p.as_ptr().add(1)) };
        h.free(Some(bogus), "f", 1);
        assert_eq!(h.allocation_count(), before);
        assert!(SEEN.load(core::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn realloc_none_pointer_allocates() {
        let h = fresh();
        let p = h.realloc(None, 32, "f", 1).unwrap();
        assert_eq!(h.allocation_count(), 1);
        h.free(Some(p), "f", 1);
    }

    #[test]
    fn realloc_zero_size_frees_by_default() {
        let h = fresh();
        let p = h.alloc(32, "f", 1).unwrap();
        let r = h.realloc(Some(p), 0, "f", 1);
        assert!(r.is_none());
        assert_eq!(h.allocation_count(), 0);
    }

    #[test]
    fn headroom_never_increases() {
        let h = fresh();
        let p1 = h.alloc(64, "f", 1).unwrap();
        let after_first = h.headroom();
        let p2 = h.alloc(64, "f", 1).unwrap();
        assert!(h.headroom() <= after_first);
        h.free(Some(p1), "f", 1);
        h.free(Some(p2), "f", 1);
        // free() never updates headroom.
        assert!(h.headroom() <= after_first);
    }

    #[test]
    fn report_aggregates_by_call_site() {
        let h = fresh();
        h.alloc(3000, "fileA", 2001).unwrap();
        h.alloc(1000, "fileB", 2002).unwrap();
        h.alloc(1000, "fileB", 2002).unwrap();
        h.alloc(500, "fileC", 2003).unwrap();
        h.alloc(500, "fileC", 2003).unwrap();
        h.alloc(500, "fileC", 2003).unwrap();

        let report = h.report("report-call", 1).expect("report");
        let total_count: usize = report.iter().map(|e| e.count).sum();
        let total_size: usize = report.iter().map(|e| e.size).sum();
        assert_eq!(total_count, h.allocation_count());
        assert_eq!(
            total_size,
            h.allocation_list().map(|i| i.size).sum::<usize>()
        );

        let fc = report.iter().find(|e| e.file == "fileC").unwrap();
        assert_eq!(fc.count, 3);
        assert_eq!(fc.size, 1500);

        report.sort_by(ReportEntry::compare_descending_size);
        assert_eq!(report[0].file, "fileA");

        let array_ptr = unsafe { NonNull::new_unchecked(report.as_mut_ptr() as *mut u8) };
        h.free(Some(array_ptr), "report-call", 1);
    }

    #[test]
    fn realloc_relocation_keeps_live_list_consistent() {
        let h = fresh();
        let a = h.alloc(32, "f", 1).unwrap();
        let b = h.alloc(32, "f", 2).unwrap();
        let c = h.alloc(32, "f", 3).unwrap();
        h.free(Some(a), "f", 1);

        // b has room to grow downward into a's freed hole; the record moves.
        let grown = h.realloc(Some(b), 48, "f", 2).unwrap();
        assert!((grown.as_ptr() as usize) < (b.as_ptr() as usize));

        assert_eq!(h.allocation_count(), 2);
        let walked: std::vec::Vec<_> = h.allocation_list().collect();
        assert_eq!(walked.len(), h.allocation_count());
        assert!(walked.iter().any(|i| i.content == grown && i.size == 48));
        assert!(walked.iter().any(|i| i.content == c));

        h.free(Some(grown), "f", 2);
        h.free(Some(c), "f", 3);
        assert_eq!(h.allocation_count(), 0);
    }
}
