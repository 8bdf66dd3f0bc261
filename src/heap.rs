//! The deferred heap: pages, handle registration, deferred destruction and
//! the mark & sweep collector.
//!
//! Reachability is computed from *handles*, not object layouts: every
//! attached handle is registered with its heap at the handle's own address,
//! either in the root set (the handle lives outside every page) or in the
//! owning page's interior list (the handle lives inside an allocation).
//! Marking walks roots, then repeatedly promotes interior handles level by
//! level until a pass adds nothing: a worklist that needs no auxiliary
//! containers and terminates on cycles.
//!
//! Destruction is deferred: objects constructed through the heap get a
//! type-erased destructor record, and those records run either when the
//! collector sweeps the object, when its storage is re-constructed over, or
//! at heap teardown, exactly once, whichever comes first.

use std::cell::UnsafeCell;
use std::mem::size_of;

use ahash::AHashSet;
use log::debug;

use crate::bitmap::BitSet;
use crate::destructors::DestructorTable;
use crate::handle::{RawHandle, Root};
use crate::page::{ContainsInfo, FindResult, Page, DEFAULT_PAGE_BYTES, MIN_TRACKING_GRAIN};

/// An interior handle record: a handle living inside one of this heap's
/// allocations, plus the marking level used to drive tracing. The level is
/// the distance from some root along whatever path marking took; it is 0
/// between collections.
pub(crate) struct InteriorHandle {
    pub handle: *const RawHandle,
    pub level: usize,
}

/// A page plus the tracing state that goes with it.
pub(crate) struct HeapPage {
    pub page: Page,
    pub live_starts: BitSet,
    pub handles: Vec<InteriorHandle>,
}

impl HeapPage {
    fn new(total_size: usize, min_alloc: usize) -> Option<HeapPage> {
        let page = Page::new(total_size, min_alloc)?;
        let live_starts = BitSet::new(page.locations(), false);
        Some(HeapPage { page, live_starts, handles: Vec::new() })
    }
}

pub(crate) struct HeapInner {
    pages: Vec<Box<HeapPage>>,
    roots: AHashSet<*const RawHandle>,
    dtors: DestructorTable,
    is_destroying: bool,
    collect_before_expand: bool,
}

impl HeapInner {
    /// Track a newly attached handle. Handles stored inside one of our
    /// pages are interior; everything else is a root.
    pub(crate) fn enregister(&mut self, h: *const RawHandle) {
        assert!(
            !self.is_destroying,
            "cannot register a handle on a heap that is being destroyed"
        );
        let addr = h as *const u8;
        if let Some(pg) = self.pages.iter_mut().find(|pg| pg.page.contains(addr)) {
            pg.handles.push(InteriorHandle { handle: h, level: 0 });
        } else {
            self.roots.insert(h);
        }
    }

    /// Forget a handle that is going away. No-op during teardown.
    pub(crate) fn deregister(&mut self, h: *const RawHandle) {
        if self.is_destroying {
            return;
        }
        if self.roots.remove(&h) {
            return;
        }
        // search interior lists from the back: recently added handles
        // dominate short-lived temporaries
        for pg in self.pages.iter_mut() {
            if let Some(at) = pg.handles.iter().rposition(|ih| ih.handle == h) {
                pg.handles.swap_remove(at);
                return;
            }
        }
        debug_assert!(false, "attempt to deregister an unregistered handle");
    }

    /// The page containing `p`, if any, with `p`'s classification on it.
    pub(crate) fn find_page_info(
        &self,
        p: *const u8,
    ) -> Option<(*const HeapPage, ContainsInfo)> {
        for pg in self.pages.iter() {
            let info = pg.page.contains_info(p);
            if info.found != FindResult::NotInRange {
                return Some((&**pg as *const HeapPage, info));
            }
        }
        None
    }

    fn allocate_from_existing<T>(&mut self, n: usize) -> *mut u8 {
        for pg in self.pages.iter_mut() {
            let p = pg.page.allocate::<T>(n);
            if !p.is_null() {
                return p;
            }
        }
        std::ptr::null_mut()
    }

    /// Raw storage for `n` objects of `T`: existing pages first, then an
    /// optional pre-expansion collection, then a fresh page sized from the
    /// type hint. Null only when a new page cannot be created.
    fn allocate_raw<T>(&mut self, n: usize) -> *mut T {
        assert!(n > 0, "cannot request an empty allocation");

        let mut p = self.allocate_from_existing::<T>(n);

        if p.is_null() && self.collect_before_expand {
            self.collect();
            p = self.allocate_from_existing::<T>(n);
        }

        if p.is_null() {
            // big enough for ~3 of these requests, with an 8 KiB floor to
            // amortise per-page metadata; tracking grain follows the
            // element size
            let total = (3 * n * size_of::<T>()).max(DEFAULT_PAGE_BYTES);
            let grain = size_of::<T>().max(MIN_TRACKING_GRAIN);
            let pg = match HeapPage::new(total, grain) {
                Some(pg) => pg,
                None => return std::ptr::null_mut(),
            };
            debug!("heap: new page, {} bytes at {} byte grain", pg.page.total_size(), grain);
            self.pages.push(Box::new(pg));
            p = self.pages.last_mut().expect("page just pushed").page.allocate::<T>(n);
            debug_assert!(!p.is_null(), "fresh page could not satisfy its sizing request");
        }

        p as *mut T
    }

    /// Mark the allocation `handle` points into as live, and queue every
    /// interior handle stored inside that allocation at `level`.
    fn mark(&mut self, handle: *const RawHandle, level: usize) {
        let p = unsafe { (*handle).address() };
        if p.is_null() {
            return;
        }
        for pg in self.pages.iter_mut() {
            let HeapPage { page, live_starts, handles } = &mut **pg;
            let info = page.contains_info(p);
            if info.found == FindResult::NotInRange {
                continue;
            }
            debug_assert!(
                info.found != FindResult::InRangeUnallocated,
                "marked handle points to unallocated memory"
            );
            live_starts.set(info.start_location, true);

            for ih in handles.iter_mut() {
                let at = page.contains_info(ih.handle as *const u8);
                debug_assert!(
                    at.found > FindResult::InRangeUnallocated,
                    "registered interior handle lies in unallocated memory"
                );
                if at.start_location == info.start_location && ih.level == 0 {
                    ih.level = level;
                }
            }
            break;
        }
    }

    pub(crate) fn collect(&mut self) {
        debug!("collect: {} pages, {} roots", self.pages.len(), self.roots.len());

        // 1. reset mark bits and interior handle levels
        for pg in self.pages.iter_mut() {
            pg.live_starts.set_all(false);
            for ih in pg.handles.iter_mut() {
                ih.level = 0;
            }
        }

        // 2. mark everything reachable: roots first, then interior handles
        // level by level until a pass adds nothing. A cycle is entered
        // once; after that every edge into it finds levels already set.
        let roots: Vec<*const RawHandle> = self.roots.iter().copied().collect();
        for h in roots {
            self.mark(h, 1);
        }
        let mut level = 1;
        loop {
            let mut done = true;
            level += 1;
            for pgi in 0..self.pages.len() {
                for ihi in 0..self.pages[pgi].handles.len() {
                    let (lvl, h) = {
                        let ih = &self.pages[pgi].handles[ihi];
                        (ih.level, ih.handle)
                    };
                    if lvl == level - 1 {
                        done = false;
                        self.mark(h, level);
                    }
                }
            }
            if done {
                break;
            }
        }

        // 3. null every unreached interior handle before any destructor
        // runs. This breaks cycles and removes the possibility of
        // resurrection: by the time user destructors see the world, every
        // handle into the swept region is already null. It is also the one
        // place a logically-const handle is written through.
        for pg in self.pages.iter_mut() {
            for ih in pg.handles.iter() {
                if ih.level == 0 {
                    unsafe { (*ih.handle).reset() };
                }
            }
        }

        // 4. destroy and deallocate every unreached allocation, in slot
        // order per page. Everything goes through a raw self pointer: the
        // destructors run user code that re-enters deregistration, so no
        // borrow may be live across a destructor call.
        let this = self as *mut HeapInner;
        let mut destroyed = 0usize;
        let page_total = unsafe { (*this).pages.len() };
        for pgi in 0..page_total {
            let locations = unsafe { (&(*this).pages)[pgi].page.locations() };
            for at in 0..locations {
                let (is_start, live) = unsafe {
                    let pg = &(&(*this).pages)[pgi];
                    (pg.page.location_info(at).is_start, pg.live_starts.get(at))
                };
                if !is_start || live {
                    continue;
                }
                let (start, len) = unsafe {
                    let pg = &(&(*this).pages)[pgi];
                    let next = pg.page.next_start(at + 1);
                    (pg.page.slot_ptr(at), (next - at) * pg.page.min_alloc())
                };
                // run destructors from a local list: a destructor dropping
                // its own handles re-enters deregistration, and must never
                // observe the registry mid-update
                let taken = unsafe { (*this).dtors.take_range(start, len) };
                for rec in &taken {
                    unsafe { (rec.drop_fn)(rec.ptr) };
                }
                unsafe { (&mut (*this).pages)[pgi].page.deallocate(start) };
                destroyed += 1;
            }
        }

        // 5. drop pages that became empty
        let before = self.pages.len();
        self.pages.retain(|pg| {
            if pg.page.is_empty() {
                debug_assert!(
                    pg.handles.is_empty(),
                    "page with no allocations still has interior handles"
                );
                false
            } else {
                true
            }
        });
        debug!(
            "collect: destroyed {} allocations, dropped {} empty pages",
            destroyed,
            before - self.pages.len()
        );
    }
}

/// A deferred-reclamation heap.
///
/// `make` hands out [`Root`] handles; reclamation happens only in
/// [`collect`](Heap::collect) (or at heap teardown), which reclaims cycles
/// and runs ordinary destructors deterministically. The heap is a
/// single-owner, single-thread structure; a process may host any number of
/// independent heaps, and a handle stays bound to the heap it first
/// attached to.
pub struct Heap {
    inner: Box<UnsafeCell<HeapInner>>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            inner: Box::new(UnsafeCell::new(HeapInner {
                pages: Vec::new(),
                roots: AHashSet::default(),
                dtors: DestructorTable::new(),
                is_destroying: false,
                collect_before_expand: false,
            })),
        }
    }

    #[inline]
    fn inner(&self) -> *mut HeapInner {
        self.inner.get()
    }

    /// Allocate and construct one `T`. Returns a null root when the heap
    /// cannot satisfy the request (`value` is dropped in that case).
    pub fn make<T>(&self, value: T) -> Root<T> {
        let inner = self.inner();
        let p = unsafe { (*inner).allocate_raw::<T>(1) };
        if p.is_null() {
            debug!("heap: make of {} bytes failed", size_of::<T>());
            return Root::null();
        }
        unsafe { self.construct_at(p, value) };
        Root::attached(inner, p)
    }

    /// Allocate `n` default-constructed `T`s. Returns a null root on
    /// exhaustion. If a constructor panics mid-array the already-built
    /// prefix is destroyed in reverse order before the panic propagates;
    /// the raw allocation stays behind for the next collection.
    pub fn make_array<T: Default>(&self, n: usize) -> Root<T> {
        assert!(n > 0, "cannot request an empty array");
        let inner = self.inner();
        let p = unsafe { (*inner).allocate_raw::<T>(n) };
        if p.is_null() {
            debug!("heap: make_array of {} x {} bytes failed", n, size_of::<T>());
            return Root::null();
        }

        // reused-storage contract: anything previously constructed on
        // these bytes is destroyed first
        let taken = unsafe { (*inner).dtors.take_range(p as *mut u8, n * size_of::<T>()) };
        for rec in &taken {
            unsafe { (rec.drop_fn)(rec.ptr) };
        }

        struct PartialGuard<T> {
            base: *mut T,
            built: usize,
        }
        impl<T> Drop for PartialGuard<T> {
            fn drop(&mut self) {
                for k in (0..self.built).rev() {
                    unsafe { std::ptr::drop_in_place(self.base.add(k)) };
                }
            }
        }

        let mut guard = PartialGuard { base: p, built: 0 };
        for k in 0..n {
            unsafe { p.add(k).write(T::default()) };
            guard.built = k + 1;
        }
        std::mem::forget(guard);

        unsafe { (*inner).dtors.store(p, n) };
        Root::attached(inner, p)
    }

    /// Allocate raw, unconstructed storage for `n` objects of `T` and hand
    /// back a root to it. The allocator surface used by the managed
    /// containers; the contents are uninitialized until
    /// [`construct_at`](Heap::construct_at) runs, and dereferencing before
    /// then is a contract violation. Deallocation does not exist on this
    /// surface; storage is reclaimed only by [`collect`](Heap::collect).
    pub fn allocate<T>(&self, n: usize) -> Root<T> {
        let inner = self.inner();
        let p = unsafe { (*inner).allocate_raw::<T>(n) };
        if p.is_null() {
            return Root::null();
        }
        Root::attached(inner, p)
    }

    /// Construct `value` at `p`, which must point into this heap.
    ///
    /// Pending destructors covering `[p, p + size_of::<T>())` run *first*,
    /// so object lifetimes on recycled bytes never overlap even though
    /// deallocation is deferred to collection time.
    ///
    /// # Safety
    ///
    /// `p` must be valid, suitably aligned storage obtained from this
    /// heap, not currently aliased by references.
    pub unsafe fn construct_at<T>(&self, p: *mut T, value: T) {
        let inner = self.inner();
        let taken = (*inner).dtors.take_range(p as *mut u8, size_of::<T>());
        for rec in &taken {
            (rec.drop_fn)(rec.ptr);
        }
        p.write(value);
        (*inner).dtors.store(p, 1);
    }

    /// Validate that the object at `p` can be destroyed: its destructor
    /// must be registered (or `T` trivially destructible). The destructor
    /// does *not* run here; it runs when the collector sweeps the object
    /// or its storage is reused. This is what makes it safe for containers
    /// to "free" nodes that outstanding handles still reach.
    pub fn destroy<T>(&self, p: *const T) {
        let inner = self.inner();
        debug_assert!(
            !std::mem::needs_drop::<T>() || unsafe { (*inner).dtors.is_stored(p as *const u8) },
            "attempt to destroy an object whose destructor is not registered"
        );
    }

    /// Trace from the roots, null every unreachable handle, run the
    /// destructors of unreachable objects exactly once, release their
    /// storage, and drop empty pages. Non-interruptible; must not be
    /// entered from a destructor that allocates.
    pub fn collect(&self) {
        unsafe { (*self.inner()).collect() };
    }

    /// When set, a failing allocation runs one collection and retries
    /// existing pages before the heap expands.
    pub fn set_collect_before_expand(&self, enable: bool) {
        unsafe { (*self.inner()).collect_before_expand = enable };
    }

    pub fn get_collect_before_expand(&self) -> bool {
        unsafe { (*self.inner()).collect_before_expand }
    }

    /// Number of live pages.
    pub fn page_count(&self) -> usize {
        unsafe { (*self.inner()).pages.len() }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let inner = self.inner.get();
        unsafe {
            // a destructor may not register new handles from here on
            (*inner).is_destroying = true;

            // detach every registered handle before any destructor runs:
            // destructors may touch other handles and observe null, but
            // never a stale address to an already-destroyed object
            for &h in (*inner).roots.iter() {
                (*h).detach();
            }
            for pg in (*inner).pages.iter() {
                for ih in pg.handles.iter() {
                    (*ih.handle).detach();
                }
            }

            let records = (*inner).dtors.take_all();
            for rec in &records {
                (rec.drop_fn)(rec.ptr);
            }
        }
    }
}
