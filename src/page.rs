//! A page is one contiguous, immovable allocation arena.
//!
//! Storage comes from an anonymous memory map and is divided into
//! `min_alloc`-byte slots. Two bitsets track the slots: `inuse` marks every
//! slot covered by a live allocation, `starts` marks the first slot of each
//! allocation. Between two starts, an allocation is a contiguous `inuse`
//! prefix followed by a free tail, which is what lets deallocation and the
//! sweep recover extents without per-allocation headers.

use memmap2::MmapMut;

use crate::bitmap::BitSet;
use crate::util::{align_usize, units_for};

/// Default page size when the sizing hint is small.
pub const DEFAULT_PAGE_BYTES: usize = 8192;

/// Smallest tracking granularity.
pub const MIN_TRACKING_GRAIN: usize = 4;

/// Anonymous mappings are at least page aligned; allocation alignment
/// requests above this are not supported.
const MAP_ALIGN: usize = 4096;

/// Classification of a pointer against a page, ordered so that
/// `found > InRangeUnallocated` means "points into a live allocation".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FindResult {
    NotInRange = 0,
    InRangeUnallocated,
    InRangeAllocatedMiddle,
    InRangeAllocatedStart,
}

/// Result of [`Page::contains_info`]: where the pointer landed, its slot,
/// and the start slot of the allocation covering it (when allocated).
#[derive(Clone, Copy, Debug)]
pub struct ContainsInfo {
    pub found: FindResult,
    pub location: usize,
    pub start_location: usize,
}

/// Result of [`Page::location_info`].
#[derive(Clone, Copy, Debug)]
pub struct LocationInfo {
    pub is_start: bool,
    pub pointer: *mut u8,
}

pub struct Page {
    total_size: usize,
    min_alloc: usize,
    storage: MmapMut,
    inuse: BitSet,
    starts: BitSet,
    /// Upper bound on the largest request (in bytes) that could possibly
    /// succeed on this page. Never an under-estimate.
    request_bound: usize,
}

impl Page {
    /// Create a page of (at least) `total_size` bytes tracked at `min_alloc`
    /// granularity. The size is rounded up to a slot multiple. Returns
    /// `None` when the mapping cannot be created.
    pub fn new(total_size: usize, min_alloc: usize) -> Option<Page> {
        assert!(min_alloc > 0, "tracking granularity must be non-zero");
        assert!(total_size > 0, "page size must be non-zero");
        let total_size = align_usize(total_size, min_alloc);
        let storage = match MmapMut::map_anon(total_size) {
            Ok(map) => map,
            Err(err) => {
                log::warn!("page: anonymous mapping of {} bytes failed: {}", total_size, err);
                return None;
            }
        };
        let locations = total_size / min_alloc;
        Some(Page {
            total_size,
            min_alloc,
            storage,
            inuse: BitSet::new(locations, false),
            starts: BitSet::new(locations, false),
            request_bound: total_size,
        })
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    #[inline]
    pub fn min_alloc(&self) -> usize {
        self.min_alloc
    }

    /// Number of tracked slots.
    #[inline]
    pub fn locations(&self) -> usize {
        self.total_size / self.min_alloc
    }

    /// The storage range as raw addresses.
    pub fn extent(&self) -> std::ops::Range<*const u8> {
        let base = self.base();
        base as *const u8..(base + self.total_size) as *const u8
    }

    #[inline]
    fn base(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    /// Address of slot `at`.
    #[inline]
    pub(crate) fn slot_ptr(&self, at: usize) -> *mut u8 {
        debug_assert!(at <= self.locations());
        (self.base() + at * self.min_alloc) as *mut u8
    }

    /// First start slot at or after `from`, or `locations()` if none.
    #[inline]
    pub(crate) fn next_start(&self, from: usize) -> usize {
        self.starts.find_next(from, self.locations(), true)
    }

    /// True iff the page holds no allocations.
    pub fn is_empty(&self) -> bool {
        let ret = self.inuse.all_false();
        debug_assert!(
            !ret || self.starts.all_false(),
            "page with no inuse slots still has allocation starts"
        );
        ret
    }

    /// Allocate space for `n` objects of type `T`, or null.
    ///
    /// Every allocation reserves one slot past its payload so that
    /// one-past-the-end addresses stay inside the same allocation record.
    pub fn allocate<T>(&mut self, n: usize) -> *mut u8 {
        assert!(n > 0, "cannot request an empty allocation");
        let size = std::mem::size_of::<T>();
        assert!(size > 0, "zero-sized allocations are not supported");
        let bytes_needed = size.checked_mul(n).expect("allocation size overflow");

        // fast reject: this page is known to be unable to satisfy the request
        if bytes_needed > self.request_bound {
            return std::ptr::null_mut();
        }

        let align = std::mem::align_of::<T>();
        debug_assert!(align <= MAP_ALIGN, "unsupported allocation alignment {}", align);

        // the mapping is MAP_ALIGN-aligned, so the first aligned address is
        // the base itself unless min_alloc breaks the stepping below
        let aligned = align_usize(self.base(), align);
        let first_slot = (aligned - self.base()) / self.min_alloc;

        // slot stride that preserves alignment, and slots needed including
        // the one-past-the-end reservation
        let step = 1 + (align - 1) / self.min_alloc;
        let needed = units_for(bytes_needed, self.min_alloc) + 1;

        // the request cannot fit the slot count at all: reject without
        // touching the cached bound, which only tracks failed scans
        let end = match self.locations().checked_sub(needed) {
            Some(end) => end,
            None => return std::ptr::null_mut(),
        };

        // first-fit scan over `inuse`, jumping past the first occupied slot
        // of a failed candidate before resuming alignment-stepped probing
        let mut at = first_slot;
        let found = loop {
            if at >= end {
                break None;
            }
            let occupied = self.inuse.find_next(at, at + needed, true);
            if occupied == at + needed {
                // free run found; candidate must still satisfy alignment
                // (slot stride only guarantees it when min_alloc divides
                // the alignment or vice versa)
                if (self.base() + at * self.min_alloc) % align == 0 {
                    break Some(at);
                }
                at += step;
            } else {
                let skip = occupied - at;
                at += (skip / step + 1) * step;
            }
        };

        let at = match found {
            Some(at) => at,
            None => {
                // remember that this request size cannot be satisfied
                self.request_bound = self.request_bound.min(bytes_needed - 1);
                return std::ptr::null_mut();
            }
        };

        self.starts.set(at, true);
        self.inuse.set_range(at, at + needed, true);
        self.request_bound = self.request_bound.saturating_sub(self.min_alloc * needed);
        self.slot_ptr(at)
    }

    /// Whether `p` points into this page's storage.
    #[inline]
    pub fn contains(&self, p: *const u8) -> bool {
        // address comparison is well defined across unrelated pointers
        let addr = p as usize;
        addr >= self.base() && addr < self.base() + self.total_size
    }

    /// Classify `p` against this page's allocations.
    pub fn contains_info(&self, p: *const u8) -> ContainsInfo {
        if !self.contains(p) {
            return ContainsInfo { found: FindResult::NotInRange, location: 0, start_location: 0 };
        }

        let location = (p as usize - self.base()) / self.min_alloc;
        if !self.inuse.get(location) {
            return ContainsInfo { found: FindResult::InRangeUnallocated, location, start_location: 0 };
        }

        if !self.starts.get(location) {
            // walk back to the start of the covering allocation
            let mut start = location;
            loop {
                debug_assert!(start > 0, "no start slot for an inuse location");
                start -= 1;
                if self.starts.get(start) {
                    break;
                }
            }
            return ContainsInfo { found: FindResult::InRangeAllocatedMiddle, location, start_location: start };
        }

        ContainsInfo { found: FindResult::InRangeAllocatedStart, location, start_location: location }
    }

    /// Whether an allocation starts at slot `at`, and the slot's address.
    pub fn location_info(&self, at: usize) -> LocationInfo {
        LocationInfo { is_start: self.starts.get(at), pointer: self.slot_ptr(at) }
    }

    /// Release the allocation that starts at `p`.
    ///
    /// `p` must be a pointer previously returned by [`Page::allocate`] whose
    /// allocation is still live.
    pub fn deallocate(&mut self, p: *mut u8) {
        assert!(self.contains(p), "deallocate: pointer out of range");
        let here = (p as usize - self.base()) / self.min_alloc;
        assert!(self.starts.get(here), "deallocate: not the start of an allocation");
        assert!(self.inuse.get(here), "deallocate: location is not in use");

        self.starts.set(here, false);

        // the allocation's inuse run ends at the first free slot, bounded by
        // the next allocation's start
        let bound = self.next_start(here + 1);
        let end = self.inuse.find_next(here, bound, false);
        self.inuse.set_range(here, end, false);

        // spill the cached bound; a precise update would mean re-measuring
        // the hole
        self.request_bound = self.total_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn allocate_then_deallocate_restores_state() {
        let mut page = Page::new(1024, 4).unwrap();
        assert!(page.is_empty());
        let locations = page.locations();

        let p = page.allocate::<u64>(1);
        assert!(!p.is_null());
        assert!(!page.is_empty());
        let info = page.contains_info(p);
        assert_eq!(info.found, FindResult::InRangeAllocatedStart);

        page.deallocate(p);
        assert!(page.is_empty());
        assert_eq!(page.locations(), locations);
        for at in 0..locations {
            assert!(!page.location_info(at).is_start);
        }
        // the cached bound was spilled back to the page size
        assert!(!page.allocate::<u64>(1).is_null());
    }

    #[test]
    fn consecutive_allocations_do_not_overlap() {
        let mut page = Page::new(4096, 4).unwrap();
        let a = page.allocate::<u64>(4);
        let b = page.allocate::<u64>(4);
        assert!(!a.is_null() && !b.is_null());

        // 32 payload bytes -> 8 slots, plus the one-past-the-end slot
        let needed = (32 / 4 + 1) * 4;
        assert!((b as usize).saturating_sub(a as usize) >= needed);
    }

    #[test]
    fn one_past_the_end_stays_in_page() {
        let mut page = Page::new(1024, 8).unwrap();
        let p = page.allocate::<u64>(1);
        assert!(!p.is_null());
        let past = unsafe { p.add(8) };
        assert!(page.contains(past));
        assert!(page.extent().contains(&(past as *const u8)));
        let info = page.contains_info(past);
        assert_eq!(info.found, FindResult::InRangeAllocatedMiddle);
        assert_eq!(info.start_location, page.contains_info(p).start_location);
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut page = Page::new(256, 4).unwrap();
        // larger than the page: immediate fast reject
        assert!(page.allocate::<u8>(4096).is_null());
        // fits the page size but not the slot count once the reserved
        // one-past-the-end slot is added: the failed scan clamps the bound
        assert!(page.allocate::<u8>(250).is_null());
        assert!(page.allocate::<u8>(250).is_null());
        // smaller requests still succeed
        assert!(!page.allocate::<u8>(8).is_null());
    }

    #[test]
    fn middle_pointer_walks_back_to_start() {
        let mut page = Page::new(1024, 4).unwrap();
        let p = page.allocate::<u32>(10);
        let start = page.contains_info(p).start_location;
        for k in 1..10 {
            let q = unsafe { p.add(k * 4) };
            let info = page.contains_info(q);
            assert_eq!(info.found, FindResult::InRangeAllocatedMiddle);
            assert_eq!(info.start_location, start);
        }
    }

    #[test]
    fn reuses_freed_space() {
        let mut page = Page::new(256, 4).unwrap();
        let a = page.allocate::<u32>(8);
        let b = page.allocate::<u32>(8);
        assert!(!a.is_null() && !b.is_null());
        page.deallocate(a);
        let c = page.allocate::<u32>(8);
        assert_eq!(a, c);
    }

    #[test]
    fn random_allocate_deallocate_stress() {
        let mut rng = StdRng::seed_from_u64(0x1eaf);
        let mut page = Page::new(8192, 4).unwrap();
        let mut live: Vec<(*mut u8, usize)> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let n = rng.gen_range(1..32);
                let p = page.allocate::<u32>(n);
                if !p.is_null() {
                    // no overlap with any live allocation
                    let bytes = n * 4;
                    for &(q, qb) in &live {
                        let (ps, pe) = (p as usize, p as usize + bytes);
                        let (qs, qe) = (q as usize, q as usize + qb);
                        assert!(pe <= qs || qe <= ps, "overlapping allocations");
                    }
                    live.push((p, bytes));
                }
            } else {
                let victim = rng.gen_range(0..live.len());
                let (p, _) = live.swap_remove(victim);
                page.deallocate(p);
            }
        }

        for (p, _) in live.drain(..) {
            page.deallocate(p);
        }
        assert!(page.is_empty());
    }

    #[test]
    #[should_panic(expected = "empty allocation")]
    fn zero_count_is_rejected() {
        let mut page = Page::new(256, 4).unwrap();
        page.allocate::<u32>(0);
    }
}
