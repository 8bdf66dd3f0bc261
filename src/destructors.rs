//! Registry of pending destructors.
//!
//! One record per live object that needs dropping: the object's address and
//! a monomorphised drop shim (a plain function pointer, no boxing). Records
//! are *taken out* of the registry before they run, so a destructor that
//! re-enters the heap never observes the registry mid-update, and no
//! destructor can run twice.

use std::mem::needs_drop;

pub(crate) struct DestructorRecord {
    pub ptr: *mut u8,
    pub drop_fn: unsafe fn(*mut u8),
}

unsafe fn drop_in_place_shim<T>(p: *mut u8) {
    std::ptr::drop_in_place(p as *mut T);
}

#[derive(Default)]
pub(crate) struct DestructorTable {
    records: Vec<DestructorRecord>,
}

impl DestructorTable {
    pub fn new() -> DestructorTable {
        DestructorTable { records: Vec::new() }
    }

    /// Record destructors for `n` consecutive objects of type `T` starting
    /// at `p`. Trivially destructible types store nothing.
    pub fn store<T>(&mut self, p: *mut T, n: usize) {
        debug_assert!(n > 0, "no object to register for destruction");
        if !needs_drop::<T>() {
            return;
        }
        for k in 0..n {
            self.records.push(DestructorRecord {
                ptr: unsafe { p.add(k) } as *mut u8,
                drop_fn: drop_in_place_shim::<T>,
            });
        }
    }

    /// Whether a destructor is recorded for the object at `p`.
    pub fn is_stored(&self, p: *const u8) -> bool {
        self.records.iter().any(|rec| rec.ptr as *const u8 == p)
    }

    /// Remove and return every record whose address lies in
    /// `[lo, lo + len)`. Removal swap-pops, so it is amortised O(1) per
    /// record; callers run the returned records after this borrow ends.
    pub fn take_range(&mut self, lo: *mut u8, len: usize) -> Vec<DestructorRecord> {
        let mut taken = Vec::new();
        if len == 0 {
            return taken;
        }
        let lo = lo as usize;
        let hi = lo + len;
        let mut i = 0;
        while i < self.records.len() {
            let at = self.records[i].ptr as usize;
            if lo <= at && at < hi {
                taken.push(self.records.swap_remove(i));
            } else {
                i += 1;
            }
        }
        taken
    }

    /// Remove and return every record. Teardown path.
    pub fn take_all(&mut self) -> Vec<DestructorRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
