//! A growable array whose buffer lives in a deferred heap.

use crate::handle::Root;
use crate::heap::Heap;

/// A vector over managed storage.
///
/// The buffer is a single heap allocation held through a [`Root`]. Growth
/// allocates a new buffer and clone-constructs the elements across; the old
/// buffer is simply abandoned to the collector, so an outstanding cursor
/// into it keeps it (and its elements) alive until the cursor moves on.
/// Removal is logical: popped elements keep their registered destructors,
/// which run when the slot is constructed over or the buffer is swept.
pub struct Vector<T> {
    buf: Root<T>,
    len: usize,
    cap: usize,
}

impl<T> Vector<T> {
    pub fn new() -> Vector<T> {
        Vector { buf: Root::null(), len: 0, cap: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    fn data(&self) -> *mut T {
        self.buf.get()
    }

    pub fn get(&self, at: usize) -> &T {
        assert!(at < self.len, "index {} out of bounds {}", at, self.len);
        unsafe { &*self.data().add(at) }
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data(), self.len) }
    }

    /// A root-registered cursor at element `at` (`at == len()` gives the
    /// one-past-the-end position). The cursor keeps whatever buffer it
    /// points into alive across growth and collection.
    pub fn iter_at(&self, at: usize) -> Root<T> {
        assert!(at <= self.len, "cursor index {} out of bounds {}", at, self.len);
        let cursor = Root::from_handle(&self.buf);
        if at > 0 {
            cursor.advance(at as isize);
        }
        cursor
    }

    /// Logically remove the last element. Its destructor is validated as
    /// registered but does not run here; it runs when the slot is reused
    /// or the buffer is swept.
    pub fn pop_back(&mut self, heap: &Heap) {
        assert!(self.len > 0, "pop from an empty vector");
        self.len -= 1;
        heap.destroy(unsafe { self.data().add(self.len) } as *const T);
    }
}

impl<T: Clone> Vector<T> {
    pub fn with_capacity(heap: &Heap, cap: usize) -> Vector<T> {
        let mut v = Vector::new();
        if cap > 0 {
            v.grow(heap, cap);
        }
        v
    }

    pub fn push(&mut self, heap: &Heap, value: T) {
        if self.len == self.cap {
            let target = (self.cap * 2).max(4);
            self.grow(heap, target);
        }
        // construct_at destroys whatever a pop left behind on this slot
        // before the new element's lifetime starts
        unsafe { heap.construct_at(self.data().add(self.len), value) };
        self.len += 1;
    }

    fn grow(&mut self, heap: &Heap, new_cap: usize) {
        debug_assert!(new_cap > self.cap);
        let new_buf: Root<T> = heap.allocate(new_cap);
        assert!(!new_buf.is_null(), "vector: allocation failed");
        for at in 0..self.len {
            let value = self.get(at).clone();
            unsafe { heap.construct_at(new_buf.get().add(at), value) };
        }
        // the old buffer and its elements are left for the collector;
        // replacing the root is what makes them unreachable from here
        self.buf = new_buf;
        self.cap = new_cap;
    }
}

impl<T> Default for Vector<T> {
    fn default() -> Vector<T> {
        Vector::new()
    }
}
