//! Process-convenience global heap.
//!
//! One lazily created [`Heap`] per thread, for users who want a single
//! shared heap without threading one through their call graph. Nothing in
//! the crate depends on it: any number of independent [`Heap`] instances
//! can coexist, and a handle is forever bound to the heap it first attached
//! to.

use crate::heap::Heap;

thread_local! {
    static GLOBAL_HEAP: Heap = Heap::new();
}

/// Run `f` against this thread's global heap.
pub fn with_global_heap<R>(f: impl FnOnce(&Heap) -> R) -> R {
    GLOBAL_HEAP.with(|heap| f(heap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_heap_allocates() {
        let value = with_global_heap(|heap| {
            let p = heap.make(41u32);
            *p.as_ref() + 1
        });
        assert_eq!(value, 42);
        with_global_heap(|heap| heap.collect());
    }

    #[test]
    fn independent_heaps_coexist_with_global() {
        let local = Heap::new();
        let a = local.make(7u8);
        with_global_heap(|heap| {
            let b = heap.make(9u8);
            assert_ne!(a.get(), b.get());
        });
        local.collect();
        assert_eq!(*a.as_ref(), 7);
    }
}
