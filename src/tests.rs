use std::cell::RefCell;

use crate::alloc::{Set, Vector};
use crate::handle::{Handle, Root};
use crate::heap::Heap;

thread_local! {
    static DROP_LOG: RefCell<Vec<i64>> = const { RefCell::new(Vec::new()) };
}

fn reset_drop_log() {
    DROP_LOG.with(|log| log.borrow_mut().clear());
}

fn drop_log() -> Vec<i64> {
    DROP_LOG.with(|log| log.borrow().clone())
}

fn log_drop(v: i64) {
    DROP_LOG.with(|log| log.borrow_mut().push(v));
}

/// Drop-instrumented value. `probe` builds untracked instances for
/// queries, so lookups don't pollute the drop log; ordering and equality
/// only ever look at `v`.
struct Widget {
    v: i64,
    tracked: bool,
}

impl Widget {
    fn new(v: i64) -> Widget {
        Widget { v, tracked: true }
    }

    fn probe(v: i64) -> Widget {
        Widget { v, tracked: false }
    }
}

impl Clone for Widget {
    fn clone(&self) -> Widget {
        Widget { v: self.v, tracked: self.tracked }
    }
}

impl Drop for Widget {
    fn drop(&mut self) {
        if self.tracked {
            log_drop(self.v);
        }
    }
}

impl PartialEq for Widget {
    fn eq(&self, other: &Widget) -> bool {
        self.v == other.v
    }
}

impl Eq for Widget {}

impl PartialOrd for Widget {
    fn partial_cmp(&self, other: &Widget) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Widget {
    fn cmp(&self, other: &Widget) -> std::cmp::Ordering {
        self.v.cmp(&other.v)
    }
}

/// One-link list/cycle node. By the time any destructor runs, every handle
/// into swept storage has already been nulled, so observing `next` here
/// must never see a stale address.
struct Node {
    id: i64,
    next: Handle<Node>,
}

impl Node {
    fn new(id: i64) -> Node {
        Node { id, next: Handle::null() }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        assert!(self.next.is_null(), "destructor observed a non-null handle into swept storage");
        log_drop(self.id);
    }
}

#[test]
fn simple_cycle_is_reclaimed() {
    reset_drop_log();
    let heap = Heap::new();
    {
        let a = heap.make(Node::new(1));
        let b = heap.make(Node::new(2));
        a.as_ref().next.set(&b);
        b.as_ref().next.set(&a);
    }
    // the cycle is now unreachable; reference counting would leak it
    heap.collect();
    assert_eq!(drop_log(), vec![1, 2]);
    assert_eq!(heap.page_count(), 0);
}

#[test]
fn chain_stays_alive_through_interior_handles() {
    reset_drop_log();
    let heap = Heap::new();
    let a = heap.make(Node::new(1));
    {
        let b = heap.make(Node::new(2));
        let c = heap.make(Node::new(3));
        a.as_ref().next.set(&b);
        b.as_ref().next.set(&c);
    }
    // only `a` is rooted; b and c are reachable through interior handles
    heap.collect();
    assert!(drop_log().is_empty());
    assert_eq!(a.as_ref().next.as_ref().next.as_ref().id, 3);

    drop(a);
    heap.collect();
    assert_eq!(drop_log(), vec![1, 2, 3]);
    assert_eq!(heap.page_count(), 0);
}

#[test]
fn collect_with_no_garbage_is_idempotent() {
    reset_drop_log();
    let heap = Heap::new();
    let a = heap.make(Node::new(1));
    heap.collect();
    heap.collect();
    assert!(drop_log().is_empty());
    assert_eq!(a.as_ref().id, 1);
}

#[test]
fn aliasing_handle_keeps_parent_alive() {
    struct Pair {
        small: i32,
        big: f64,
    }
    impl Drop for Pair {
        fn drop(&mut self) {
            log_drop(i64::from(self.small));
        }
    }

    reset_drop_log();
    let heap = Heap::new();
    let p = heap.make(Pair { small: 7, big: 3.25 });
    let d = p.alias::<f64>(std::mem::offset_of!(Pair, big));
    let d_addr = d.get();

    drop(p);
    heap.collect();
    // the sub-object handle alone keeps the whole Pair alive
    assert!(drop_log().is_empty());
    assert_eq!(d.get(), d_addr);
    assert_eq!(*d.as_ref(), 3.25);

    drop(d);
    heap.collect();
    assert_eq!(drop_log(), vec![7]);
    assert_eq!(heap.page_count(), 0);
}

#[test]
fn array_arithmetic_and_one_past_the_end() {
    let heap = Heap::new();
    let arr = heap.make_array::<u64>(3);
    assert!(!arr.is_null());

    let end = arr.clone();
    end.advance(3); // one past the last element: a defined address
    assert_eq!(end.offset_from(&arr), 3);

    let second = arr.clone();
    second.advance(1);
    assert_eq!(*second.as_ref(), 0);
    second.advance(-1);
    assert_eq!(second.get(), arr.get());

    assert_eq!(arr[2], 0);
    assert_eq!(Handle::<u64>::null().offset_from(&Handle::null()), 0);
}

#[test]
fn make_array_unwinds_built_prefix_in_reverse() {
    use std::cell::Cell;
    thread_local! {
        static BUILT: Cell<i64> = const { Cell::new(0) };
    }

    struct Exploding {
        id: i64,
    }
    impl Default for Exploding {
        fn default() -> Exploding {
            let id = BUILT.with(|c| {
                let id = c.get();
                c.set(id + 1);
                id
            });
            if id == 2 {
                panic!("constructor failure");
            }
            Exploding { id }
        }
    }
    impl Drop for Exploding {
        fn drop(&mut self) {
            log_drop(self.id);
        }
    }

    reset_drop_log();
    let heap = Heap::new();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        heap.make_array::<Exploding>(4)
    }));
    assert!(result.is_err());
    // elements 0 and 1 were built; they are torn down in reverse
    assert_eq!(drop_log(), vec![1, 0]);

    // the raw allocation is unreachable and reclaimed without any
    // destructor running again
    heap.collect();
    assert_eq!(drop_log(), vec![1, 0]);
    assert_eq!(heap.page_count(), 0);
}

#[test]
fn set_cursor_keeps_erased_node_alive() {
    reset_drop_log();
    let heap = Heap::new();
    let mut set = Set::new();
    for v in [2, 1, 3] {
        assert!(set.insert(&heap, Widget::new(v)));
    }
    assert!(!set.insert(&heap, Widget::probe(2)));
    assert_eq!(set.len(), 3);

    let mut cursor = set.first();
    assert_eq!(cursor.value().v, 1);
    let erased_addr = cursor.node_addr();

    assert!(set.erase(&heap, &Widget::probe(1)));
    assert_eq!(set.len(), 2);

    heap.collect();
    // the erased node is unreachable from the tree but the cursor holds it
    assert!(drop_log().is_empty());
    assert_eq!(cursor.value().v, 1);
    assert_eq!(cursor.node_addr(), erased_addr);

    // advancing re-enters the tree…
    cursor.move_next(&set);
    assert_eq!(cursor.value().v, 2);

    // …and now nothing reaches the erased node
    heap.collect();
    assert_eq!(drop_log(), vec![1]);
    assert!(set.contains(&Widget::probe(2)));
    assert!(set.contains(&Widget::probe(3)));
}

#[test]
fn set_erase_with_two_children_splices() {
    reset_drop_log();
    let heap = Heap::new();
    let mut set = Set::new();
    for v in [5, 2, 8, 1, 3, 7, 9] {
        set.insert(&heap, Widget::new(v));
    }
    assert!(set.erase(&heap, &Widget::probe(5)));
    assert_eq!(set.len(), 6);
    for v in [1, 2, 3, 7, 8, 9] {
        assert!(set.contains(&Widget::probe(v)), "lost {}", v);
    }
    assert!(!set.contains(&Widget::probe(5)));

    heap.collect();
    assert_eq!(drop_log(), vec![5]);

    let mut cursor = set.first();
    let mut seen = Vec::new();
    while cursor.is_valid() {
        seen.push(cursor.value().v);
        cursor.move_next(&set);
    }
    assert_eq!(seen, vec![1, 2, 3, 7, 8, 9]);
}

#[test]
fn vector_growth_leaves_old_buffer_to_the_collector() {
    reset_drop_log();
    let heap = Heap::new();
    let mut v = Vector::new();
    for i in 1..=4 {
        v.push(&heap, Widget::new(i));
    }
    let mut iter = v.iter_at(0);
    let old_addr = iter.get();

    // fifth push reallocates from capacity 4 to 8
    v.push(&heap, Widget::new(5));
    assert_eq!(v.capacity(), 8);
    assert_ne!(v.iter_at(0).get(), old_addr);

    heap.collect();
    // the cursor keeps the old buffer (and its elements) alive
    assert!(drop_log().is_empty());
    assert_eq!(iter.as_ref().v, 1);

    // re-seat the cursor into the current buffer
    iter = v.iter_at(0);
    assert_eq!(iter.as_ref().v, 1);
    heap.collect();
    // only the old buffer was swept, in slot order
    assert_eq!(drop_log(), vec![1, 2, 3, 4]);
    assert_eq!(v.len(), 5);
    for i in 1..=5 {
        assert_eq!(v.get(i - 1).v, i as i64);
    }
}

#[test]
fn reused_storage_runs_old_destructor_first() {
    reset_drop_log();
    let heap = Heap::new();
    let mut v = Vector::new();
    v.push(&heap, Widget::new(10));
    let addr = v.iter_at(0).get();

    v.pop_back(&heap); // logical removal: nothing destroyed yet
    assert!(drop_log().is_empty());

    v.push(&heap, Widget::new(11));
    // the old element was destroyed before the new one was constructed,
    // on the same bytes
    assert_eq!(drop_log(), vec![10]);
    assert_eq!(v.iter_at(0).get(), addr);
    assert_eq!(v.get(0).v, 11);
}

#[test]
fn teardown_detaches_handles_before_destructors() {
    struct Obs {
        id: i64,
        other: Handle<Obs>,
    }
    impl Drop for Obs {
        fn drop(&mut self) {
            // positive id means the peer handle was already null
            log_drop(if self.other.is_null() { self.id } else { -self.id });
        }
    }

    reset_drop_log();
    let heap = Heap::new();
    let a = heap.make(Obs { id: 1, other: Handle::null() });
    let b = heap.make(Obs { id: 2, other: Handle::null() });
    a.as_ref().other.set(&b);
    b.as_ref().other.set(&a);

    drop(heap);
    assert_eq!(drop_log(), vec![1, 2]);

    // roots outlive the heap as detached nulls
    assert!(a.is_null());
    assert!(b.is_null());
}

#[test]
fn destructor_runs_at_most_once() {
    reset_drop_log();
    let heap = Heap::new();
    {
        let _w = heap.make(Widget::new(42));
    }
    heap.collect();
    heap.collect();
    drop(heap);
    assert_eq!(drop_log(), vec![42]);
}

#[test]
#[should_panic(expected = "different heaps")]
fn cross_heap_assignment_panics() {
    let h1 = Heap::new();
    let h2 = Heap::new();
    let a = h1.make(1u32);
    let b = h2.make(2u32);
    a.set(&b);
}

#[test]
fn collect_before_expand_reuses_freed_space() {
    let heap = Heap::new();
    heap.set_collect_before_expand(true);
    assert!(heap.get_collect_before_expand());

    let a = heap.make_array::<u64>(600);
    let b = heap.make_array::<u64>(600);
    assert!(!a.is_null() && !b.is_null());
    assert_eq!(heap.page_count(), 1);

    drop(a);
    // the third array does not fit, but one collection frees `a`'s space
    let c = heap.make_array::<u64>(600);
    assert!(!c.is_null());
    assert_eq!(heap.page_count(), 1);
    assert_eq!(*b.as_ref(), 0);
}

#[test]
fn expansion_without_pre_collection_adds_a_page() {
    let heap = Heap::new();
    let a = heap.make_array::<u64>(600);
    let b = heap.make_array::<u64>(600);
    drop(a);
    let c = heap.make_array::<u64>(600);
    assert!(!b.is_null() && !c.is_null());
    assert_eq!(heap.page_count(), 2);
}

#[test]
fn null_root_reports_nothing_allocated() {
    let root: Root<u32> = Root::null();
    assert!(root.is_null());
    let copy = root.clone();
    assert!(copy.is_null());
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "not registered")]
fn destroy_without_construct_panics() {
    let heap = Heap::new();
    let raw: Root<Widget> = heap.allocate(1);
    heap.destroy(raw.get() as *const Widget);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "left the allocation")]
fn arithmetic_cannot_leave_the_allocation() {
    let heap = Heap::new();
    let a = heap.make_array::<u64>(2);
    let b = heap.make_array::<u64>(2);
    assert!(!b.is_null());
    a.advance(20); // far past the reserved one-past-the-end slot
}
