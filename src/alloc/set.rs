//! An ordered set of managed nodes.
//!
//! An unbalanced binary search tree: each node is its own heap allocation,
//! linked through interior handles. Erasure only *unlinks*: the node's
//! storage and destructor wait for the collector, so a cursor left on an
//! erased node keeps it alive and readable until the cursor is re-seated.

use std::cmp::Ordering;

use crate::handle::{Handle, Root};
use crate::heap::Heap;

struct SetNode<T> {
    value: T,
    left: Handle<SetNode<T>>,
    right: Handle<SetNode<T>>,
}

/// An ordered set over managed nodes.
pub struct Set<T> {
    root: Root<SetNode<T>>,
    len: usize,
}

impl<T> Set<T> {
    pub fn new() -> Set<T> {
        Set { root: Root::null(), len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a fresh root handle at node `p`.
    fn root_to(&self, p: *mut SetNode<T>) -> Root<SetNode<T>> {
        Root::attached(self.root.raw().heap(), p)
    }

    /// Point the handle slot that leads to `parent`'s child (or the tree
    /// root) at whatever `h` points at.
    fn replace_child(&self, parent: *mut SetNode<T>, left_side: bool, h: &Handle<SetNode<T>>) {
        if parent.is_null() {
            self.root.set(h);
        } else if left_side {
            unsafe { (*parent).left.set(h) };
        } else {
            unsafe { (*parent).right.set(h) };
        }
    }

    /// Cursor at the smallest element, or an invalid cursor when empty.
    pub fn first(&self) -> Cursor<T> {
        if self.root.is_null() {
            return Cursor { node: Root::null() };
        }
        let mut cur = self.root.get();
        loop {
            let node = unsafe { &*cur };
            if node.left.is_null() {
                break;
            }
            cur = node.left.get();
        }
        Cursor { node: self.root_to(cur) }
    }
}

impl<T: Ord> Set<T> {
    pub fn insert(&mut self, heap: &Heap, value: T) -> bool {
        if self.root.is_null() {
            let node = heap.make(SetNode { value, left: Handle::null(), right: Handle::null() });
            assert!(!node.is_null(), "set: allocation failed");
            self.root.set(&node);
            self.len += 1;
            return true;
        }

        let mut cur = self.root.get();
        loop {
            let node = unsafe { &*cur };
            match value.cmp(&node.value) {
                Ordering::Equal => return false,
                Ordering::Less => {
                    if node.left.is_null() {
                        let fresh = heap
                            .make(SetNode { value, left: Handle::null(), right: Handle::null() });
                        assert!(!fresh.is_null(), "set: allocation failed");
                        node.left.set(&fresh);
                        self.len += 1;
                        return true;
                    }
                    cur = node.left.get();
                }
                Ordering::Greater => {
                    if node.right.is_null() {
                        let fresh = heap
                            .make(SetNode { value, left: Handle::null(), right: Handle::null() });
                        assert!(!fresh.is_null(), "set: allocation failed");
                        node.right.set(&fresh);
                        self.len += 1;
                        return true;
                    }
                    cur = node.right.get();
                }
            }
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        let mut cur = if self.root.is_null() { return false } else { self.root.get() };
        loop {
            let node = unsafe { &*cur };
            match value.cmp(&node.value) {
                Ordering::Equal => return true,
                Ordering::Less => {
                    if node.left.is_null() {
                        return false;
                    }
                    cur = node.left.get();
                }
                Ordering::Greater => {
                    if node.right.is_null() {
                        return false;
                    }
                    cur = node.right.get();
                }
            }
        }
    }

    /// Unlink the node holding `value`. The node's storage and destructor
    /// are left to the collector; an outstanding cursor on it keeps it
    /// alive.
    pub fn erase(&mut self, heap: &Heap, value: &T) -> bool {
        if self.root.is_null() {
            return false;
        }

        let mut parent: *mut SetNode<T> = std::ptr::null_mut();
        let mut left_side = false;
        let mut cur = self.root.get();
        loop {
            let node = unsafe { &*cur };
            match value.cmp(&node.value) {
                Ordering::Equal => break,
                Ordering::Less => {
                    if node.left.is_null() {
                        return false;
                    }
                    parent = cur;
                    left_side = true;
                    cur = node.left.get();
                }
                Ordering::Greater => {
                    if node.right.is_null() {
                        return false;
                    }
                    parent = cur;
                    left_side = false;
                    cur = node.right.get();
                }
            }
        }

        // release is validation only: the node's destructor stays
        // registered and runs when the collector sweeps it
        heap.destroy(cur as *const SetNode<T>);

        let node = unsafe { &*cur };
        if node.left.is_null() {
            let replacement = Root::from_handle(&node.right);
            self.replace_child(parent, left_side, &replacement);
        } else if node.right.is_null() {
            let replacement = Root::from_handle(&node.left);
            self.replace_child(parent, left_side, &replacement);
        } else {
            // two children: splice the in-order successor into this spot
            let mut succ_parent = cur;
            let mut succ = node.right.get();
            loop {
                let s = unsafe { &*succ };
                if s.left.is_null() {
                    break;
                }
                succ_parent = succ;
                succ = s.left.get();
            }
            // keep the successor reachable while it is unlinked
            let succ_root = self.root_to(succ);
            let succ_node = unsafe { &*succ };
            if succ_parent != cur {
                unsafe { (*succ_parent).left.set(&succ_node.right) };
                succ_node.right.set(&node.right);
            }
            succ_node.left.set(&node.left);
            self.replace_child(parent, left_side, &succ_root);
        }

        self.len -= 1;
        true
    }
}

impl<T> Default for Set<T> {
    fn default() -> Set<T> {
        Set::new()
    }
}

/// A re-seatable cursor over a [`Set`].
///
/// Holds its node through a root handle, so the node survives collection
/// even after being erased from the tree; advancing searches the tree for
/// the in-order successor by value, which re-enters the tree even from an
/// unlinked node.
pub struct Cursor<T> {
    node: Root<SetNode<T>>,
}

impl<T> Cursor<T> {
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.node.is_null()
    }

    pub fn value(&self) -> &T {
        &self.node.as_ref().value
    }

    /// Address identity of the current node, for aliasing checks.
    pub fn node_addr(&self) -> *const () {
        self.node.get() as *const ()
    }
}

impl<T: Ord> Cursor<T> {
    /// Advance to the in-order successor of the current value, or
    /// invalidate the cursor when there is none.
    pub fn move_next(&mut self, set: &Set<T>) {
        assert!(self.is_valid(), "advancing an invalid cursor");
        let current: *const T = &self.node.as_ref().value;

        let mut succ: *mut SetNode<T> = std::ptr::null_mut();
        let mut cur = if set.root.is_null() { std::ptr::null_mut() } else { set.root.get() };
        while !cur.is_null() {
            let node = unsafe { &*cur };
            let probe = unsafe { &*current };
            if probe < &node.value {
                succ = cur;
                cur = node.left.get();
            } else {
                cur = node.right.get();
            }
        }

        if succ.is_null() {
            self.node.reset();
        } else {
            let target = set.root_to(succ);
            self.node.set(&target);
        }
    }

    /// Re-seat the cursor on the set's smallest element.
    pub fn move_to_first(&mut self, set: &Set<T>) {
        let first = set.first();
        self.node.set(&first.node);
    }
}
