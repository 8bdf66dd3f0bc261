//! Registered, heap-bound pointers.
//!
//! [`RawHandle`] is the untyped pointer the heap tracks: the address of the
//! handle itself is what gets registered, because tracing walks *handles*,
//! not object graphs. [`Handle<T>`] is its typed, zero-cost wrapper and the
//! only pointer users ever see into the heap. [`Root<T>`] boxes a handle so
//! it has a stable address outside every page, which is what makes it a
//! root.
//!
//! A handle has two states:
//!
//! - *unattached*: heap and address are both null. Unattached handles are
//!   not registered and may be moved freely; this is the state of
//!   [`Handle::null`] and of handle fields inside freshly constructed
//!   objects.
//! - *attached*: the heap pointer is set and the handle is registered at
//!   its current address. Attachment is sticky: an attached handle may only
//!   be re-pointed from handles into the same heap (or nulled), never into
//!   a different heap, and it must not be moved. The crate's API upholds
//!   the no-move rule structurally: attachment only ever happens in place,
//!   through [`Handle::set`] on a handle that already lives at its final
//!   address (inside a page, or inside a [`Root`] box).
//!
//! The collector nulls unreachable handles through `&self`; the interior
//! mutability below is the sanctioned exception that lets a logically
//! immutable handle be cleared while cycles are broken.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use crate::heap::HeapInner;
#[cfg(debug_assertions)]
use crate::page::FindResult;

pub struct RawHandle {
    heap: Cell<*mut HeapInner>,
    ptr: Cell<*mut u8>,
}

impl RawHandle {
    pub const fn null() -> RawHandle {
        RawHandle { heap: Cell::new(std::ptr::null_mut()), ptr: Cell::new(std::ptr::null_mut()) }
    }

    #[inline]
    pub fn address(&self) -> *mut u8 {
        self.ptr.get()
    }

    #[inline]
    pub(crate) fn heap(&self) -> *mut HeapInner {
        self.heap.get()
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        !self.heap.get().is_null()
    }

    /// Null the address, keeping the attachment (and the registration) so
    /// the handle can be re-pointed later.
    #[inline]
    pub fn reset(&self) {
        self.ptr.set(std::ptr::null_mut());
    }

    /// Attach a freshly placed, unattached handle and register it.
    pub(crate) fn attach(&self, heap: *mut HeapInner, ptr: *mut u8) {
        debug_assert!(!heap.is_null());
        debug_assert!(!self.is_attached(), "handle is already attached");
        self.heap.set(heap);
        self.ptr.set(ptr);
        unsafe { (*heap).enregister(self) };
    }

    /// Used at heap teardown: zero both fields without deregistering, so
    /// destructors observe null handles and later drops are no-ops.
    pub(crate) fn detach(&self) {
        self.ptr.set(std::ptr::null_mut());
        self.heap.set(std::ptr::null_mut());
    }

    /// Copy-assignment. Assigning from an unattached (null) handle nulls
    /// the address; assigning from an attached handle adopts its address
    /// and lazily attaches this handle to the same heap.
    pub fn assign(&self, that: &RawHandle) {
        let that_heap = that.heap.get();
        if that_heap.is_null() {
            debug_assert!(that.ptr.get().is_null(), "unattached handle must be null");
            // keep our own attachment so we can be assigned again
            self.reset();
        } else {
            let my_heap = self.heap.get();
            assert!(
                my_heap.is_null() || my_heap == that_heap,
                "cannot assign handles into different heaps"
            );
            self.ptr.set(that.ptr.get());
            if my_heap.is_null() {
                self.heap.set(that_heap);
                unsafe { (*that_heap).enregister(self) };
            }
        }
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        let heap = self.heap.get();
        if !heap.is_null() {
            // no-op if the heap is tearing down
            unsafe { (*heap).deregister(self) };
        }
    }
}

impl fmt::Pointer for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr.get())
    }
}

/// Typed handle into a [`Heap`](crate::Heap).
///
/// See the module documentation for the attachment rules. Dereferencing
/// requires a non-null address but performs no liveness check: between
/// collections every reachable address is stable, and the single-threaded
/// cooperative model is the caller's contract.
#[repr(transparent)]
pub struct Handle<T> {
    raw: RawHandle,
    _marker: PhantomData<*mut T>,
}

impl<T> Handle<T> {
    /// An unattached null handle. The only way to conjure a handle out of
    /// thin air; every attached handle descends from a heap allocation.
    pub const fn null() -> Handle<T> {
        Handle { raw: RawHandle::null(), _marker: PhantomData }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.raw.address().is_null()
    }

    #[inline]
    pub fn get(&self) -> *mut T {
        self.raw.address() as *mut T
    }

    #[inline]
    pub(crate) fn raw(&self) -> &RawHandle {
        &self.raw
    }

    /// Point this handle at whatever `that` points at. Cross-heap
    /// assignment is a precondition violation.
    #[inline]
    pub fn set(&self, that: &Handle<T>) {
        self.raw.assign(&that.raw);
    }

    /// Null the address, keeping the attachment.
    #[inline]
    pub fn reset(&self) {
        self.raw.reset();
    }

    /// Shared reference to the pointee.
    #[inline]
    pub fn as_ref(&self) -> &T {
        debug_assert!(!self.is_null(), "attempt to dereference null");
        unsafe { &*self.get() }
    }

    /// Mutable reference to the pointee.
    ///
    /// Single-threaded cooperative use only: the caller must not hold
    /// another reference to the same object across this call.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn as_mut(&self) -> &mut T {
        debug_assert!(!self.is_null(), "attempt to dereference null");
        unsafe { &mut *self.get() }
    }

    /// Move this handle `offset` elements within its allocation.
    ///
    /// Staying inside the allocation is a precondition, checked in debug
    /// builds against the owning page; the one-past-the-end address is
    /// always legal thanks to the page's reserved trailing slot.
    pub fn advance(&self, offset: isize) {
        #[cfg(debug_assertions)]
        self.check_arithmetic(offset);
        let bytes = offset * std::mem::size_of::<T>() as isize;
        self.raw.ptr.set((self.raw.address() as isize + bytes) as *mut u8);
    }

    /// Element-count difference between two handles into the same
    /// allocation. Two equal handles (including two nulls) give 0.
    pub fn offset_from(&self, that: &Handle<T>) -> isize {
        if self.get() == that.get() {
            return 0;
        }
        #[cfg(debug_assertions)]
        self.check_difference(that);
        (self.raw.address() as isize - that.raw.address() as isize)
            / std::mem::size_of::<T>() as isize
    }

    /// Derive a handle to a sub-object at `byte_offset` inside the pointee.
    ///
    /// The derived handle registers independently and classifies as an
    /// interior address of the same allocation, so it keeps the whole
    /// allocation alive on its own.
    pub fn alias<U>(&self, byte_offset: usize) -> Root<U> {
        assert!(
            self.raw.is_attached() && !self.is_null(),
            "cannot alias an unattached or null handle"
        );
        let target = (self.raw.address() as usize + byte_offset) as *mut U;
        #[cfg(debug_assertions)]
        {
            let heap = self.raw.heap();
            let this = unsafe { (*heap).find_page_info(self.raw.address()) };
            let that = unsafe { (*heap).find_page_info(target as *const u8) };
            let (this, that) = (this.expect("corrupt handle"), that.expect("alias left the page"));
            debug_assert!(std::ptr::eq(this.0, that.0), "alias left the page");
            debug_assert!(
                that.1.found > FindResult::InRangeUnallocated
                    && that.1.start_location == this.1.start_location,
                "alias left the allocation"
            );
        }
        Root::attached(self.raw.heap(), target)
    }

    #[cfg(debug_assertions)]
    fn check_arithmetic(&self, offset: isize) {
        assert!(!self.is_null(), "handle arithmetic on a null handle");
        let heap = self.raw.heap();
        assert!(!heap.is_null(), "handle arithmetic on an unattached handle");

        let p = self.raw.address();
        let (this_page, this) =
            unsafe { (*heap).find_page_info(p) }.expect("corrupt handle: not in any page");
        assert!(
            this.found > FindResult::InRangeUnallocated,
            "corrupt handle: points to unallocated memory"
        );

        let temp = (p as isize + offset * std::mem::size_of::<T>() as isize) as *const u8;
        let (temp_page, temp) =
            unsafe { (*heap).find_page_info(temp) }.expect("handle arithmetic left the page");
        assert!(std::ptr::eq(this_page, temp_page), "handle arithmetic left the page");

        // from the start of an allocation, forming the address one past a
        // single element is always legal; otherwise source and target must
        // lie in the same allocation, which the reserved trailing slot
        // extends to one-past-the-end
        assert!(
            (this.found == FindResult::InRangeAllocatedStart && (offset == 0 || offset == 1))
                || (temp.start_location == this.start_location
                    && temp.found > FindResult::InRangeUnallocated),
            "handle arithmetic left the allocation"
        );
    }

    #[cfg(debug_assertions)]
    fn check_difference(&self, that: &Handle<T>) {
        assert!(
            !self.is_null() && !that.is_null(),
            "cannot subtract handles when one is null"
        );
        let heap = self.raw.heap();
        let (this_page, this) = unsafe { (*heap).find_page_info(self.raw.address()) }
            .expect("corrupt handle: not in any page");
        let (that_page, that_info) = unsafe { (*heap).find_page_info(that.raw.address()) }
            .expect("corrupt handle: not in any page");
        assert!(std::ptr::eq(this_page, that_page), "handle subtraction across pages");
        assert!(
            that_info.found > FindResult::InRangeUnallocated
                && this.found > FindResult::InRangeUnallocated,
            "corrupt handle: points to unallocated memory"
        );
        assert!(
            (that_info.found == FindResult::InRangeAllocatedStart
                && self.raw.address() as usize
                    == that.raw.address() as usize + std::mem::size_of::<T>())
                || that_info.start_location == this.start_location,
            "handle subtraction across allocations"
        );
    }
}

impl<T> std::ops::Index<usize> for Handle<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        #[cfg(debug_assertions)]
        self.check_arithmetic(index as isize);
        unsafe { &*self.get().add(index) }
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Handle<T> {
        Handle::null()
    }
}

impl<T> fmt::Pointer for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.get())
    }
}

/// An owning, movable wrapper around a boxed [`Handle`].
///
/// The box gives the handle a stable address outside every page, so an
/// attached `Root` registers as a *root* of its heap; the wrapper itself
/// can move freely. This is what [`Heap::make`](crate::Heap::make) returns
/// and what container cursors are made of.
pub struct Root<T> {
    inner: Box<Handle<T>>,
}

impl<T> Root<T> {
    /// An unattached null root.
    pub fn null() -> Root<T> {
        Root { inner: Box::new(Handle::null()) }
    }

    /// Register a fresh root for an address inside `heap`. The handle is
    /// attached only after the box pins it.
    pub(crate) fn attached(heap: *mut HeapInner, ptr: *mut T) -> Root<T> {
        let root = Root::null();
        root.inner.raw.attach(heap, ptr as *mut u8);
        root
    }

    /// A new root pointing at whatever `handle` points at.
    pub fn from_handle(handle: &Handle<T>) -> Root<T> {
        let root = Root::null();
        root.inner.set(handle);
        root
    }
}

impl<T> Clone for Root<T> {
    fn clone(&self) -> Root<T> {
        Root::from_handle(&self.inner)
    }
}

impl<T> Default for Root<T> {
    fn default() -> Root<T> {
        Root::null()
    }
}

impl<T> std::ops::Deref for Root<T> {
    type Target = Handle<T>;

    fn deref(&self) -> &Handle<T> {
        &self.inner
    }
}

impl<T> fmt::Pointer for Root<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.inner.get())
    }
}
