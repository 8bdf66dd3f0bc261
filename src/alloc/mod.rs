//! Managed containers built on the heap's allocator surface.
//!
//! These consume the same four-operation contract a container allocator
//! would: [`Heap::allocate`](crate::Heap::allocate) for raw storage,
//! [`Heap::construct_at`](crate::Heap::construct_at) for placement (which
//! destroys whatever previously lived on the bytes),
//! [`Heap::destroy`](crate::Heap::destroy) as a validation-only release,
//! and *no* eager deallocation; storage comes back only through
//! [`Heap::collect`](crate::Heap::collect). That last point is the whole
//! trick: a node or buffer "freed" by a container stays alive as long as
//! any outstanding handle still reaches it.

pub mod set;
pub mod vector;

pub use set::{Cursor, Set};
pub use vector::Vector;
