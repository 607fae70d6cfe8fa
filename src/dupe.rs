//! A cheap, explicit alternative to `Clone` for reference-counted handles.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Calling `.clone()` on an `Arc` is O(1) but reads the same at the call
//! site as cloning something expensive. `Dupe::dupe` marks "this is just a
//! refcount bump" the way the rest of this crate's spawned-task plumbing
//! wants to see at a glance.

use std::sync::Arc;

/// Types that can be duplicated for (near) free, typically because they are
/// reference-counted handles rather than owners of the underlying data.
pub trait Dupe {
    /// Duplicate `self`. Must be O(1).
    fn dupe(&self) -> Self;
}

impl<T: ?Sized> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Arc::clone(self)
    }
}
