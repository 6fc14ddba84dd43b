//! The `guard` module provides scoped write access to the shared region.
//!
//! A [`WriteGuard`] is the only way to store a value. It acquires the writer lock when created
//! and releases it when dropped, so every acquire is paired with exactly one release, including
//! on early returns and error paths.

use std::sync::atomic::Ordering;

use log::error;

use crate::locks::{LockStrategy, LockStrategySealed};
use crate::region::DatabaseError::*;
use crate::region::{DatabaseError, SharedRegion, VALUE_MAX, VALUE_MIN};

/// An RAII implementation of a “scoped write lock” of a `SharedRegion`
#[must_use = "the writer lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a, L: LockStrategy> {
    region: &'a SharedRegion<L>,
}

impl<'a, L: LockStrategy> WriteGuard<'a, L> {
    /// Blocks until the region's writer lock is acquired
    pub(crate) fn new(region: &'a SharedRegion<L>) -> Result<Self, DatabaseError> {
        region.lock_strategy().acquire()?;
        Ok(WriteGuard { region })
    }

    /// Store `value` in slot `index` and return the value it replaces.
    ///
    /// `value` must lie in `[VALUE_MIN, VALUE_MAX]`.
    pub fn write(&self, index: usize, value: i32) -> Result<i32, DatabaseError> {
        if !(VALUE_MIN..=VALUE_MAX).contains(&value) {
            return Err(ValueOutOfDomain(value));
        }
        // writers are ordered by the semaphore, which is a full barrier on both ends
        Ok(self.region.slot(index)?.swap(value, Ordering::Relaxed))
    }

    /// Read slot `index` while holding the lock
    #[inline]
    pub fn read(&self, index: usize) -> Result<i32, DatabaseError> {
        self.region.read(index)
    }
}

impl<L: LockStrategy> Drop for WriteGuard<'_, L> {
    /// Releases the writer lock when `WriteGuard` goes out of scope
    fn drop(&mut self) {
        if let Err(err) = self.region.lock_strategy().release() {
            error!("failed to release writer lock: {err}");
        }
    }
}
