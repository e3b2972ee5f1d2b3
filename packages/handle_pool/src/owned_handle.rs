use std::cell::{Ref, RefMut};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::shared::TypedPool;
use crate::{AnyHandle, PoolId, StrongHandle, WeakHandle};

/// An owning reference to a value of type `T` in a pool.
///
/// The handle holds one strong reference: cloning it adds a reference and dropping it releases
/// one. Moving it transfers the reference without touching the count. The handle also keeps the
/// pool alive, so operations on it go straight to the pool without a registry lookup.
///
/// A handle can be emptied with [`reset()`](Self::reset) (which releases the reference) or
/// [`take_raw()`](Self::take_raw) (which hands the reference to the caller). Accessing the value
/// of an empty handle panics.
///
/// # Examples
///
/// ```
/// use handle_pool::{Pool, Registry};
///
/// let registry = Registry::new();
/// let pool = Pool::<Vec<u32>>::new(&registry);
///
/// let numbers = pool.acquire(vec![1, 2, 3]);
/// let copy = numbers.clone();
/// assert_eq!(numbers.count(), 2);
///
/// copy.get_mut().push(4);
/// assert_eq!(numbers.get().len(), 4);
///
/// // A projection borrows one part of the value.
/// let first = numbers.project(|v| &v[0]);
/// assert_eq!(*first, 1);
/// ```
pub struct Handle<T: 'static> {
    pool: Rc<dyn TypedPool<T>>,
    raw: StrongHandle,
}

impl<T: 'static> Handle<T> {
    /// Wraps a strong reference the caller already owns.
    pub(crate) fn adopt(pool: Rc<dyn TypedPool<T>>, raw: StrongHandle) -> Self {
        Self { pool, raw }
    }

    /// The underlying raw handle. Ownership stays with `self`.
    #[must_use]
    #[inline]
    pub fn raw(&self) -> StrongHandle {
        self.raw
    }

    /// Whether the handle has been emptied.
    #[must_use]
    #[inline]
    pub fn is_null(&self) -> bool {
        !self.raw.is_valid()
    }

    /// The ID of the pool the value lives in.
    #[must_use]
    #[inline]
    pub fn pool_id(&self) -> PoolId {
        self.pool.pool_id()
    }

    /// Borrows the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty or the value is mutably borrowed.
    #[must_use]
    pub fn get(&self) -> Ref<'_, T> {
        self.pool.borrow_item(self.live_raw("get"))
    }

    /// Borrows the value mutably, recording the access for merge loads.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty, any value of the pool is borrowed or the pool is being
    /// saved or loaded.
    #[must_use]
    pub fn get_mut(&self) -> RefMut<'_, T> {
        self.pool.borrow_item_mut(self.live_raw("get_mut"))
    }

    /// Borrows a part of the value, as selected by `f`.
    ///
    /// This is how a handle offers a narrower view of the value without reinterpreting it.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty or the value is mutably borrowed.
    #[must_use]
    pub fn project<U: ?Sized>(&self, f: impl FnOnce(&T) -> &U) -> Ref<'_, U> {
        Ref::map(self.get(), f)
    }

    /// Creates a weak handle to the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty.
    #[must_use]
    pub fn weak(&self) -> WeakHandle {
        self.pool.weak(self.live_raw("weak"))
    }

    /// The current strong count of the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.pool.count(self.live_raw("count"))
    }

    /// Releases the reference and empties the handle. Does nothing if already empty.
    pub fn reset(&mut self) {
        let raw = self.take_raw();

        if raw.is_valid() {
            self.pool.release(raw);
        }
    }

    /// Empties the handle without releasing, handing the reference to the caller.
    ///
    /// Returns [`StrongHandle::INVALID`] if the handle was already empty.
    #[must_use]
    pub fn take_raw(&mut self) -> StrongHandle {
        let raw = self.raw;
        self.raw.set_null();
        raw
    }

    /// Consumes the handle without releasing, handing the reference to the caller.
    #[must_use]
    pub fn into_raw(mut self) -> StrongHandle {
        self.take_raw()
    }

    /// Converts into a handle that does not know the item type. The reference is transferred.
    #[must_use]
    pub fn erase(self) -> AnyHandle {
        let registry = self.pool.registry().clone();
        AnyHandle::adopt(&registry, self.into_raw())
    }

    fn live_raw(&self, operation: &str) -> StrongHandle {
        assert!(!self.is_null(), "{operation}() on an empty handle");
        self.raw
    }
}

impl<T: 'static> Clone for Handle<T> {
    fn clone(&self) -> Self {
        if !self.is_null() {
            self.pool.increment(self.raw);
        }

        Self {
            pool: Rc::clone(&self.pool),
            raw: self.raw,
        }
    }
}

impl<T: 'static> Drop for Handle<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: 'static> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: 'static> Eq for Handle<T> {}

impl<T: 'static> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: 'static> fmt::Debug for Handle<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}
