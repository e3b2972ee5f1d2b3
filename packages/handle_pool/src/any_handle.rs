use std::fmt;
use std::rc::Rc;

use tracing::warn;

use crate::shared::PoolDispatch;
use crate::{Handle, PoolId, Registry, StrongHandle, WeakHandle};

/// An owning reference to a value in any pool of a [`Registry`], without knowing its type.
///
/// Behaves like [`Handle<T>`] but dispatches every operation through the registry, using the
/// pool ID embedded in the raw handle. This lets code hold and release references to values of
/// pools it has no static knowledge of.
///
/// Unlike [`Handle<T>`], this does not keep the pool alive. If the pool is dropped first, the
/// reference is reported as leaked by the pool and dropping this handle logs a warning. This
/// holds even if another pool has since taken over the pool ID.
///
/// # Examples
///
/// ```
/// use handle_pool::{AnyHandle, Pool, Registry};
///
/// let registry = Registry::new();
/// let pool = Pool::<String>::new(&registry);
///
/// let erased: AnyHandle = pool.acquire("anything".to_string()).erase();
/// assert_eq!(erased.with(|s: &String| s.len()), Some(8));
///
/// // Recover the typed handle when the type is known again.
/// let typed = erased.downcast::<String>().unwrap();
/// assert_eq!(*typed.get(), "anything");
/// ```
pub struct AnyHandle {
    registry: Registry,
    raw: StrongHandle,

    /// The registration of the pool ID that `raw` was issued under.
    epoch: u32,
}

impl AnyHandle {
    /// Creates a handle for a raw handle, adding a strong reference.
    ///
    /// # Panics
    ///
    /// Panics if the raw handle does not refer to a live value in a pool of the registry.
    #[must_use]
    pub fn from_raw(registry: &Registry, raw: StrongHandle) -> Self {
        registry.increment(raw);
        Self::adopt(registry, raw)
    }

    /// Wraps a strong reference the caller already owns, without incrementing.
    #[must_use]
    pub fn adopt(registry: &Registry, raw: StrongHandle) -> Self {
        Self {
            registry: registry.clone(),
            raw,
            epoch: registry.epoch_of(raw.pool_id()),
        }
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

    /// The ID of the pool the value lives in, or `None` if the handle is empty.
    #[must_use]
    pub fn pool_id(&self) -> Option<PoolId> {
        (!self.is_null()).then(|| self.raw.pool_id())
    }

    /// Creates a weak handle to the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty or the pool is gone.
    #[must_use]
    pub fn weak(&self) -> WeakHandle {
        self.pool("weak").weak(self.raw)
    }

    /// The current strong count of the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty or the pool is gone.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.pool("count").count(self.raw)
    }

    /// Calls `f` with the value if it is of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if the handle is empty or the pool is gone.
    pub fn with<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let pool = self.pool("with");
        let item = pool.item_any(self.raw);

        item.downcast_ref::<T>().map(f)
    }

    /// Converts into a typed handle if the value lives in a pool of `T`. The reference is
    /// transferred; on mismatch the handle is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `self` if the handle is empty, the pool is gone or it does not store `T`.
    pub fn downcast<T: 'static>(self) -> Result<Handle<T>, Self> {
        if self.is_null() {
            return Err(self);
        }

        match self.registry.typed_pool::<T>(self.raw.pool_id(), self.epoch) {
            Some(pool) => Ok(Handle::adopt(pool, self.into_raw())),
            None => Err(self),
        }
    }

    /// Releases the reference and empties the handle. Does nothing if already empty.
    pub fn reset(&mut self) {
        let raw = self.take_raw();

        if raw.is_valid() && self.registry.try_release(raw, self.epoch).is_none() {
            warn!(
                handle = ?raw,
                "handle released after its pool was dropped"
            );
        }
    }

    /// Empties the handle without releasing, handing the reference to the caller.
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

    fn pool(&self, operation: &str) -> Rc<dyn PoolDispatch> {
        assert!(!self.is_null(), "{operation}() on an empty handle");

        self.registry
            .pool_at(self.raw.pool_id(), self.epoch)
            .unwrap_or_else(|| {
                panic!(
                    "{operation}() with {:?}, but the pool it was issued by has been dropped",
                    self.raw
                )
            })
    }
}

impl Clone for AnyHandle {
    fn clone(&self) -> Self {
        if !self.is_null() {
            self.pool("clone").increment(self.raw);
        }

        Self {
            registry: self.registry.clone(),
            raw: self.raw,
            epoch: self.epoch,
        }
    }
}

impl Drop for AnyHandle {
    fn drop(&mut self) {
        self.reset();
    }
}

impl PartialEq for AnyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for AnyHandle {}

impl fmt::Debug for AnyHandle {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyHandle")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{NamedPool, Pool};

    assert_not_impl_any!(AnyHandle: Send, Sync);

    #[test]
    fn generic_path_matches_fast_path() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let raw = pool.acquire_raw(3);

        let erased = AnyHandle::from_raw(&registry, raw);
        assert_eq!(erased.count(), 2);

        let clone = erased.clone();
        assert_eq!(pool.count(raw), 3);

        drop(clone);
        drop(erased);
        assert_eq!(pool.count(raw), 1);

        let adopted = registry.adopt(raw);
        assert_eq!(adopted.weak(), pool.weak(raw));

        drop(adopted);
        assert!(pool.is_empty());
    }

    #[test]
    fn erase_and_downcast_keep_the_reference() {
        let registry = Registry::new();
        let pool = Pool::<String>::new(&registry);

        let handle = pool.acquire("v".to_string());
        let raw = handle.raw();

        let erased = handle.erase();
        assert_eq!(pool.count(raw), 1);

        let wrong = erased.downcast::<u32>().unwrap_err();
        assert_eq!(pool.count(raw), 1);

        let typed = wrong.downcast::<String>().unwrap();
        assert_eq!(typed.count(), 1);

        drop(typed);
        assert!(pool.is_empty());
    }

    #[test]
    fn downcast_works_for_named_pools() {
        let registry = Registry::new();
        let pool = NamedPool::<String, u32>::new(&registry);

        let (handle, _) = pool.acquire("k".to_string(), 9);
        let typed = handle.erase().downcast::<u32>().unwrap();

        assert_eq!(*typed.get(), 9);
    }

    #[test]
    fn dropping_after_pool_is_gone_only_warns() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let erased = pool.acquire(1).erase();
        drop(pool);

        assert!(registry.is_empty());
        assert!(!erased.is_null());

        drop(erased);
    }

    #[test]
    fn handle_outliving_its_pool_does_not_touch_the_successor() {
        let registry = Registry::new();
        let old = Pool::<u32>::new(&registry);

        let erased = old.acquire(1).erase();
        let old_id = old.id();
        drop(old);

        // Same item type and same slot, so only the registration tells them apart.
        let successor = Pool::<u32>::new(&registry);
        assert_eq!(successor.id(), old_id);

        let bystander = successor.acquire_raw(2);
        assert_eq!(bystander.index(), erased.raw().index());

        let stale = erased.downcast::<u32>().unwrap_err();
        drop(stale);

        assert_eq!(successor.len(), 1);
        assert_eq!(successor.count(bystander), 1);
        assert_eq!(*successor.get(bystander), 2);
    }

    #[test]
    #[should_panic]
    fn clone_after_pool_is_gone_panics() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let erased = pool.acquire(1).erase();
        drop(pool);

        let _successor = Pool::<u32>::new(&registry);
        _ = erased.clone();
    }

    #[test]
    fn empty_handle_downcast_fails() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let mut erased = pool.acquire(1).erase();
        erased.reset();

        assert!(erased.pool_id().is_none());
        assert!(erased.downcast::<u32>().is_err());
        assert!(pool.is_empty());
    }
}
