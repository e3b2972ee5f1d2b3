use std::any::type_name;
use std::fmt;
use std::hash::Hash;
use std::num::NonZero;

use crate::pool_core::PoolCore;
use crate::shared::{PoolShared, ResourceFactory};
use crate::slot_table::DEFAULT_ID_LIMIT;
use crate::{DropPolicy, Locator, MAX_SLOTS, NamedPool, Pool, Registry};

/// Builder for creating an instance of [`Pool`].
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use handle_pool::{DropPolicy, Pool, Registry};
///
/// let registry = Registry::new();
///
/// let pool = Pool::<u32>::builder()
///     .name("scores")
///     .drop_policy(DropPolicy::MustNotLeak)
///     .slot_limit(NonZero::new(1024).unwrap())
///     .build(&registry);
///
/// assert_eq!(pool.name(), "scores");
/// ```
#[must_use]
pub struct PoolBuilder<T: 'static> {
    settings: Settings,
    factory: Option<ResourceFactory<T>>,
}

impl<T: 'static> PoolBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            settings: Settings::new::<T>(),
            factory: None,
        }
    }

    /// Sets the name of the pool, used in diagnostics.
    ///
    /// Defaults to the name of the item type.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = name.into();
        self
    }

    /// Defines how the pool treats values still referenced when the pool is dropped.
    ///
    /// Defaults to [`DropPolicy::ReportLeaks`].
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.settings.drop_policy = policy;
        self
    }

    /// Caps the number of values the pool can hold at the same time.
    ///
    /// Defaults to [`MAX_SLOTS`], which is also the upper bound.
    ///
    /// # Panics
    ///
    /// Panics if `limit` exceeds [`MAX_SLOTS`].
    pub fn slot_limit(mut self, limit: NonZero<u32>) -> Self {
        self.settings.set_slot_limit(limit);
        self
    }

    /// Lets [`Registry::load_resource()`] store fetched resources in this pool.
    ///
    /// The factory receives the locator and the fetched bytes and returns `None` to leave the
    /// resource to another pool. It must not use the pool it belongs to.
    pub fn resource_factory(
        mut self,
        factory: impl Fn(&Locator, &[u8]) -> Option<T> + 'static,
    ) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Creates the pool and registers it in `registry`.
    ///
    /// # Panics
    ///
    /// Panics if the registry already holds the maximum number of pools.
    #[must_use]
    pub fn build(self, registry: &Registry) -> Pool<T> {
        let Settings {
            name,
            drop_policy,
            slot_limit,
        } = self.settings;

        Pool::from_shared(PoolShared::new_registered(
            registry,
            name,
            drop_policy,
            self.factory,
            |pool_id| Pool::new_state(PoolCore::new(pool_id, slot_limit)),
        ))
    }
}

impl<T: 'static> fmt::Debug for PoolBuilder<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("settings", &self.settings)
            .field("has_factory", &self.factory.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for creating an instance of [`NamedPool`].
///
/// Offers the same settings as [`PoolBuilder`]. A resource factory for a named pool produces the
/// key along with the value; if the key is already present, the existing value is reused.
#[must_use]
pub struct NamedPoolBuilder<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: 'static,
{
    settings: Settings,
    factory: Option<ResourceFactory<(K, T)>>,
}

impl<K, T> NamedPoolBuilder<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            settings: Settings::new::<T>(),
            factory: None,
        }
    }

    /// Sets the name of the pool, used in diagnostics.
    ///
    /// Defaults to the name of the item type.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = name.into();
        self
    }

    /// Defines how the pool treats values still referenced when the pool is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.settings.drop_policy = policy;
        self
    }

    /// Caps the number of values the pool can hold at the same time.
    ///
    /// # Panics
    ///
    /// Panics if `limit` exceeds [`MAX_SLOTS`].
    pub fn slot_limit(mut self, limit: NonZero<u32>) -> Self {
        self.settings.set_slot_limit(limit);
        self
    }

    /// Lets [`Registry::load_resource()`] store fetched resources in this pool.
    ///
    /// Returning `None` leaves the resource to another pool.
    pub fn resource_factory(
        mut self,
        factory: impl Fn(&Locator, &[u8]) -> Option<(K, T)> + 'static,
    ) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Creates the pool and registers it in `registry`.
    ///
    /// # Panics
    ///
    /// Panics if the registry already holds the maximum number of pools.
    #[must_use]
    pub fn build(self, registry: &Registry) -> NamedPool<K, T> {
        let Settings {
            name,
            drop_policy,
            slot_limit,
        } = self.settings;

        NamedPool::from_shared(PoolShared::new_registered(
            registry,
            name,
            drop_policy,
            self.factory,
            |pool_id| NamedPool::new_state(PoolCore::new(pool_id, slot_limit)),
        ))
    }
}

impl<K, T> fmt::Debug for NamedPoolBuilder<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: 'static,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedPoolBuilder")
            .field("settings", &self.settings)
            .field("has_factory", &self.factory.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Settings {
    name: String,
    drop_policy: DropPolicy,
    slot_limit: NonZero<u32>,
}

impl Settings {
    fn new<T>() -> Self {
        Self {
            name: type_name::<T>().to_string(),
            drop_policy: DropPolicy::default(),
            slot_limit: DEFAULT_ID_LIMIT,
        }
    }

    fn set_slot_limit(&mut self, limit: NonZero<u32>) {
        assert!(
            limit.get() <= MAX_SLOTS,
            "slot limit {limit} exceeds the maximum of {MAX_SLOTS}"
        );

        self.slot_limit = limit;
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    #[test]
    fn defaults() {
        let registry = Registry::new();
        let pool = Pool::<u32>::builder().build(&registry);

        assert_eq!(pool.name(), "u32");
        assert!(pool.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn name_is_applied() {
        let registry = Registry::new();
        let pool = NamedPool::<String, u32>::builder()
            .name("ages")
            .build(&registry);

        assert_eq!(pool.name(), "ages");
        assert_eq!(registry.pool_name(pool.id()), Some("ages".to_string()));
    }

    #[test]
    fn maximum_slot_limit_is_accepted() {
        let registry = Registry::new();
        let pool = Pool::<u8>::builder()
            .slot_limit(DEFAULT_ID_LIMIT)
            .build(&registry);

        drop(pool.acquire(1));
    }

    #[test]
    #[should_panic]
    fn slot_limit_above_maximum_panics() {
        drop(Pool::<u8>::builder().slot_limit(nz!(2_000_000)));
    }

    #[test]
    fn named_pool_slot_limit_is_enforced() {
        let registry = Registry::new();
        let pool = NamedPool::<u32, u32>::builder()
            .slot_limit(nz!(1))
            .build(&registry);

        let (_first, _) = pool.acquire(1, 1);

        // Re-acquiring a present key needs no new slot.
        let (_again, is_new) = pool.acquire(1, 1);
        assert!(!is_new);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            drop(pool.acquire(2, 2));
        }));
        assert!(result.is_err());
    }
}
