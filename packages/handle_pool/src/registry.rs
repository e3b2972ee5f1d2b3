use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::shared::{PoolDispatch, TypedPool};
use crate::{AnyHandle, Error, Loaders, Locator, PoolId, Result, StrongHandle, WeakHandle};

/// A directory of live pools, keyed by [`PoolId`].
///
/// Every pool registers itself on construction and unregisters when it is dropped. The registry
/// lets code that holds nothing but a [`StrongHandle`] or [`WeakHandle`] operate on the item it
/// refers to, because every handle embeds the ID of the pool that issued it.
///
/// The registry is a cheaply cloneable reference to shared state. Each pool keeps a clone, so the
/// registry always outlives the pools registered in it. Up to [`PoolId::COUNT`] pools can be
/// registered at the same time; IDs of dropped pools are reused, lowest first. Weak handles and
/// [`AnyHandle`]s issued under a dropped pool never reach the pool that takes over its ID.
///
/// # Examples
///
/// ```
/// use handle_pool::{Pool, Registry};
///
/// let registry = Registry::new();
/// let pool = Pool::<String>::new(&registry);
///
/// let raw = pool.acquire_raw("hello".to_string());
///
/// // Code that does not know the item type can still manage the reference.
/// registry.increment(raw);
/// assert_eq!(registry.count(raw), 2);
///
/// let len = registry.with_value(raw, |s: &String| s.len());
/// assert_eq!(len, Some(5));
///
/// assert!(!registry.release(raw));
/// assert!(registry.release(raw));
/// assert!(pool.is_empty());
/// ```
///
/// # Thread safety
///
/// Pools and the registry are single-threaded. The registry is neither [`Send`] nor [`Sync`].
#[derive(Clone, Default)]
pub struct Registry {
    inner: Rc<RefCell<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    /// Indexed by pool ID. Never longer than `PoolId::COUNT`.
    ids: Vec<IdSlot>,
}

/// Everything the registry knows about one pool ID, including what outlives the pools that
/// held it.
#[derive(Default)]
struct IdSlot {
    pool: Option<RegisteredPool>,

    /// Bumped on every registration, so references taken under an earlier registration of the
    /// same ID can be told apart.
    epoch: u32,

    /// The highest weak generation any pool with this ID has handed out. The next pool to take
    /// the ID continues above it, so weak handles from dropped pools never lock.
    weak_generation_floor: u64,
}

/// What a pool learns about its ID when it registers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Registration {
    pub(crate) pool_id: PoolId,
    pub(crate) weak_generation_floor: u64,
}

struct RegisteredPool {
    dispatch: Weak<dyn PoolDispatch>,

    /// A `Weak<dyn TypedPool<T>>` for the item type `T` of the pool, used to recover typed
    /// handles from type-erased ones.
    typed: Box<dyn Any>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of pools currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .borrow()
            .ids
            .iter()
            .filter(|slot| slot.pool.is_some())
            .count()
    }

    /// Whether no pools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live pool with the given ID is registered.
    #[must_use]
    pub fn contains(&self, pool_id: PoolId) -> bool {
        self.pool(pool_id).is_some()
    }

    /// The name of the pool with the given ID, if it is registered.
    #[must_use]
    pub fn pool_name(&self, pool_id: PoolId) -> Option<String> {
        self.pool(pool_id).map(|pool| pool.name().to_string())
    }

    /// Increments the strong count of the item the handle refers to.
    ///
    /// # Panics
    ///
    /// Panics if the issuing pool is not registered or the handle is not a live strong handle of
    /// that pool.
    pub fn increment(&self, handle: StrongHandle) {
        self.pool_for(handle, "increment").increment(handle);
    }

    /// Decrements the strong count of the item the handle refers to, returning whether the item
    /// was freed.
    ///
    /// # Panics
    ///
    /// Panics if the issuing pool is not registered or the handle is not a live strong handle of
    /// that pool.
    pub fn release(&self, handle: StrongHandle) -> bool {
        self.pool_for(handle, "release").release(handle)
    }

    /// The strong count of the item the handle refers to.
    ///
    /// # Panics
    ///
    /// Panics if the issuing pool is not registered or the handle is not a live strong handle of
    /// that pool.
    #[must_use]
    pub fn count(&self, handle: StrongHandle) -> u32 {
        self.pool_for(handle, "count").count(handle)
    }

    /// Creates a weak handle to the item the handle refers to.
    ///
    /// # Panics
    ///
    /// Panics if the issuing pool is not registered or the handle is not a live strong handle of
    /// that pool.
    #[must_use]
    pub fn weak(&self, handle: StrongHandle) -> WeakHandle {
        self.pool_for(handle, "weak").weak(handle)
    }

    /// Attempts to turn a weak handle into a strong one, incrementing the strong count.
    ///
    /// Returns [`StrongHandle::INVALID`] if the item no longer exists or its pool is gone.
    #[must_use]
    pub fn lock(&self, weak: WeakHandle) -> StrongHandle {
        if !weak.is_valid() {
            return StrongHandle::INVALID;
        }

        self.pool(weak.pool_id())
            .map_or(StrongHandle::INVALID, |pool| pool.lock(weak))
    }

    /// Calls `f` with a reference to the item the handle refers to.
    ///
    /// Returns `None` if the item is not of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if the issuing pool is not registered or the handle is not a live strong handle of
    /// that pool.
    pub fn with_value<T: 'static, R>(
        &self,
        handle: StrongHandle,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let pool = self.pool_for(handle, "with_value");
        let item = pool.item_any(handle);

        item.downcast_ref::<T>().map(f)
    }

    /// Takes over a strong reference that the caller owns, without incrementing the count.
    ///
    /// The returned handle releases the reference when dropped.
    #[must_use]
    pub fn adopt(&self, handle: StrongHandle) -> AnyHandle {
        AnyHandle::adopt(self, handle)
    }

    /// Fetches the bytes for a locator and offers them to every registered pool that has a
    /// resource factory, in pool ID order. The first pool that accepts them stores the resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceNotFound`] if no source could produce the bytes,
    /// [`Error::ResourceRejected`] if no pool accepted them, or the error of a failing source if
    /// no other source succeeded.
    ///
    /// # Examples
    ///
    /// ```
    /// use handle_pool::{Loaders, Locator, MemorySource, Pool, Registry};
    ///
    /// let registry = Registry::new();
    /// let pool = Pool::<String>::builder()
    ///     .resource_factory(|locator, bytes| {
    ///         (locator.scheme() == "text")
    ///             .then(|| String::from_utf8(bytes.to_vec()).ok())
    ///             .flatten()
    ///     })
    ///     .build(&registry);
    ///
    /// let mut source = MemorySource::new();
    /// source.insert("text:greeting".parse().unwrap(), b"hello".to_vec());
    ///
    /// let mut loaders = Loaders::new();
    /// loaders.add(0, source);
    ///
    /// let locator: Locator = "text:greeting".parse().unwrap();
    /// let handle = registry.load_resource(&loaders, &locator).unwrap();
    ///
    /// assert_eq!(handle.with(|s: &String| s.clone()), Some("hello".to_string()));
    /// assert_eq!(pool.len(), 1);
    /// ```
    pub fn load_resource(&self, loaders: &Loaders, locator: &Locator) -> Result<AnyHandle> {
        let bytes = loaders
            .fetch(locator)?
            .ok_or_else(|| Error::ResourceNotFound {
                locator: locator.to_string(),
            })?;

        for pool in self.live_pools() {
            if let Some(handle) = pool.load_resource(locator, &bytes) {
                debug!(
                    pool = pool.name(),
                    %locator,
                    "resource loaded"
                );

                return Ok(self.adopt(handle));
            }
        }

        Err(Error::ResourceRejected {
            locator: locator.to_string(),
        })
    }

    /// The current registration epoch of a pool ID, whether or not a pool holds it right now.
    pub(crate) fn epoch_of(&self, pool_id: PoolId) -> u32 {
        self.inner
            .borrow()
            .ids
            .get(pool_id.as_index())
            .map_or(0, |slot| slot.epoch)
    }

    /// The pool with the given ID, if it is the registration identified by `epoch`.
    pub(crate) fn pool_at(&self, pool_id: PoolId, epoch: u32) -> Option<Rc<dyn PoolDispatch>> {
        let inner = self.inner.borrow();
        let slot = inner.ids.get(pool_id.as_index())?;

        if slot.epoch != epoch {
            return None;
        }

        slot.pool.as_ref()?.dispatch.upgrade()
    }

    /// Releases the handle if the registration it was taken under still exists. Returns `None`
    /// if that pool is gone, even if another pool has since taken over its ID.
    pub(crate) fn try_release(&self, handle: StrongHandle, epoch: u32) -> Option<bool> {
        self.pool_at(handle.pool_id(), epoch)
            .map(|pool| pool.release(handle))
    }

    /// The typed face of a pool, if the registration identified by `epoch` is still live and
    /// stores items of type `T`.
    pub(crate) fn typed_pool<T: 'static>(
        &self,
        pool_id: PoolId,
        epoch: u32,
    ) -> Option<Rc<dyn TypedPool<T>>> {
        let inner = self.inner.borrow();
        let slot = inner.ids.get(pool_id.as_index())?;

        if slot.epoch != epoch {
            return None;
        }

        slot.pool
            .as_ref()?
            .typed
            .downcast_ref::<Weak<dyn TypedPool<T>>>()?
            .upgrade()
    }

    pub(crate) fn register(
        &self,
        dispatch: Weak<dyn PoolDispatch>,
        typed: Box<dyn Any>,
        name: &str,
    ) -> Registration {
        let mut inner = self.inner.borrow_mut();

        let index = match inner.ids.iter().position(|slot| slot.pool.is_none()) {
            Some(index) => index,
            None => {
                assert!(
                    inner.ids.len() < PoolId::COUNT,
                    "cannot register pool '{name}': all {} pool IDs are in use",
                    PoolId::COUNT
                );

                inner.ids.push(IdSlot::default());
                inner.ids.len().wrapping_sub(1)
            }
        };

        let slot = inner
            .ids
            .get_mut(index)
            .expect("index was just found or pushed");

        slot.pool = Some(RegisteredPool { dispatch, typed });
        slot.epoch = slot.epoch.wrapping_add(1);

        let registration = Registration {
            pool_id: PoolId::new(
                u8::try_from(index).expect("registry never holds more than PoolId::COUNT pools"),
            ),
            weak_generation_floor: slot.weak_generation_floor,
        };

        debug!(
            pool = name,
            pool_id = %registration.pool_id,
            epoch = slot.epoch,
            "pool registered"
        );

        registration
    }

    /// Removes the pool, remembering the last weak generation it handed out.
    pub(crate) fn unregister(&self, pool_id: PoolId, last_weak_generation: u64) {
        let removed = self
            .inner
            .borrow_mut()
            .ids
            .get_mut(pool_id.as_index())
            .and_then(|slot| {
                slot.weak_generation_floor = slot.weak_generation_floor.max(last_weak_generation);
                slot.pool.take()
            });

        debug_assert!(removed.is_some(), "pool {pool_id} was not registered");

        debug!(%pool_id, "pool unregistered");

        // The registration holds only weak references, so dropping it here cannot re-enter.
        drop(removed);
    }

    /// The live pool with the given ID. The registry borrow ends before the pool is used.
    fn pool(&self, pool_id: PoolId) -> Option<Rc<dyn PoolDispatch>> {
        self.inner
            .borrow()
            .ids
            .get(pool_id.as_index())?
            .pool
            .as_ref()?
            .dispatch
            .upgrade()
    }

    fn pool_for(&self, handle: StrongHandle, operation: &str) -> Rc<dyn PoolDispatch> {
        assert!(handle.is_valid(), "{operation}() with the invalid handle");

        self.pool(handle.pool_id()).unwrap_or_else(|| {
            panic!(
                "{operation}() with {handle:?}, but no pool with ID {} is registered",
                handle.pool_id()
            )
        })
    }

    fn live_pools(&self) -> Vec<Rc<dyn PoolDispatch>> {
        self.inner
            .borrow()
            .ids
            .iter()
            .filter_map(|slot| slot.pool.as_ref()?.dispatch.upgrade())
            .collect()
    }
}

impl fmt::Debug for Registry {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools: Vec<(PoolId, String, &'static str)> = self
            .live_pools()
            .iter()
            .map(|pool| (pool.pool_id(), pool.name().to_string(), pool.item_type_name()))
            .collect();

        f.debug_struct("Registry").field("pools", &pools).finish()
    }
}
