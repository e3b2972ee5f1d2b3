use std::cell::{Ref, RefMut};
use std::fmt;
use std::rc::Rc;

use crate::pool_core::PoolCore;
use crate::shared::{PoolShared, PoolState, TypedPool};
use crate::{
    Decoder, Encoder, Handle, LoadSummary, Persist, PoolBuilder, PoolId, Registry, Result,
    SaveMode, StrongHandle, WeakHandle,
};

/// Implemented by values that want to know their own handle.
///
/// [`Pool::acquire_self_aware()`] hands the value a weak handle to itself before storing it, so
/// the value can later give out handles to itself without the caller threading one through.
///
/// The callback runs while the pool is being mutated, so it must not access the pool.
pub trait KnowsOwnHandle {
    /// Receives the weak handle under which the value is about to be stored.
    fn remember_handle(&mut self, own: WeakHandle);
}

/// A pool of values of type `T`, addressed through reference-counted handles.
///
/// Each stored value lives in a slot with a strong count. [`acquire()`](Self::acquire) stores a
/// value with a count of one; the slot is freed and the value dropped when the count returns to
/// zero. Values can be referenced through:
///
/// * [`Handle<T>`], which owns one strong reference and releases it when dropped.
/// * [`StrongHandle`], a plain 32-bit word whose ownership the caller tracks manually via
///   [`increment()`](Self::increment) and [`release()`](Self::release).
/// * [`WeakHandle`], a 64-bit word that does not keep the value alive but can be turned back into
///   a strong reference with [`lock()`](Self::lock) as long as the value still exists.
///
/// Slot IDs are reused after a value is freed. Weak handles carry a generation that changes on
/// every reuse, so a weak handle never resolves to a value other than the one it was made for.
///
/// `Pool` is a cheaply cloneable reference to the pool; all clones share the same contents. The
/// pool itself is dropped when the last clone and the last [`Handle<T>`] are gone.
///
/// # Examples
///
/// ```
/// use handle_pool::{Pool, Registry};
///
/// let registry = Registry::new();
/// let pool = Pool::<String>::new(&registry);
///
/// let greeting = pool.acquire("hello".to_string());
/// let weak = greeting.weak();
///
/// greeting.get_mut().push_str(" world");
/// assert_eq!(*greeting.get(), "hello world");
///
/// // Still alive, so the weak handle can be locked.
/// let again = pool.lock(weak).unwrap();
/// assert_eq!(again.count(), 2);
///
/// drop(greeting);
/// drop(again);
///
/// // The value is gone.
/// assert!(pool.lock(weak).is_none());
/// assert!(pool.is_empty());
/// ```
///
/// # Thread safety
///
/// The pool is single-threaded: it is neither [`Send`] nor [`Sync`].
pub struct Pool<T: 'static> {
    shared: Rc<PoolShared<AnonymousState<T>>>,
}

pub(crate) struct AnonymousState<T> {
    core: PoolCore<T>,
}

impl<T: 'static> PoolState for AnonymousState<T> {
    type Stored = T;
    type Item = T;
    type Resource = T;

    fn core(&self) -> &PoolCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PoolCore<T> {
        &mut self.core
    }

    fn item(stored: &T) -> &T {
        stored
    }

    fn item_mut(stored: &mut T) -> &mut T {
        stored
    }

    fn insert_resource(&mut self, resource: T) -> (StrongHandle, Option<T>) {
        (self.core.acquire(resource), None)
    }
}

impl<T: 'static> Pool<T> {
    /// Creates a builder for configuring and constructing a [`Pool`].
    ///
    /// # Examples
    ///
    /// ```
    /// use handle_pool::{Pool, Registry};
    ///
    /// let registry = Registry::new();
    /// let pool = Pool::<u64>::builder().name("counters").build(&registry);
    ///
    /// assert_eq!(pool.name(), "counters");
    /// ```
    #[inline]
    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder::new()
    }

    /// Creates a pool with default settings, registered in `registry`.
    ///
    /// # Panics
    ///
    /// Panics if the registry already holds the maximum number of pools.
    #[must_use]
    pub fn new(registry: &Registry) -> Self {
        Self::builder().build(registry)
    }

    pub(crate) fn from_shared(shared: Rc<PoolShared<AnonymousState<T>>>) -> Self {
        Self { shared }
    }

    pub(crate) fn new_state(core: PoolCore<T>) -> AnonymousState<T> {
        AnonymousState { core }
    }

    /// The ID under which the pool is registered. Every handle issued by the pool carries it.
    #[must_use]
    #[inline]
    pub fn id(&self) -> PoolId {
        self.shared.id()
    }

    /// The name of the pool, used in diagnostics.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// The registry the pool is registered in.
    #[must_use]
    #[inline]
    pub fn registry(&self) -> &Registry {
        self.shared.registry()
    }

    /// The number of values in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Whether the pool holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores a value and returns an owning handle to it.
    ///
    /// # Panics
    ///
    /// Panics if every slot of the pool is in use or the pool is being saved or loaded.
    pub fn acquire(&self, value: T) -> Handle<T> {
        let raw = self.acquire_raw(value);
        Handle::adopt(self.typed(), raw)
    }

    /// Stores a value and returns a strong handle that the caller now owns.
    ///
    /// The caller is responsible for eventually calling [`release()`](Self::release).
    ///
    /// # Panics
    ///
    /// Panics if every slot of the pool is in use or the pool is being saved or loaded.
    pub fn acquire_raw(&self, value: T) -> StrongHandle {
        self.shared.acquire_with(|_| value)
    }

    /// Stores a value after telling it the weak handle it will be stored under.
    ///
    /// # Examples
    ///
    /// ```
    /// use handle_pool::{KnowsOwnHandle, Pool, Registry, WeakHandle};
    ///
    /// struct Node {
    ///     me: WeakHandle,
    /// }
    ///
    /// impl KnowsOwnHandle for Node {
    ///     fn remember_handle(&mut self, own: WeakHandle) {
    ///         self.me = own;
    ///     }
    /// }
    ///
    /// let registry = Registry::new();
    /// let pool = Pool::new(&registry);
    ///
    /// let node = pool.acquire_self_aware(Node {
    ///     me: WeakHandle::INVALID,
    /// });
    ///
    /// assert_eq!(node.get().me, node.weak());
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if every slot of the pool is in use or the pool is being saved or loaded.
    pub fn acquire_self_aware(&self, mut value: T) -> Handle<T>
    where
        T: KnowsOwnHandle,
    {
        let raw = self.shared.acquire_with(|own| {
            value.remember_handle(own);
            value
        });

        Handle::adopt(self.typed(), raw)
    }

    /// Adds a strong reference to the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool or the pool is being
    /// saved or loaded.
    pub fn increment(&self, handle: StrongHandle) {
        self.shared.increment(handle);
    }

    /// Removes a strong reference, returning `true` if this freed the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool (for example because it
    /// was already released) or the pool is being saved or loaded.
    pub fn release(&self, handle: StrongHandle) -> bool {
        self.shared.release(handle)
    }

    /// The current strong count of the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool.
    #[must_use]
    pub fn count(&self, handle: StrongHandle) -> u32 {
        self.shared.count(handle)
    }

    /// How many times the value has been mutably accessed since it was stored or loaded.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool.
    #[must_use]
    pub fn access_count(&self, handle: StrongHandle) -> u32 {
        self.shared.access_count(handle)
    }

    /// Creates a weak handle to the value.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool.
    #[must_use]
    pub fn weak(&self, handle: StrongHandle) -> WeakHandle {
        self.shared.weak(handle)
    }

    /// Turns a weak handle into an owning handle if the value it was made for still exists.
    ///
    /// # Panics
    ///
    /// Panics if the pool is being saved or loaded.
    #[must_use]
    pub fn lock(&self, weak: WeakHandle) -> Option<Handle<T>> {
        let raw = self.lock_raw(weak);
        raw.is_valid().then(|| Handle::adopt(self.typed(), raw))
    }

    /// Turns a weak handle into a strong handle that the caller owns, or returns
    /// [`StrongHandle::INVALID`] if the value it was made for no longer exists.
    ///
    /// # Panics
    ///
    /// Panics if the pool is being saved or loaded.
    #[must_use]
    pub fn lock_raw(&self, weak: WeakHandle) -> StrongHandle {
        self.shared.lock(weak)
    }

    /// Whether [`lock()`](Self::lock) would currently succeed for the weak handle.
    #[must_use]
    pub fn is_live(&self, weak: WeakHandle) -> bool {
        self.shared.is_live(weak)
    }

    /// Borrows the value. Does not count as a modification.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool or if any value of the
    /// pool is currently borrowed mutably.
    #[must_use]
    pub fn get(&self, handle: StrongHandle) -> Ref<'_, T> {
        self.shared.get(handle)
    }

    /// Borrows the value mutably and records the access for merge loads.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool, if any value of the
    /// pool is currently borrowed or if the pool is being saved or loaded.
    #[must_use]
    pub fn get_mut(&self, handle: StrongHandle) -> RefMut<'_, T> {
        self.shared.get_mut(handle)
    }

    /// Creates an owning handle from a raw one, adding a strong reference.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool.
    #[must_use]
    pub fn handle_from_raw(&self, raw: StrongHandle) -> Handle<T> {
        self.increment(raw);
        Handle::adopt(self.typed(), raw)
    }

    /// Strong handles to every value, in storage order. No references are added.
    #[must_use]
    pub fn handles(&self) -> Vec<StrongHandle> {
        self.shared.handles()
    }

    /// Calls `f` for every value, in storage order.
    ///
    /// The pool is borrowed for the duration, so `f` must not mutate it.
    pub fn for_each(&self, mut f: impl FnMut(StrongHandle, &T)) {
        let state = self.shared.state();

        for (handle, value) in state.core().iter() {
            f(handle, value);
        }
    }

    /// Drops every value. All outstanding handles become stale.
    ///
    /// # Panics
    ///
    /// Panics if the pool is being saved or loaded.
    pub fn clear(&self) {
        self.shared.clear();
    }

    /// Writes the contents of the pool.
    ///
    /// Values are saved with [`Persist::save()`] and receive `mode` unchanged, so values that own
    /// pools of their own can save them consistently.
    ///
    /// # Panics
    ///
    /// Panics if the pool is already being saved or loaded, or if a value is mutably borrowed.
    pub fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode)
    where
        T: Persist,
    {
        self.shared.save(encoder, mode);
    }

    /// Replaces or updates the contents of the pool from saved data.
    ///
    /// In [`SaveMode::Full`], the pool is replaced entirely: slot IDs and strong counts are
    /// restored, but weak handles taken before the load will not lock afterwards. In
    /// [`SaveMode::Merge`], values whose change-tracking fields match the saved ones are left
    /// untouched, changed values are loaded in place with [`Persist::load_into()`], new values
    /// are added and values absent from the input are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is malformed or was saved in a different mode. A failed full
    /// load leaves the pool unchanged; a failed merge load may leave some entries updated but
    /// never removes any.
    ///
    /// # Panics
    ///
    /// Panics if the pool is already being saved or loaded, or if a value is borrowed.
    pub fn load(&self, decoder: &mut dyn Decoder, mode: SaveMode) -> Result<LoadSummary>
    where
        T: Persist,
    {
        self.shared.load(decoder, mode)
    }

    fn typed(&self) -> Rc<dyn TypedPool<T>> {
        Rc::<PoolShared<AnonymousState<T>>>::clone(&self.shared)
    }
}

impl<T: 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: 'static> fmt::Debug for Pool<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    reason = "tests use direct indexing for brevity"
)]
mod tests {
    use std::cell::Cell;

    use new_zealand::nz;
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{ByteReader, ByteWriter, DropPolicy};

    assert_not_impl_any!(Pool<u32>: Send, Sync);

    #[test]
    fn smoke_test() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let a = pool.acquire_raw(1);
        let b = pool.acquire_raw(2);

        assert_eq!(pool.len(), 2);
        assert_eq!(*pool.get(a), 1);
        assert_eq!(*pool.get(b), 2);

        assert!(pool.release(a));
        assert!(pool.release(b));
        assert!(pool.is_empty());
    }

    #[test]
    fn default_name_is_item_type() {
        let registry = Registry::new();
        let pool = Pool::<String>::new(&registry);

        assert!(pool.name().contains("String"));
    }

    #[test]
    fn increments_and_releases_balance() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let handle = pool.acquire_raw(7);

        for _ in 0..5 {
            pool.increment(handle);
        }
        for _ in 0..4 {
            assert!(!pool.release(handle));
        }

        assert_eq!(pool.count(handle), 2);
        assert!(!pool.release(handle));
        assert_eq!(pool.count(handle), 1);
        assert!(pool.release(handle));
    }

    #[test]
    #[should_panic]
    fn double_release_panics() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let handle = pool.acquire_raw(1);
        pool.release(handle);
        pool.release(handle);
    }

    #[test]
    #[should_panic]
    fn handle_from_other_pool_panics() {
        let registry = Registry::new();
        let a = Pool::<u32>::new(&registry);
        let b = Pool::<u32>::new(&registry);

        let handle = a.acquire_raw(1);
        _ = b.count(handle);
    }

    #[test]
    fn weak_handle_fails_after_reuse() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let first = pool.acquire_raw(1);
        let weak = pool.weak(first);
        pool.release(first);

        let second = pool.acquire_raw(2);
        assert_eq!(second.index(), first.index());

        assert!(!pool.is_live(weak));
        assert!(pool.lock(weak).is_none());
        assert_eq!(pool.lock_raw(weak), StrongHandle::INVALID);
        assert_eq!(pool.count(second), 1);
    }

    #[test]
    fn get_mut_is_tracked_but_get_is_not() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let handle = pool.acquire_raw(1);

        _ = *pool.get(handle);
        assert_eq!(pool.access_count(handle), 0);

        *pool.get_mut(handle) = 5;
        assert_eq!(pool.access_count(handle), 1);
        assert_eq!(*pool.get(handle), 5);
    }

    #[test]
    fn handles_and_for_each_cover_every_value() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let raws: Vec<StrongHandle> = (0..6).map(|i| pool.acquire_raw(i)).collect();
        pool.release(raws[2]);

        let mut listed = pool.handles();
        listed.sort_unstable();

        let mut expected: Vec<StrongHandle> =
            raws.iter().copied().filter(|h| *h != raws[2]).collect();
        expected.sort_unstable();

        assert_eq!(listed, expected);

        let mut sum = 0;
        pool.for_each(|_, value| sum += value);
        assert_eq!(sum, 1 + 3 + 4 + 5);
    }

    #[test]
    fn clear_drops_everything_and_invalidates_weak_handles() {
        let registry = Registry::new();
        let pool = Pool::<String>::new(&registry);

        let raw = pool.acquire_raw("x".to_string());
        let weak = pool.weak(raw);

        pool.clear();

        assert!(pool.is_empty());
        assert!(pool.lock(weak).is_none());

        let fresh = pool.acquire_raw("y".to_string());
        assert_eq!(fresh.index(), raw.index());
        assert!(pool.lock(weak).is_none());
    }

    #[test]
    fn value_drop_may_release_into_same_pool() {
        struct Link {
            pool: Pool<Link>,
            next: Option<StrongHandle>,
        }

        impl Drop for Link {
            fn drop(&mut self) {
                if let Some(next) = self.next.take() {
                    self.pool.release(next);
                }
            }
        }

        let registry = Registry::new();
        let pool = Pool::<Link>::new(&registry);

        let tail = pool.acquire_raw(Link {
            pool: pool.clone(),
            next: None,
        });
        let head = pool.acquire_raw(Link {
            pool: pool.clone(),
            next: Some(tail),
        });

        assert_eq!(pool.len(), 2);

        // Freeing the head drops it, which releases the tail.
        assert!(pool.release(head));
        assert!(pool.is_empty());
    }

    #[test]
    fn mutation_during_save_panics() {
        struct Meddler {
            pool: Rc<Cell<Option<Pool<Meddler>>>>,
        }

        impl Persist for Meddler {
            fn save(&self, _encoder: &mut dyn Encoder, _mode: SaveMode) {
                if let Some(pool) = self.pool.take() {
                    pool.acquire_raw(Self {
                        pool: Rc::new(Cell::new(None)),
                    });
                }
            }

            fn load(_decoder: &mut dyn Decoder, _mode: SaveMode) -> Result<Self> {
                Ok(Self {
                    pool: Rc::new(Cell::new(None)),
                })
            }
        }

        let registry = Registry::new();
        let pool = Pool::<Meddler>::new(&registry);

        let cell = Rc::new(Cell::new(Some(pool.clone())));
        let raw = pool.acquire_raw(Meddler {
            pool: Rc::clone(&cell),
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut writer = ByteWriter::new();
            pool.save(&mut writer, SaveMode::Full);
        }));

        assert!(result.is_err());

        // The guard was reset by the unwinding save.
        assert!(pool.release(raw));
    }

    #[test]
    fn save_and_load_through_pool() {
        let registry = Registry::new();
        let pool = Pool::<String>::new(&registry);

        let a = pool.acquire_raw("a".to_string());
        let b = pool.acquire_raw("b".to_string());

        let mut writer = ByteWriter::new();
        pool.save(&mut writer, SaveMode::Full);
        let bytes = writer.into_bytes();

        pool.clear();

        let mut reader = ByteReader::new(&bytes);
        let summary = pool.load(&mut reader, SaveMode::Full).unwrap();

        assert_eq!(summary.added, 2);
        assert_eq!(*pool.get(a), "a");
        assert_eq!(*pool.get(b), "b");
    }

    #[test]
    fn slot_limit_is_enforced() {
        let registry = Registry::new();
        let pool = Pool::<u32>::builder().slot_limit(nz!(2)).build(&registry);

        pool.acquire_raw(1);
        pool.acquire_raw(2);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.acquire_raw(3);
        }));

        assert!(result.is_err());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn dropping_pool_with_single_references_is_not_a_leak() {
        let registry = Registry::new();
        let pool = Pool::<u32>::builder()
            .drop_policy(DropPolicy::MustNotLeak)
            .build(&registry);

        pool.acquire_raw(1);
        pool.acquire_raw(2);

        drop(pool);
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic]
    fn dropping_pool_with_shared_references_panics_under_must_not_leak() {
        let registry = Registry::new();
        let pool = Pool::<u32>::builder()
            .drop_policy(DropPolicy::MustNotLeak)
            .build(&registry);

        let raw = pool.acquire_raw(1);
        pool.increment(raw);

        drop(pool);
    }

    #[test]
    fn dropping_pool_with_shared_references_reports_by_default() {
        let registry = Registry::new();
        let pool = Pool::<u32>::new(&registry);

        let raw = pool.acquire_raw(1);
        pool.increment(raw);

        // Reported through tracing, not a panic.
        drop(pool);
        assert!(registry.is_empty());
    }
}
