use std::borrow::Borrow;
use std::cell::{Ref, RefMut};
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;

use foldhash::{HashMap, HashSet, HashSetExt};

use crate::pool_core::PoolCore;
use crate::shared::{PoolShared, PoolState, TypedPool};
use crate::{
    Decoder, Encoder, Error, Handle, LoadSummary, NamedPoolBuilder, Persist, PoolId, Registry,
    Result, SaveMode, StrongHandle, WeakHandle,
};

/// A value stored in a named pool, together with the key it is registered under.
///
/// The key is cleared when the name is moved to another entry, after which the entry lives on
/// anonymously until its last reference is released.
pub(crate) struct NamedEntry<K, T> {
    value: T,
    key: Option<K>,
}

impl<K: Persist, T: Persist> Persist for NamedEntry<K, T> {
    fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode) {
        self.key.save(encoder, mode);
        self.value.save(encoder, mode);
    }

    fn load(decoder: &mut dyn Decoder, mode: SaveMode) -> Result<Self> {
        let key = Option::<K>::load(decoder, mode)?;
        let value = T::load(decoder, mode)?;

        Ok(Self { value, key })
    }

    fn load_into(&mut self, decoder: &mut dyn Decoder, mode: SaveMode) -> Result<()> {
        self.key = Option::<K>::load(decoder, mode)?;
        self.value.load_into(decoder, mode)
    }
}

pub(crate) struct NamedState<K, T> {
    core: PoolCore<NamedEntry<K, T>>,
    names: HashMap<K, StrongHandle>,
}

impl<K, T> PoolState for NamedState<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: 'static,
{
    type Stored = NamedEntry<K, T>;
    type Item = T;
    type Resource = (K, T);

    fn core(&self) -> &PoolCore<NamedEntry<K, T>> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PoolCore<NamedEntry<K, T>> {
        &mut self.core
    }

    fn item(stored: &NamedEntry<K, T>) -> &T {
        &stored.value
    }

    fn item_mut(stored: &mut NamedEntry<K, T>) -> &mut T {
        &mut stored.value
    }

    fn insert_resource(&mut self, (key, value): (K, T)) -> (StrongHandle, Option<(K, T)>) {
        self.acquire_or_reuse(key, value)
    }

    fn on_freed(&mut self, handle: StrongHandle, stored: &NamedEntry<K, T>) {
        let Some(key) = &stored.key else {
            return;
        };

        // A detached entry may share its old key with the entry that replaced it.
        if self.names.get(key) == Some(&handle) {
            self.names.remove(key);
        }
    }

    fn on_cleared(&mut self) {
        self.names.clear();
    }

    fn check_full_load(incoming: &[&NamedEntry<K, T>]) -> Result<()> {
        let mut keys = HashSet::with_capacity(incoming.len());

        for key in incoming.iter().filter_map(|entry| entry.key.as_ref()) {
            if !keys.insert(key) {
                return Err(duplicate_key());
            }
        }

        Ok(())
    }

    fn after_load(&mut self) -> Result<()> {
        self.names.clear();
        let mut duplicated = false;

        for (handle, entry) in self.core.iter() {
            let Some(key) = &entry.key else {
                continue;
            };

            // The first entry keeps the key, so the index stays usable after a failed merge.
            if self.names.contains_key(key) {
                duplicated = true;
            } else {
                self.names.insert(key.clone(), handle);
            }
        }

        if duplicated {
            return Err(duplicate_key());
        }

        Ok(())
    }
}

fn duplicate_key() -> Error {
    Error::malformed("two entries are registered under the same key")
}

impl<K, T> NamedState<K, T>
where
    K: Clone + Eq + Hash,
{
    /// Returns the existing entry with an added reference, or stores a new one. The unused key
    /// and value are handed back when the key was already present.
    fn acquire_or_reuse(&mut self, key: K, value: T) -> (StrongHandle, Option<(K, T)>) {
        if let Some(&existing) = self.names.get(&key) {
            self.core.increment(existing);
            return (existing, Some((key, value)));
        }

        let handle = self.core.acquire(NamedEntry {
            value,
            key: Some(key.clone()),
        });
        self.names.insert(key, handle);

        (handle, None)
    }
}

/// A pool whose values are registered under unique keys.
///
/// Works like [`Pool`][crate::Pool], with a key index on top: acquiring a key that is already
/// present returns the existing value instead of storing a new one, and the key is removed from
/// the index in lockstep with its value. Handles are the same [`Handle<T>`], [`StrongHandle`] and
/// [`WeakHandle`] types as for anonymous pools.
///
/// # Examples
///
/// ```
/// use handle_pool::{NamedPool, Registry};
///
/// let registry = Registry::new();
/// let textures = NamedPool::<String, Vec<u8>>::new(&registry);
///
/// let (first, is_new) = textures.acquire("grass".to_string(), vec![1, 2, 3]);
/// assert!(is_new);
///
/// // The same key yields the same value; the new value is discarded.
/// let (second, is_new) = textures.acquire("grass".to_string(), vec![9]);
/// assert!(!is_new);
/// assert_eq!(first, second);
/// assert_eq!(*second.get(), vec![1, 2, 3]);
///
/// drop(first);
/// drop(second);
///
/// // The name went away with the value.
/// assert!(textures.handle_of("grass").is_none());
/// ```
pub struct NamedPool<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: 'static,
{
    shared: Rc<PoolShared<NamedState<K, T>>>,
}

impl<K, T> NamedPool<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: 'static,
{
    /// Creates a builder for configuring and constructing a [`NamedPool`].
    #[inline]
    pub fn builder() -> NamedPoolBuilder<K, T> {
        NamedPoolBuilder::new()
    }

    /// Creates a named pool with default settings, registered in `registry`.
    ///
    /// # Panics
    ///
    /// Panics if the registry already holds the maximum number of pools.
    #[must_use]
    pub fn new(registry: &Registry) -> Self {
        Self::builder().build(registry)
    }

    pub(crate) fn from_shared(shared: Rc<PoolShared<NamedState<K, T>>>) -> Self {
        Self { shared }
    }

    pub(crate) fn new_state(core: PoolCore<NamedEntry<K, T>>) -> NamedState<K, T> {
        NamedState {
            core,
            names: HashMap::default(),
        }
    }

    /// The ID under which the pool is registered.
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

    /// Whether [`lock()`](Self::lock) would currently succeed for the weak handle.
    #[must_use]
    pub fn is_live(&self, weak: WeakHandle) -> bool {
        self.shared.is_live(weak)
    }

    /// The number of values in the pool, including values whose key was moved elsewhere by
    /// [`replace()`](Self::replace).
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Whether the pool holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a handle to the value registered under `key`, storing `value` under it first if
    /// the key is not present. The flag is `true` if `value` was stored.
    ///
    /// If the key is present, `value` is dropped and the existing value is left unchanged.
    ///
    /// # Panics
    ///
    /// Panics if every slot of the pool is in use or the pool is being saved or loaded.
    pub fn acquire(&self, key: K, value: T) -> (Handle<T>, bool) {
        let (raw, unused) = self
            .shared
            .with_state_mut("acquire", |state| state.acquire_or_reuse(key, value));

        let is_new = unused.is_none();
        drop(unused);

        (Handle::adopt(self.typed(), raw), is_new)
    }

    /// Like [`acquire()`](Self::acquire), but only creates the value if the key is not present.
    ///
    /// # Panics
    ///
    /// Panics if every slot of the pool is in use or the pool is being saved or loaded.
    pub fn acquire_or_insert_with(&self, key: K, make: impl FnOnce() -> T) -> (Handle<T>, bool) {
        if let Some(existing) = self.handle_of(&key) {
            return (existing, false);
        }

        // The callback runs with no borrow of the pool, so it may use the pool itself.
        self.acquire(key, make())
    }

    /// Stores `value` under `key`, moving the name away from any value previously registered
    /// under it.
    ///
    /// The previous value is not released: whoever holds references to it keeps them, and it is
    /// freed when the last of them is released. Only the name is repointed.
    ///
    /// # Panics
    ///
    /// Panics if every slot of the pool is in use or the pool is being saved or loaded.
    pub fn replace(&self, key: K, value: T) -> Handle<T> {
        let raw = self.shared.with_state_mut("replace", |state| {
            if let Some(previous) = state.names.remove(&key) {
                state.core.get_mut_untracked(previous).key = None;
            }

            let (raw, unused) = state.acquire_or_reuse(key, value);
            debug_assert!(unused.is_none(), "the key was removed above");
            raw
        });

        Handle::adopt(self.typed(), raw)
    }

    /// Removes a strong reference, returning `true` if this freed the value. A freed value's key
    /// is removed from the index.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool or the pool is being
    /// saved or loaded.
    pub fn release(&self, handle: StrongHandle) -> bool {
        self.shared.release(handle)
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

    /// Returns an owning handle to the value registered under `key`, if any.
    ///
    /// # Panics
    ///
    /// Panics if the pool is being saved or loaded.
    #[must_use]
    pub fn handle_of<Q>(&self, key: &Q) -> Option<Handle<T>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let raw = self.shared.with_state_mut("handle_of", |state| {
            let raw = *state.names.get(key)?;
            state.core.increment(raw);
            Some(raw)
        })?;

        Some(Handle::adopt(self.typed(), raw))
    }

    /// The raw handle registered under `key`, or [`StrongHandle::INVALID`]. No reference is added.
    #[must_use]
    pub fn raw_handle_of<Q>(&self, key: &Q) -> StrongHandle
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared
            .state()
            .names
            .get(key)
            .copied()
            .unwrap_or(StrongHandle::INVALID)
    }

    /// Whether a value is registered under `key`.
    #[must_use]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shared.state().names.contains_key(key)
    }

    /// The key the value is registered under, or `None` if its name was moved elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool.
    #[must_use]
    pub fn key_of(&self, handle: StrongHandle) -> Option<K> {
        self.shared.state().core.get(handle).key.clone()
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
    #[must_use]
    pub fn lock(&self, weak: WeakHandle) -> Option<Handle<T>> {
        let raw = self.lock_raw(weak);
        raw.is_valid().then(|| Handle::adopt(self.typed(), raw))
    }

    /// Turns a weak handle into a strong handle that the caller owns, or returns
    /// [`StrongHandle::INVALID`] if the value it was made for no longer exists.
    #[must_use]
    pub fn lock_raw(&self, weak: WeakHandle) -> StrongHandle {
        self.shared.lock(weak)
    }

    /// Borrows the value. Does not count as a modification.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live value of this pool.
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

    /// Calls `f` for every value with the key it is registered under, in storage order.
    ///
    /// The pool is borrowed for the duration, so `f` must not mutate it.
    pub fn for_each(&self, mut f: impl FnMut(StrongHandle, Option<&K>, &T)) {
        let state = self.shared.state();

        for (handle, entry) in state.core.iter() {
            f(handle, entry.key.as_ref(), &entry.value);
        }
    }

    /// Drops every value and forgets every key. All outstanding handles become stale.
    ///
    /// # Panics
    ///
    /// Panics if the pool is being saved or loaded.
    pub fn clear(&self) {
        self.shared.clear();
    }

    /// Writes the contents of the pool, including the key of every value.
    ///
    /// # Panics
    ///
    /// Panics if the pool is already being saved or loaded.
    pub fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode)
    where
        K: Persist,
        T: Persist,
    {
        self.shared.save(encoder, mode);
    }

    /// Replaces or updates the contents of the pool from saved data and rebuilds the key index.
    ///
    /// See [`Pool::load()`][crate::Pool::load] for how the modes differ.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is malformed, was saved in a different mode or registers
    /// two values under the same key.
    ///
    /// # Panics
    ///
    /// Panics if the pool is already being saved or loaded.
    pub fn load(&self, decoder: &mut dyn Decoder, mode: SaveMode) -> Result<LoadSummary>
    where
        K: Persist,
        T: Persist,
    {
        self.shared.load(decoder, mode)
    }

    fn typed(&self) -> Rc<dyn TypedPool<T>> {
        Rc::<PoolShared<NamedState<K, T>>>::clone(&self.shared)
    }
}

impl<K, T> Clone for NamedPool<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<K, T> fmt::Debug for NamedPool<K, T>
where
    K: Clone + Eq + Hash + 'static,
    T: 'static,
{
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedPool")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{ByteReader, ByteWriter};

    assert_not_impl_any!(NamedPool<String, u32>: Send, Sync);

    fn pool(registry: &Registry) -> NamedPool<String, u32> {
        NamedPool::new(registry)
    }

    #[test]
    fn acquire_same_key_returns_same_value() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let (first, is_new) = pool.acquire("a".to_string(), 1);
        assert!(is_new);

        let (second, is_new) = pool.acquire("a".to_string(), 2);
        assert!(!is_new);

        assert_eq!(first.raw(), second.raw());
        assert_eq!(*second.get(), 1);
        assert_eq!(first.count(), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn acquire_or_insert_with_skips_factory_for_present_key() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let (_first, _) = pool.acquire("a".to_string(), 1);

        let (existing, is_new) =
            pool.acquire_or_insert_with("a".to_string(), || panic!("must not be called"));
        assert!(!is_new);
        assert_eq!(*existing.get(), 1);

        let (fresh, is_new) = pool.acquire_or_insert_with("b".to_string(), || 2);
        assert!(is_new);
        assert_eq!(*fresh.get(), 2);
    }

    #[test]
    fn release_to_zero_erases_the_name() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let (handle, _) = pool.acquire("a".to_string(), 1);
        let raw = handle.into_raw();

        assert_eq!(pool.raw_handle_of("a"), raw);
        assert!(pool.release(raw));

        assert!(!pool.contains_key("a"));
        assert_eq!(pool.raw_handle_of("a"), StrongHandle::INVALID);
        assert!(pool.is_empty());
    }

    #[test]
    fn release_above_zero_keeps_the_name() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let (first, _) = pool.acquire("a".to_string(), 1);
        let (second, _) = pool.acquire("a".to_string(), 1);

        drop(first);
        assert!(pool.contains_key("a"));

        drop(second);
        assert!(!pool.contains_key("a"));
    }

    #[test]
    fn replace_detaches_previous_value() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let (old, _) = pool.acquire("a".to_string(), 1);
        let new = pool.replace("a".to_string(), 2);

        assert_ne!(old.raw(), new.raw());
        assert_eq!(pool.raw_handle_of("a"), new.raw());
        assert_eq!(pool.key_of(old.raw()), None);
        assert_eq!(pool.key_of(new.raw()), Some("a".to_string()));

        // The old value is still usable by whoever holds it.
        assert_eq!(*old.get(), 1);
        assert_eq!(pool.len(), 2);

        // Releasing the detached value must not remove the new mapping.
        drop(old);
        assert_eq!(pool.raw_handle_of("a"), new.raw());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn replace_of_absent_key_just_inserts() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let handle = pool.replace("z".to_string(), 26);

        assert_eq!(pool.raw_handle_of("z"), handle.raw());
        assert_eq!(handle.count(), 1);
    }

    #[test]
    fn handle_of_adds_a_reference() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let (handle, _) = pool.acquire("a".to_string(), 1);
        let looked_up = pool.handle_of("a").unwrap();

        assert_eq!(handle.count(), 2);
        assert_eq!(looked_up, handle);
        assert!(pool.handle_of("missing").is_none());
    }

    #[test]
    fn weak_handle_does_not_lock_after_name_reuse() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let (handle, _) = pool.acquire("a".to_string(), 1);
        let weak = handle.weak();
        drop(handle);

        let (_again, is_new) = pool.acquire("a".to_string(), 2);
        assert!(is_new);
        assert!(pool.lock(weak).is_none());
    }

    #[test]
    fn clear_forgets_every_key() {
        let registry = Registry::new();
        let pool = pool(&registry);

        let raw = pool.acquire("a".to_string(), 1).0.into_raw();
        pool.clear();

        assert!(!pool.contains_key("a"));
        assert!(pool.is_empty());

        let (_fresh, is_new) = pool.acquire("a".to_string(), 3);
        assert!(is_new);
        assert_eq!(pool.raw_handle_of("a").index(), raw.index());
    }

    #[test]
    fn save_and_load_rebuild_the_index() {
        let registry = Registry::new();
        let source = pool(&registry);

        let a = source.acquire("a".to_string(), 1).0.into_raw();
        let b = source.acquire("b".to_string(), 2).0.into_raw();
        let detached = source.acquire("c".to_string(), 3).0.into_raw();
        let _c = source.replace("c".to_string(), 30).into_raw();

        let mut writer = ByteWriter::new();
        source.save(&mut writer, SaveMode::Full);
        let bytes = writer.into_bytes();

        let target = pool(&registry);
        let mut reader = ByteReader::new(&bytes);
        let summary = target.load(&mut reader, SaveMode::Full).unwrap();

        assert_eq!(summary.added, 4);
        assert_eq!(target.raw_handle_of("a").index(), a.index());
        assert_eq!(target.raw_handle_of("b").index(), b.index());
        assert_eq!(*target.get(target.raw_handle_of("c")), 30);
        assert_ne!(target.raw_handle_of("c").index(), detached.index());

        let mut keys = Vec::new();
        target.for_each(|_, key, value| keys.push((key.cloned(), *value)));
        keys.sort_unstable();

        assert_eq!(
            keys,
            vec![
                (None, 3),
                (Some("a".to_string()), 1),
                (Some("b".to_string()), 2),
                (Some("c".to_string()), 30),
            ]
        );
    }

    #[test]
    fn load_with_duplicate_keys_is_malformed() {
        let registry = Registry::new();
        let source = NamedPool::<String, u32>::new(&registry);
        let other = NamedPool::<String, u32>::new(&registry);

        let _a = source.acquire("a".to_string(), 1).0.into_raw();
        let _b = source.acquire("b".to_string(), 2).0.into_raw();

        let mut writer = ByteWriter::new();
        source.save(&mut writer, SaveMode::Full);

        // Rewrite the second key from "b" to "a" in place.
        let mut bytes = writer.into_bytes();
        let position = bytes.iter().rposition(|&byte| byte == b'b').unwrap();
        bytes[position] = b'a';

        let _keep = other.acquire("keep".to_string(), 7);

        let mut reader = ByteReader::new(&bytes);
        let result = other.load(&mut reader, SaveMode::Full);

        assert!(matches!(result, Err(Error::Malformed { .. })));

        // A rejected full load leaves the contents and the key index as they were.
        assert_eq!(other.len(), 1);
        assert!(other.contains_key("keep"));
        assert!(!other.contains_key("a"));
        assert_eq!(*other.get(other.raw_handle_of("keep")), 7);
    }
}
