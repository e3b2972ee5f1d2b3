use std::any::{Any, TypeId, type_name};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};
use std::thread;

use tracing::{debug, warn};

use crate::pool_core::PoolCore;
use crate::{
    Decoder, DropPolicy, Encoder, LoadSummary, Locator, Persist, PoolId, Registry, Result,
    SaveMode, StrongHandle, WeakHandle,
};

/// Turns fetched resource bytes into something a pool can store, or declines them.
pub(crate) type ResourceFactory<R> = Box<dyn Fn(&Locator, &[u8]) -> Option<R>>;

/// The mutable state of one pool flavor, wrapping a [`PoolCore`] with whatever side tables the
/// flavor needs.
pub(crate) trait PoolState: 'static {
    /// What the pool stores per slot.
    type Stored;

    /// What callers see through handles.
    type Item: 'static;

    /// What a resource factory produces for this flavor.
    type Resource;

    fn core(&self) -> &PoolCore<Self::Stored>;

    fn core_mut(&mut self) -> &mut PoolCore<Self::Stored>;

    fn item(stored: &Self::Stored) -> &Self::Item;

    fn item_mut(stored: &mut Self::Stored) -> &mut Self::Item;

    /// Stores a resource produced by the factory, returning an owned strong handle.
    ///
    /// Anything the flavor decided not to keep is handed back so it can be dropped outside the
    /// state borrow.
    fn insert_resource(&mut self, resource: Self::Resource)
    -> (StrongHandle, Option<Self::Resource>);

    /// Called when a release freed a slot, before the stored value is dropped.
    fn on_freed(&mut self, _handle: StrongHandle, _stored: &Self::Stored) {}

    /// Called after every slot has been removed at once.
    fn on_cleared(&mut self) {}

    /// Vets the complete contents of a full load before any of it replaces the pool contents.
    fn check_full_load(_incoming: &[&Self::Stored]) -> Result<()> {
        Ok(())
    }

    /// Called after a successful load replaced some or all slots.
    fn after_load(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Everything one pool owns. Shared between the pool object, its typed handles and (weakly)
/// the registry.
pub(crate) struct PoolShared<S: PoolState> {
    id: PoolId,
    name: String,
    registry: Registry,
    drop_policy: DropPolicy,
    factory: Option<ResourceFactory<S::Resource>>,

    /// Set for the duration of a save or load. Mutating the pool meanwhile is a contract
    /// violation.
    serializing: Cell<bool>,

    state: RefCell<S>,
}

impl<S: PoolState> PoolShared<S> {
    /// Creates the pool and registers it, so the state can be built with the assigned pool ID.
    pub(crate) fn new_registered(
        registry: &Registry,
        name: String,
        drop_policy: DropPolicy,
        factory: Option<ResourceFactory<S::Resource>>,
        make_state: impl FnOnce(PoolId) -> S,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<Self>| {
            let dispatch: Weak<dyn PoolDispatch> = weak.clone();
            let typed: Weak<dyn TypedPool<S::Item>> = weak.clone();

            let registration = registry.register(dispatch, Box::new(typed), &name);

            let mut state = make_state(registration.pool_id);
            state
                .core_mut()
                .resume_weak_generations(registration.weak_generation_floor);

            Self {
                id: registration.pool_id,
                name,
                registry: registry.clone(),
                drop_policy,
                factory,
                serializing: Cell::new(false),
                state: RefCell::new(state),
            }
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn len(&self) -> usize {
        self.state.borrow().core().len()
    }

    /// Read access to the state. Allowed while serializing.
    pub(crate) fn state(&self) -> Ref<'_, S> {
        self.state.borrow()
    }

    /// Runs a mutation of the state.
    ///
    /// # Panics
    ///
    /// Panics if the pool is being saved or loaded.
    pub(crate) fn with_state_mut<R>(&self, operation: &str, f: impl FnOnce(&mut S) -> R) -> R {
        self.assert_not_serializing(operation);
        f(&mut self.state.borrow_mut())
    }

    pub(crate) fn acquire_with(
        &self,
        make: impl FnOnce(WeakHandle) -> S::Stored,
    ) -> StrongHandle {
        self.with_state_mut("acquire", |state| state.core_mut().acquire_with(make))
    }

    pub(crate) fn increment(&self, handle: StrongHandle) {
        self.with_state_mut("increment", |state| state.core_mut().increment(handle));
    }

    /// Returns whether the release freed the slot. The freed value is dropped after the state
    /// borrow ends, so its destructor may use this pool again.
    pub(crate) fn release(&self, handle: StrongHandle) -> bool {
        let freed = self.with_state_mut("release", |state| {
            let freed = state.core_mut().release(handle);

            if let Some(stored) = &freed {
                state.on_freed(handle, stored);
            }

            freed
        });

        freed.is_some()
    }

    pub(crate) fn count(&self, handle: StrongHandle) -> u32 {
        self.state.borrow().core().count(handle)
    }

    pub(crate) fn access_count(&self, handle: StrongHandle) -> u32 {
        self.state.borrow().core().access_count(handle)
    }

    pub(crate) fn weak(&self, handle: StrongHandle) -> WeakHandle {
        self.state.borrow().core().weak(handle)
    }

    pub(crate) fn lock(&self, weak: WeakHandle) -> StrongHandle {
        self.with_state_mut("lock", |state| state.core_mut().lock(weak))
    }

    pub(crate) fn is_live(&self, weak: WeakHandle) -> bool {
        self.state.borrow().core().is_live(weak)
    }

    pub(crate) fn get(&self, handle: StrongHandle) -> Ref<'_, S::Item> {
        Ref::map(self.state.borrow(), |state| S::item(state.core().get(handle)))
    }

    pub(crate) fn get_mut(&self, handle: StrongHandle) -> RefMut<'_, S::Item> {
        self.assert_not_serializing("get_mut");

        RefMut::map(self.state.borrow_mut(), |state| {
            S::item_mut(state.core_mut().get_mut(handle))
        })
    }

    pub(crate) fn handles(&self) -> Vec<StrongHandle> {
        self.state.borrow().core().handles()
    }

    /// Removes every entry. Outstanding handles become stale.
    pub(crate) fn clear(&self) {
        let drained = self.with_state_mut("clear", |state| {
            let drained = state.core_mut().drain();
            state.on_cleared();
            drained
        });

        drop(drained);
    }

    pub(crate) fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode)
    where
        S::Stored: Persist,
    {
        self.enter_serializing("save");
        let guard = scopeguard::guard((), |()| self.serializing.set(false));

        self.state.borrow().core().save(encoder, mode);

        drop(guard);
    }

    pub(crate) fn load(&self, decoder: &mut dyn Decoder, mode: SaveMode) -> Result<LoadSummary>
    where
        S::Stored: Persist,
    {
        self.enter_serializing("load");
        let guard = scopeguard::guard((), |()| self.serializing.set(false));

        let ((summary, removed), rebuilt) = {
            let mut state = self.state.borrow_mut();
            let loaded = state
                .core_mut()
                .load(decoder, mode, S::check_full_load)?;
            (loaded, state.after_load())
        };

        drop(guard);

        if let Err(error) = rebuilt {
            // The removed values may release handles into this pool when dropped.
            drop(removed);
            return Err(error);
        }

        debug!(
            pool = %self.name,
            pool_id = %self.id,
            ?mode,
            added = summary.added,
            replaced = summary.replaced,
            skipped = summary.skipped,
            removed = summary.removed,
            "pool contents loaded"
        );

        // The removed values may release handles into this pool when dropped.
        drop(removed);

        Ok(summary)
    }

    fn enter_serializing(&self, operation: &str) {
        assert!(
            !self.serializing.replace(true),
            "{operation}() on pool '{}' while it is already being saved or loaded",
            self.name
        );
    }

    fn assert_not_serializing(&self, operation: &str) {
        assert!(
            !self.serializing.get(),
            "{operation}() on pool '{}' while it is being saved or loaded",
            self.name
        );
    }
}

impl<S: PoolState> Drop for PoolShared<S> {
    fn drop(&mut self) {
        let last_weak_generation = self.state.get_mut().core().weak_generation();
        self.registry.unregister(self.id, last_weak_generation);

        let state = self.state.get_mut();
        let drained = state.core_mut().drain();
        state.on_cleared();

        // Every slot is released once. Anything that was referenced more than once was leaked.
        let leaked = drained.iter().filter(|(count, _)| *count > 1).count();

        if leaked > 0 {
            match self.drop_policy {
                DropPolicy::ReportLeaks => {
                    warn!(
                        pool = %self.name,
                        pool_id = %self.id,
                        leaked,
                        "pool dropped while items were still referenced"
                    );
                }
                DropPolicy::MustNotLeak => {
                    // Panicking again during a panic would abort, hiding the original panic.
                    if !thread::panicking() {
                        panic!(
                            "pool '{}' dropped while {leaked} items were still referenced",
                            self.name
                        );
                    }
                }
            }
        }

        drop(drained);
    }
}

/// The type-erased face of a pool, used by the registry to dispatch handle operations without
/// knowing the item type.
pub(crate) trait PoolDispatch {
    fn pool_id(&self) -> PoolId;

    fn name(&self) -> &str;

    fn registry(&self) -> &Registry;

    fn item_type(&self) -> TypeId;

    fn item_type_name(&self) -> &'static str;

    fn len(&self) -> usize;

    fn increment(&self, handle: StrongHandle);

    fn release(&self, handle: StrongHandle) -> bool;

    fn count(&self, handle: StrongHandle) -> u32;

    fn weak(&self, handle: StrongHandle) -> WeakHandle;

    fn lock(&self, weak: WeakHandle) -> StrongHandle;

    fn item_any(&self, handle: StrongHandle) -> Ref<'_, dyn Any + 'static>;

    /// Offers fetched bytes to the pool. Returns an owned strong handle if the pool took them.
    fn load_resource(&self, locator: &Locator, bytes: &[u8]) -> Option<StrongHandle>;
}

/// The typed face of a pool, used by [`Handle<T>`][crate::Handle].
pub(crate) trait TypedPool<T>: PoolDispatch {
    fn borrow_item(&self, handle: StrongHandle) -> Ref<'_, T>;

    fn borrow_item_mut(&self, handle: StrongHandle) -> RefMut<'_, T>;
}

impl<S: PoolState> PoolDispatch for PoolShared<S> {
    fn pool_id(&self) -> PoolId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn registry(&self) -> &Registry {
        &self.registry
    }

    fn item_type(&self) -> TypeId {
        TypeId::of::<S::Item>()
    }

    fn item_type_name(&self) -> &'static str {
        type_name::<S::Item>()
    }

    fn len(&self) -> usize {
        Self::len(self)
    }

    fn increment(&self, handle: StrongHandle) {
        Self::increment(self, handle);
    }

    fn release(&self, handle: StrongHandle) -> bool {
        Self::release(self, handle)
    }

    fn count(&self, handle: StrongHandle) -> u32 {
        Self::count(self, handle)
    }

    fn weak(&self, handle: StrongHandle) -> WeakHandle {
        Self::weak(self, handle)
    }

    fn lock(&self, weak: WeakHandle) -> StrongHandle {
        Self::lock(self, weak)
    }

    fn item_any(&self, handle: StrongHandle) -> Ref<'_, dyn Any + 'static> {
        Ref::map(self.get(handle), |item| {
            let item: &(dyn Any + 'static) = item;
            item
        })
    }

    fn load_resource(&self, locator: &Locator, bytes: &[u8]) -> Option<StrongHandle> {
        let factory = self.factory.as_ref()?;

        // The factory runs without any borrow of the state.
        let resource = factory(locator, bytes)?;

        let (handle, unused) =
            self.with_state_mut("load_resource", |state| state.insert_resource(resource));

        drop(unused);
        Some(handle)
    }
}

impl<S: PoolState> TypedPool<S::Item> for PoolShared<S> {
    fn borrow_item(&self, handle: StrongHandle) -> Ref<'_, S::Item> {
        self.get(handle)
    }

    fn borrow_item_mut(&self, handle: StrongHandle) -> RefMut<'_, S::Item> {
        self.get_mut(handle)
    }
}
