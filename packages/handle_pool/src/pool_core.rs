use std::num::NonZero;

use foldhash::{HashSet, HashSetExt};
use tracing::trace;

use crate::handle::{STRONG_GENERATION_CHECKS, STRONG_GENERATION_MASK, WEAK_GENERATION_MASK};
use crate::persist::{decode_blob, decode_blob_into, encode_blob};
use crate::{
    Decoder, Encoder, Error, LoadSummary, Persist, PoolId, Result, SaveMode, SlotTable,
    StrongHandle, WeakHandle,
};

/// One occupied slot of a pool.
#[derive(Debug)]
pub(crate) struct Entry<E> {
    pub(crate) data: E,

    /// The slot is freed when this reaches zero.
    strong_count: u32,

    /// Bumped on every mutable access. Only the merge load looks at it.
    access_count: u32,

    /// Stamped from the pool counter whenever the slot is allocated.
    weak_generation: u64,

    /// Always zero unless strong-generation checks are enabled (or it was restored by a load).
    strong_generation: u8,
}

/// The bookkeeping shared by every pool flavor: slot storage, reference counts and generations.
///
/// All operations that take a strong handle treat a mismatching handle as a contract violation
/// and panic. Only `lock()` treats a mismatch as an expected outcome.
#[derive(Debug)]
pub(crate) struct PoolCore<E> {
    slots: SlotTable<Entry<E>>,
    pool_id: PoolId,

    /// The generation most recently handed out. Wraps at the weak generation field width.
    weak_generation: u64,

    /// The generation most recently handed out. Wraps at the strong generation field width.
    strong_generation: u8,
}

/// The slot-level fields of one saved entry, read before its data is applied.
struct Record {
    id: u32,
    strong_count: u32,
    strong_generation: u8,
    access_count: u32,
    weak_generation: u64,
    blob: Vec<u8>,
}

impl<E> PoolCore<E> {
    pub(crate) fn new(pool_id: PoolId, slot_limit: NonZero<u32>) -> Self {
        Self {
            slots: SlotTable::with_id_limit(slot_limit),
            pool_id,
            weak_generation: 0,
            strong_generation: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// The weak generation most recently handed out.
    #[inline]
    pub(crate) fn weak_generation(&self) -> u64 {
        self.weak_generation
    }

    /// Makes every weak generation minted from now on higher than `floor`.
    ///
    /// A pool that takes over the ID of a dropped pool starts from the last generation the
    /// dropped pool handed out, so the dropped pool's weak handles can never match.
    pub(crate) fn resume_weak_generations(&mut self, floor: u64) {
        self.weak_generation = self.weak_generation.max(floor & WEAK_GENERATION_MASK);
    }

    #[inline]
    pub(crate) fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Stores a new entry with a strong count of one.
    ///
    /// The callback receives the weak handle the new entry will have, so a value can learn its
    /// own identity before it is stored.
    pub(crate) fn acquire_with(&mut self, make: impl FnOnce(WeakHandle) -> E) -> StrongHandle {
        let Some(id) = self.slots.next_id() else {
            panic!(
                "pool {} is exhausted: all {} slots are in use",
                self.pool_id,
                self.slots.id_limit()
            );
        };

        let weak_generation = self.mint_weak_generation();
        let strong_generation = self.mint_strong_generation();

        let data = make(WeakHandle::new(id, self.pool_id, weak_generation));

        let added = self.slots.add(Entry {
            data,
            strong_count: 1,
            access_count: 0,
            weak_generation,
            strong_generation,
        });
        debug_assert_eq!(added, id, "slot table handed out an ID other than next_id()");

        StrongHandle::new(id, self.pool_id, strong_generation)
    }

    pub(crate) fn acquire(&mut self, data: E) -> StrongHandle {
        self.acquire_with(|_| data)
    }

    pub(crate) fn increment(&mut self, handle: StrongHandle) {
        let entry = self.entry_mut(handle, "increment");

        entry.strong_count = entry
            .strong_count
            .checked_add(1)
            .unwrap_or_else(|| panic!("strong count of {handle:?} overflowed"));
    }

    /// Decrements the strong count. Returns the data if this freed the slot.
    pub(crate) fn release(&mut self, handle: StrongHandle) -> Option<E> {
        let entry = self.entry_mut(handle, "release");

        entry.strong_count = entry
            .strong_count
            .checked_sub(1)
            .expect("an occupied slot always has a positive strong count");

        (entry.strong_count == 0).then(|| self.slots.remove(handle.index()).data)
    }

    pub(crate) fn count(&self, handle: StrongHandle) -> u32 {
        self.entry(handle, "count").strong_count
    }

    pub(crate) fn access_count(&self, handle: StrongHandle) -> u32 {
        self.entry(handle, "access_count").access_count
    }

    pub(crate) fn weak(&self, handle: StrongHandle) -> WeakHandle {
        let entry = self.entry(handle, "weak");
        WeakHandle::new(handle.index(), self.pool_id, entry.weak_generation)
    }

    /// Turns a weak handle into a strong one if it still refers to the entry it was made for.
    ///
    /// Returns [`StrongHandle::INVALID`] otherwise. The slot index alone is never trusted; the
    /// weak generation must match in every build configuration.
    pub(crate) fn lock(&mut self, weak: WeakHandle) -> StrongHandle {
        if !weak.is_valid() || weak.pool_id() != self.pool_id {
            return StrongHandle::INVALID;
        }

        match self.slots.try_get_mut(weak.index()) {
            Some(entry) if entry.weak_generation == weak.generation() => {
                // An overflowing count cannot be handed out as a new reference.
                let Some(count) = entry.strong_count.checked_add(1) else {
                    return StrongHandle::INVALID;
                };

                entry.strong_count = count;
                StrongHandle::new(weak.index(), self.pool_id, entry.strong_generation)
            }
            _ => StrongHandle::INVALID,
        }
    }

    /// Whether the weak handle would currently lock successfully.
    pub(crate) fn is_live(&self, weak: WeakHandle) -> bool {
        weak.is_valid()
            && weak.pool_id() == self.pool_id
            && self
                .slots
                .try_get(weak.index())
                .is_some_and(|entry| entry.weak_generation == weak.generation())
    }

    pub(crate) fn get(&self, handle: StrongHandle) -> &E {
        &self.entry(handle, "get").data
    }

    /// Mutable access that counts as a modification for the merge load.
    pub(crate) fn get_mut(&mut self, handle: StrongHandle) -> &mut E {
        let entry = self.entry_mut(handle, "get_mut");
        entry.access_count = entry.access_count.wrapping_add(1);
        &mut entry.data
    }

    /// Mutable access for internal bookkeeping that must not look like a modification.
    pub(crate) fn get_mut_untracked(&mut self, handle: StrongHandle) -> &mut E {
        &mut self.entry_mut(handle, "get_mut").data
    }

    /// Strong handles to every entry, in storage order. Does not touch the strong counts.
    pub(crate) fn handles(&self) -> Vec<StrongHandle> {
        self.slots
            .iter()
            .map(|(id, entry)| self.handle_for(id, entry))
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (StrongHandle, &E)> {
        self.slots
            .iter()
            .map(|(id, entry)| (self.handle_for(id, entry), &entry.data))
    }

    /// Empties the pool, returning the data of every entry together with its strong count.
    ///
    /// The weak generation counter is kept, so weak handles issued before the drain never lock
    /// again even though the slot IDs start over.
    pub(crate) fn drain(&mut self) -> Vec<(u32, E)> {
        self.slots
            .drain()
            .into_iter()
            .map(|(_, entry)| (entry.strong_count, entry.data))
            .collect()
    }

    /// Writes every entry to the encoder.
    pub(crate) fn save(&self, encoder: &mut dyn Encoder, mode: SaveMode)
    where
        E: Persist,
    {
        let merge = mode == SaveMode::Merge;

        encoder.put_u8(mode.tag());

        if merge {
            encoder.put_u64(self.weak_generation);
        }

        encoder.put_u32(
            u32::try_from(self.slots.len()).expect("slot count is bounded by a u32 slot limit"),
        );

        for (id, entry) in self.slots.iter() {
            encoder.put_u32(id);
            encoder.put_u32(entry.strong_count);
            encoder.put_u8(entry.strong_generation);

            if merge {
                encoder.put_u32(entry.access_count);
                encoder.put_u64(entry.weak_generation);
            }

            encoder.put_bytes(&encode_blob(&entry.data, mode));
        }
    }

    /// Applies saved entries to the pool.
    ///
    /// Returns the values that were removed from the pool, which the caller drops once it no
    /// longer holds any borrow of the pool.
    ///
    /// A full load decodes everything and passes it to `check_full` before touching the pool, so
    /// on failure the pool is unchanged. A merge load applies entries one by one and only then
    /// removes the entries missing from the input; on failure the entries applied so far remain
    /// applied and nothing has been removed.
    pub(crate) fn load(
        &mut self,
        decoder: &mut dyn Decoder,
        mode: SaveMode,
        check_full: impl FnOnce(&[&E]) -> Result<()>,
    ) -> Result<(LoadSummary, Vec<E>)>
    where
        E: Persist,
    {
        let stored = SaveMode::from_tag(decoder.take_u8()?)?;

        if stored != mode {
            return Err(Error::ModeMismatch {
                stored,
                requested: mode,
            });
        }

        let merge = mode == SaveMode::Merge;

        let incoming_weak_generation = if merge {
            decoder.take_u64()? & WEAK_GENERATION_MASK
        } else {
            0
        };

        let records = self.read_records(decoder, merge)?;

        if merge {
            self.apply_merge(records, incoming_weak_generation)
        } else {
            self.apply_full(records, check_full)
        }
    }

    fn read_records(&self, decoder: &mut dyn Decoder, merge: bool) -> Result<Vec<Record>> {
        let count = decoder.take_u32()?;

        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for _ in 0..count {
            let id = decoder.take_u32()?;
            let strong_count = decoder.take_u32()?;
            let strong_generation = decoder.take_u8()? & STRONG_GENERATION_MASK;

            let (access_count, weak_generation) = if merge {
                (decoder.take_u32()?, decoder.take_u64()? & WEAK_GENERATION_MASK)
            } else {
                (0, 0)
            };

            let blob = decoder.take_bytes()?;

            if id >= self.slots.id_limit().get() {
                return Err(Error::malformed(format!(
                    "slot {id} is beyond the slot limit {} of pool {}",
                    self.slots.id_limit(),
                    self.pool_id
                )));
            }

            if strong_count == 0 {
                return Err(Error::malformed(format!(
                    "slot {id} has a strong count of zero"
                )));
            }

            if !seen.insert(id) {
                return Err(Error::malformed(format!("slot {id} appears more than once")));
            }

            records.push(Record {
                id,
                strong_count,
                strong_generation,
                access_count,
                weak_generation,
                blob,
            });
        }

        Ok(records)
    }

    fn apply_full(
        &mut self,
        records: Vec<Record>,
        check_full: impl FnOnce(&[&E]) -> Result<()>,
    ) -> Result<(LoadSummary, Vec<E>)>
    where
        E: Persist,
    {
        let mut decoded = Vec::with_capacity(records.len());

        for record in records {
            let data = decode_blob::<E>(&record.blob, SaveMode::Full)?;
            decoded.push((record, data));
        }

        let incoming: Vec<&E> = decoded.iter().map(|(_, data)| data).collect();
        check_full(&incoming)?;

        let removed: Vec<E> = self.drain().into_iter().map(|(_, data)| data).collect();

        let mut summary = LoadSummary {
            removed: removed.len(),
            ..LoadSummary::default()
        };

        for (record, data) in decoded {
            // Weak handles never survive a full load.
            let weak_generation = self.mint_weak_generation();

            self.slots.insert_at(
                record.id,
                Entry {
                    data,
                    strong_count: record.strong_count,
                    access_count: 0,
                    weak_generation,
                    strong_generation: record.strong_generation,
                },
            );

            summary.added = summary.added.wrapping_add(1);
        }

        Ok((summary, removed))
    }

    fn apply_merge(
        &mut self,
        records: Vec<Record>,
        incoming_weak_generation: u64,
    ) -> Result<(LoadSummary, Vec<E>)>
    where
        E: Persist,
    {
        let mut summary = LoadSummary::default();

        let incoming_ids: HashSet<u32> = records.iter().map(|record| record.id).collect();

        // Collected up front, since the inserts below only ever land on vacant IDs.
        let absent: Vec<u32> = self
            .slots
            .ids()
            .iter()
            .copied()
            .filter(|id| !incoming_ids.contains(id))
            .collect();

        for record in records {
            match self.slots.try_get_mut(record.id) {
                Some(entry)
                    if entry.access_count == record.access_count
                        && entry.weak_generation == record.weak_generation =>
                {
                    trace!(slot = record.id, "slot is up to date, skipping");
                    summary.skipped = summary.skipped.wrapping_add(1);
                }
                Some(entry) => {
                    trace!(slot = record.id, "slot has changed, loading in place");
                    decode_blob_into(&mut entry.data, &record.blob, SaveMode::Merge)?;

                    entry.strong_count = record.strong_count;
                    entry.strong_generation = record.strong_generation;
                    entry.access_count = record.access_count;
                    entry.weak_generation = record.weak_generation;

                    summary.replaced = summary.replaced.wrapping_add(1);
                }
                None => {
                    trace!(slot = record.id, "slot is new, inserting");
                    let data = decode_blob::<E>(&record.blob, SaveMode::Merge)?;

                    self.slots.insert_at(
                        record.id,
                        Entry {
                            data,
                            strong_count: record.strong_count,
                            access_count: record.access_count,
                            weak_generation: record.weak_generation,
                            strong_generation: record.strong_generation,
                        },
                    );

                    summary.added = summary.added.wrapping_add(1);
                }
            }
        }

        // Removed last, so a failed decode above never drops a value while the pool is borrowed.
        let mut removed = Vec::with_capacity(absent.len());
        for id in absent {
            removed.push(self.slots.remove(id).data);
            summary.removed = summary.removed.wrapping_add(1);
        }

        self.weak_generation = self.weak_generation.max(incoming_weak_generation);

        Ok((summary, removed))
    }

    fn handle_for(&self, id: u32, entry: &Entry<E>) -> StrongHandle {
        StrongHandle::new(id, self.pool_id, entry.strong_generation)
    }

    fn mint_weak_generation(&mut self) -> u64 {
        self.weak_generation = self.weak_generation.wrapping_add(1) & WEAK_GENERATION_MASK;
        self.weak_generation
    }

    fn mint_strong_generation(&mut self) -> u8 {
        if !STRONG_GENERATION_CHECKS {
            return 0;
        }

        self.strong_generation = self.strong_generation.wrapping_add(1) & STRONG_GENERATION_MASK;
        self.strong_generation
    }

    fn entry(&self, handle: StrongHandle, operation: &str) -> &Entry<E> {
        self.check_ownership(handle, operation);

        let entry = self.slots.try_get(handle.index()).unwrap_or_else(|| {
            panic!(
                "{operation}() on pool {} with {handle:?}, which refers to a released slot",
                self.pool_id
            )
        });

        check_strong_generation(entry, handle, operation);
        entry
    }

    fn entry_mut(&mut self, handle: StrongHandle, operation: &str) -> &mut Entry<E> {
        self.check_ownership(handle, operation);

        let pool_id = self.pool_id;
        let entry = self.slots.try_get_mut(handle.index()).unwrap_or_else(|| {
            panic!(
                "{operation}() on pool {pool_id} with {handle:?}, which refers to a released slot"
            )
        });

        check_strong_generation(entry, handle, operation);
        entry
    }

    fn check_ownership(&self, handle: StrongHandle, operation: &str) {
        assert!(
            handle.is_valid(),
            "{operation}() on pool {} with the invalid handle",
            self.pool_id
        );

        assert!(
            handle.pool_id() == self.pool_id,
            "{operation}() on pool {} with {handle:?}, which was issued by another pool",
            self.pool_id
        );
    }
}

fn check_strong_generation<E>(entry: &Entry<E>, handle: StrongHandle, operation: &str) {
    if STRONG_GENERATION_CHECKS {
        assert!(
            entry.strong_generation == handle.generation(),
            "{operation}() with stale {handle:?}: the slot now holds strong generation {}",
            entry.strong_generation
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;
    use crate::slot_table::DEFAULT_ID_LIMIT;
    use crate::{ByteReader, ByteWriter};

    fn core() -> PoolCore<u32> {
        PoolCore::new(PoolId::new(3), DEFAULT_ID_LIMIT)
    }

    fn save(core: &PoolCore<u32>, mode: SaveMode) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        core.save(&mut writer, mode);
        writer.into_bytes()
    }

    fn load(core: &mut PoolCore<u32>, bytes: &[u8], mode: SaveMode) -> Result<LoadSummary> {
        let mut reader = ByteReader::new(bytes);
        let (summary, _removed) = core.load(&mut reader, mode, |_| Ok(()))?;
        reader.finish()?;
        Ok(summary)
    }

    fn contents(core: &PoolCore<u32>) -> Vec<(u32, u32)> {
        let mut contents: Vec<(u32, u32)> = core
            .iter()
            .map(|(handle, value)| (handle.index(), *value))
            .collect();
        contents.sort_unstable();
        contents
    }

    #[test]
    fn acquire_stamps_pool_and_count() {
        let mut core = core();

        let handle = core.acquire(10);

        assert_eq!(handle.pool_id(), PoolId::new(3));
        assert_eq!(core.count(handle), 1);
        assert_eq!(*core.get(handle), 10);
        assert_eq!(core.len(), 1);
    }

    #[test]
    fn increment_then_release_keeps_slot_until_zero() {
        let mut core = core();
        let handle = core.acquire(1);

        core.increment(handle);
        core.increment(handle);
        assert_eq!(core.count(handle), 3);

        assert_eq!(core.release(handle), None);
        assert_eq!(core.release(handle), None);
        assert_eq!(core.count(handle), 1);

        assert_eq!(core.release(handle), Some(1));
        assert_eq!(core.len(), 0);
    }

    #[test]
    #[should_panic]
    fn release_after_free_panics() {
        let mut core = core();
        let handle = core.acquire(1);

        core.release(handle);
        core.release(handle);
    }

    #[test]
    #[should_panic]
    fn invalid_handle_panics() {
        let core = core();
        _ = core.count(StrongHandle::INVALID);
    }

    #[test]
    #[should_panic]
    fn foreign_handle_panics() {
        let mut core = core();
        let mut other = PoolCore::<u32>::new(PoolId::new(4), DEFAULT_ID_LIMIT);

        let foreign = other.acquire(1);
        _ = core.acquire(2);

        core.increment(foreign);
    }

    #[test]
    fn weak_locks_while_entry_lives() {
        let mut core = core();
        let handle = core.acquire(5);
        let weak = core.weak(handle);

        let locked = core.lock(weak);

        assert_eq!(locked.index(), handle.index());
        assert_eq!(core.count(handle), 2);
        assert!(core.is_live(weak));
    }

    #[test]
    fn weak_does_not_lock_after_reuse() {
        let mut core = core();
        let handle = core.acquire(5);
        let weak = core.weak(handle);

        core.release(handle);
        let reused = core.acquire(6);

        assert_eq!(reused.index(), handle.index());
        assert!(!core.is_live(weak));
        assert_eq!(core.lock(weak), StrongHandle::INVALID);
        assert_eq!(core.count(reused), 1);
    }

    #[test]
    fn lock_rejects_foreign_and_invalid_weak_handles() {
        let mut core = core();
        let handle = core.acquire(5);

        let foreign = WeakHandle::new(handle.index(), PoolId::new(9), 1);

        assert_eq!(core.lock(foreign), StrongHandle::INVALID);
        assert_eq!(core.lock(WeakHandle::INVALID), StrongHandle::INVALID);
    }

    #[test]
    fn acquire_with_sees_its_own_weak_handle() {
        let mut core = PoolCore::<WeakHandle>::new(PoolId::new(0), DEFAULT_ID_LIMIT);

        let handle = core.acquire_with(|own| own);
        let remembered = *core.get(handle);

        assert_eq!(remembered, core.weak(handle));
    }

    #[test]
    fn get_mut_counts_accesses() {
        let mut core = core();
        let handle = core.acquire(1);

        *core.get_mut(handle) += 1;
        *core.get_mut(handle) += 1;
        *core.get_mut_untracked(handle) += 1;
        _ = core.get(handle);

        assert_eq!(core.access_count(handle), 2);
        assert_eq!(*core.get(handle), 4);
    }

    #[test]
    #[should_panic]
    fn exhausted_pool_panics() {
        let mut core = PoolCore::<u32>::new(PoolId::new(0), nz!(2));

        core.acquire(1);
        core.acquire(2);
        core.acquire(3);
    }

    #[test]
    fn drain_keeps_generation_counter() {
        let mut core = core();
        let handle = core.acquire(1);
        let weak = core.weak(handle);

        let drained = core.drain();
        assert_eq!(drained, vec![(1, 1)]);

        let fresh = core.acquire(2);
        assert_eq!(fresh.index(), handle.index());
        assert_eq!(core.lock(weak), StrongHandle::INVALID);
    }

    #[test]
    fn full_load_restores_slots_and_counts() {
        let mut pool = core();
        let a = pool.acquire(10);
        let b = pool.acquire(20);
        let c = pool.acquire(30);
        pool.increment(c);
        pool.release(a);
        let weak_b = pool.weak(b);

        let bytes = save(&pool, SaveMode::Full);

        pool.release(b);
        pool.acquire(99);
        pool.acquire(98);

        let summary = load(&mut pool, &bytes, SaveMode::Full).unwrap();

        assert_eq!(summary.added, 2);
        assert_eq!(summary.removed, 3);
        assert_eq!(contents(&pool), vec![(b.index(), 20), (c.index(), 30)]);
        assert_eq!(pool.count(c), 2);
        assert_eq!(pool.count(b), 1);

        // The entry is back but weak handles to it do not survive a full load.
        assert_eq!(pool.lock(weak_b), StrongHandle::INVALID);
    }

    #[test]
    fn failed_full_load_leaves_pool_unchanged() {
        let mut source = core();
        source.acquire(1);

        let mut bytes = save(&source, SaveMode::Full);
        bytes.pop();

        let mut target = core();
        target.acquire(7);

        assert!(load(&mut target, &bytes, SaveMode::Full).is_err());
        assert_eq!(contents(&target), vec![(0, 7)]);
    }

    #[test]
    fn mode_mismatch_is_reported() {
        let source = core();
        let bytes = save(&source, SaveMode::Full);

        let mut target = core();

        assert!(matches!(
            load(&mut target, &bytes, SaveMode::Merge),
            Err(Error::ModeMismatch {
                stored: SaveMode::Full,
                requested: SaveMode::Merge
            })
        ));
    }

    #[test]
    fn merge_load_skips_unchanged_and_replaces_changed() {
        let mut source = core();
        let a = source.acquire(1);
        let b = source.acquire(2);
        let c = source.acquire(3);

        let mut target = core();
        let first = load(&mut target, &save(&source, SaveMode::Merge), SaveMode::Merge).unwrap();
        assert_eq!(first.added, 3);

        *source.get_mut(b) = 20;
        source.release(c);
        let d = source.acquire(4);

        let second = load(&mut target, &save(&source, SaveMode::Merge), SaveMode::Merge).unwrap();

        // `c` and `d` share a slot ID but have different weak generations.
        assert_eq!(d.index(), c.index());
        assert_eq!(second.skipped, 1);
        assert_eq!(second.replaced, 2);
        assert_eq!(second.added, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(
            contents(&target),
            vec![(a.index(), 1), (b.index(), 20), (d.index(), 4)]
        );

        // Loading the same state again changes nothing.
        let third = load(&mut target, &save(&source, SaveMode::Merge), SaveMode::Merge).unwrap();
        assert_eq!(third.skipped, 3);
    }

    #[test]
    fn merge_load_removes_absent_entries_and_adopts_counter() {
        let mut source = core();
        let keep = source.acquire(1);
        let weak_keep = source.weak(keep);

        let mut target = core();
        let overwritten = target.acquire(100);
        *target.get_mut(overwritten) += 1;
        target.acquire(200);

        let summary = load(&mut target, &save(&source, SaveMode::Merge), SaveMode::Merge).unwrap();

        assert_eq!(summary.replaced, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(contents(&target), vec![(keep.index(), 1)]);

        // Weak handles from the saving pool remain lockable after a merge load.
        assert!(target.lock(weak_keep).is_valid());

        // The next acquire must not reuse a weak generation the source already handed out.
        let fresh = target.acquire(5);
        assert!(target.weak(fresh).generation() > weak_keep.generation());
    }

    #[test]
    fn stale_strong_handle_is_rejected_when_checks_are_on() {
        let mut core = core();
        let stale = core.acquire(1);
        core.release(stale);
        let reused = core.acquire(2);

        assert_eq!(reused.index(), stale.index());

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| core.count(stale)));
        assert_eq!(outcome.is_err(), STRONG_GENERATION_CHECKS);
    }

    #[test]
    fn failed_merge_load_removes_nothing() {
        let mut source = core();
        let kept = source.acquire(1);

        let mut target = core();
        load(&mut target, &save(&source, SaveMode::Merge), SaveMode::Merge).unwrap();
        let missing = target.acquire(2);

        let mut writer = ByteWriter::new();
        writer.put_u8(SaveMode::Merge.tag());
        writer.put_u64(0);
        writer.put_u32(2);

        writer.put_u32(kept.index());
        writer.put_u32(1);
        writer.put_u8(kept.generation());
        writer.put_u32(0);
        writer.put_u64(source.weak(kept).generation());
        writer.put_bytes(&encode_blob(&1_u32, SaveMode::Merge));

        writer.put_u32(missing.index().wrapping_add(1));
        writer.put_u32(1);
        writer.put_u8(0);
        writer.put_u32(0);
        writer.put_u64(1);
        writer.put_bytes(&[0xFF]);

        let result = load(&mut target, writer.as_bytes(), SaveMode::Merge);

        assert!(result.is_err());
        assert_eq!(contents(&target), vec![(kept.index(), 1), (missing.index(), 2)]);
    }

    #[test]
    fn resumed_weak_generations_start_above_the_floor() {
        let mut core = core();
        core.resume_weak_generations(40);

        let handle = core.acquire(1);

        assert_eq!(core.weak(handle).generation(), 41);
        assert_eq!(core.weak_generation(), 41);
    }

    #[test]
    fn duplicate_slot_is_malformed() {
        let mut writer = ByteWriter::new();
        writer.put_u8(SaveMode::Full.tag());
        writer.put_u32(2);

        for _ in 0..2 {
            writer.put_u32(0);
            writer.put_u32(1);
            writer.put_u8(0);
            writer.put_bytes(&encode_blob(&5_u32, SaveMode::Full));
        }

        let mut target = core();
        let result = load(&mut target, writer.as_bytes(), SaveMode::Full);

        assert!(matches!(result, Err(Error::Malformed { .. })));
    }

    #[test]
    fn slot_beyond_limit_is_malformed() {
        let mut source = core();
        for i in 0..5 {
            source.acquire(i);
        }

        let bytes = save(&source, SaveMode::Full);

        let mut target = PoolCore::<u32>::new(PoolId::new(3), nz!(4));
        let result = load(&mut target, &bytes, SaveMode::Full);

        assert!(matches!(result, Err(Error::Malformed { .. })));
    }
}
