use std::num::NonZero;

use crate::MAX_SLOTS;

/// Marks the end of the free list. Never a valid slot ID because the ID limit is at most
/// `u32::MAX`, which makes `u32::MAX - 1` the highest mintable ID.
const NO_FREE_ID: u32 = u32::MAX;

/// By default, a table can mint as many IDs as a handle can address.
pub(crate) const DEFAULT_ID_LIMIT: NonZero<u32> = match NonZero::new(MAX_SLOTS) {
    Some(limit) => limit,
    None => panic!("MAX_SLOTS must not be zero"),
};

/// A densely packed collection of values addressed by stable slot IDs.
///
/// Values are stored contiguously in insertion order until something is removed. Removal moves
/// the last value into the hole, so the packed region never has gaps, while an indirection table
/// keeps every slot ID pointing at the current position of its value.
///
/// Slot IDs of removed values are recycled through an intrusive free list threaded through the
/// indirection table itself: for a vacant ID, its indirection entry holds the next vacant ID
/// instead of a packed position.
///
/// Iteration follows the packed order, which is not stable across removals.
///
/// # Examples
///
/// ```
/// use handle_pool::SlotTable;
///
/// let mut table = SlotTable::new();
///
/// let a = table.add("a");
/// let b = table.add("b");
/// let c = table.add("c");
///
/// // Removing "a" moves "c" into its packed position but the IDs are unaffected.
/// assert_eq!(table.remove(a), "a");
/// assert_eq!(*table.get(b), "b");
/// assert_eq!(*table.get(c), "c");
///
/// // The vacated ID is handed out again.
/// assert_eq!(table.add("d"), a);
/// ```
#[derive(Debug)]
pub struct SlotTable<T> {
    /// The live values, packed without gaps.
    values: Vec<T>,

    /// `packed_ids[p]` is the slot ID of `values[p]`.
    packed_ids: Vec<u32>,

    /// One entry for every ID ever minted. For a live ID this is the packed position of its value;
    /// for a vacant ID it is the next vacant ID (or `NO_FREE_ID`).
    indirection: Vec<u32>,

    /// Head of the free list of vacant IDs.
    free_head: u32,

    /// IDs at or above this value are never minted.
    id_limit: NonZero<u32>,
}

impl<T> SlotTable<T> {
    /// Creates an empty table that can mint up to [`MAX_SLOTS`] IDs.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id_limit(DEFAULT_ID_LIMIT)
    }

    /// Creates an empty table that mints IDs in the range `0..id_limit`.
    #[must_use]
    pub fn with_id_limit(id_limit: NonZero<u32>) -> Self {
        Self {
            values: Vec::new(),
            packed_ids: Vec::new(),
            indirection: Vec::new(),
            free_head: NO_FREE_ID,
            id_limit,
        }
    }

    /// The number of live values.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the table holds no live values.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The exclusive upper bound of the slot IDs this table can mint.
    #[must_use]
    #[inline]
    pub fn id_limit(&self) -> NonZero<u32> {
        self.id_limit
    }

    /// The ID that the next call to [`add()`](Self::add) will return, or `None` if every ID
    /// below the limit is in use.
    #[must_use]
    pub fn next_id(&self) -> Option<u32> {
        if self.free_head != NO_FREE_ID {
            return Some(self.free_head);
        }

        let fresh = self.minted_count();
        (fresh < self.id_limit.get()).then_some(fresh)
    }

    /// Stores a value and returns the slot ID that now refers to it.
    ///
    /// # Panics
    ///
    /// Panics if every ID below the limit is in use.
    pub fn add(&mut self, value: T) -> u32 {
        let position = self.packed_len();

        let id = if self.free_head == NO_FREE_ID {
            let id = self.minted_count();

            assert!(
                id < self.id_limit.get(),
                "slot table exhausted: all {} slot IDs are in use",
                self.id_limit
            );

            self.indirection.push(position);
            id
        } else {
            // Pop the head of the free list.
            let id = self.free_head;
            let entry = self
                .indirection
                .get_mut(to_index(id))
                .expect("free list only ever contains minted IDs");

            self.free_head = *entry;
            *entry = position;
            id
        };

        self.values.push(value);
        self.packed_ids.push(id);

        id
    }

    /// Stores a value under a specific slot ID that is currently vacant or was never minted.
    ///
    /// IDs below `id` that were never minted become vacant and will be handed out by later calls
    /// to [`add()`](Self::add). Unlinking an already-minted vacant ID walks the free list.
    ///
    /// # Panics
    ///
    /// Panics if `id` is at or above the ID limit or is already occupied.
    pub fn insert_at(&mut self, id: u32, value: T) {
        assert!(
            id < self.id_limit.get(),
            "slot ID {id} is out of range for a slot table with ID limit {}",
            self.id_limit
        );

        let position = self.packed_len();

        if to_index(id) >= self.indirection.len() {
            // Mint everything up to the requested ID as vacant.
            while self.indirection.len() < to_index(id) {
                let vacant = self.minted_count();
                self.indirection.push(self.free_head);
                self.free_head = vacant;
            }

            self.indirection.push(position);
        } else {
            assert!(!self.has(id), "slot ID {id} is already occupied");

            self.unlink_vacant(id);

            *self
                .indirection
                .get_mut(to_index(id))
                .expect("bounds were checked above") = position;
        }

        self.values.push(value);
        self.packed_ids.push(id);
    }

    /// Removes the value with the given slot ID and returns it. The ID becomes vacant.
    ///
    /// # Panics
    ///
    /// Panics if the ID is not occupied.
    pub fn remove(&mut self, id: u32) -> T {
        let position = self
            .position_of(id)
            .unwrap_or_else(|| panic!("remove({id}) refers to a vacant or unknown slot ID"));

        let value = self.values.swap_remove(position);
        self.packed_ids.swap_remove(position);

        // If the removed value was not the last one, the last one now lives in the hole.
        if let Some(&moved_id) = self.packed_ids.get(position) {
            *self
                .indirection
                .get_mut(to_index(moved_id))
                .expect("every packed value has an indirection entry") = to_u32(position);
        }

        let entry = self
            .indirection
            .get_mut(to_index(id))
            .expect("position_of() succeeded, so the ID has an indirection entry");

        *entry = self.free_head;
        self.free_head = id;

        value
    }

    /// Whether the slot ID currently refers to a value.
    #[must_use]
    #[inline]
    pub fn has(&self, id: u32) -> bool {
        self.position_of(id).is_some()
    }

    /// Borrows the value with the given slot ID.
    ///
    /// # Panics
    ///
    /// Panics if the ID is not occupied.
    #[must_use]
    pub fn get(&self, id: u32) -> &T {
        self.try_get(id)
            .unwrap_or_else(|| panic!("get({id}) refers to a vacant or unknown slot ID"))
    }

    /// Mutably borrows the value with the given slot ID.
    ///
    /// # Panics
    ///
    /// Panics if the ID is not occupied.
    #[must_use]
    pub fn get_mut(&mut self, id: u32) -> &mut T {
        self.try_get_mut(id)
            .unwrap_or_else(|| panic!("get_mut({id}) refers to a vacant or unknown slot ID"))
    }

    /// Borrows the value with the given slot ID, if the ID is occupied.
    #[must_use]
    pub fn try_get(&self, id: u32) -> Option<&T> {
        self.position_of(id)
            .and_then(|position| self.values.get(position))
    }

    /// Mutably borrows the value with the given slot ID, if the ID is occupied.
    #[must_use]
    pub fn try_get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.position_of(id)
            .and_then(|position| self.values.get_mut(position))
    }

    /// The slot IDs of all live values, in packed order.
    #[must_use]
    #[inline]
    pub fn ids(&self) -> &[u32] {
        &self.packed_ids
    }

    /// Iterates over `(slot ID, value)` pairs in packed order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.packed_ids.iter().copied().zip(self.values.iter())
    }

    /// Iterates over `(slot ID, value)` pairs in packed order, with mutable access to the values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.packed_ids.iter().copied().zip(self.values.iter_mut())
    }

    /// Removes every value and forgets every minted ID, returning the values with their IDs.
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        self.indirection.clear();
        self.free_head = NO_FREE_ID;

        self.packed_ids
            .drain(..)
            .zip(self.values.drain(..))
            .collect()
    }

    fn position_of(&self, id: u32) -> Option<usize> {
        let position = to_index(*self.indirection.get(to_index(id))?);

        // Vacant IDs hold a free list link, which never points back at a packed slot that
        // records the same ID.
        (self.packed_ids.get(position) == Some(&id)).then_some(position)
    }

    fn unlink_vacant(&mut self, id: u32) {
        let next_of_id = *self
            .indirection
            .get(to_index(id))
            .expect("caller guarantees the ID was minted");

        if self.free_head == id {
            self.free_head = next_of_id;
            return;
        }

        let mut current = self.free_head;

        loop {
            assert!(
                current != NO_FREE_ID,
                "slot ID {id} is neither occupied nor on the free list"
            );

            let link = self
                .indirection
                .get_mut(to_index(current))
                .expect("free list only ever contains minted IDs");

            if *link == id {
                *link = next_of_id;
                return;
            }

            current = *link;
        }
    }

    fn minted_count(&self) -> u32 {
        to_u32(self.indirection.len())
    }

    fn packed_len(&self) -> u32 {
        to_u32(self.values.len())
    }

    #[cfg(test)]
    #[allow(
        clippy::indexing_slicing,
        reason = "integrity check needs array access"
    )]
    pub(crate) fn integrity_check(&self) {
        assert_eq!(self.values.len(), self.packed_ids.len());

        for (position, &id) in self.packed_ids.iter().enumerate() {
            assert_eq!(
                to_index(self.indirection[to_index(id)]),
                position,
                "indirection entry of live ID {id} does not point at its packed position"
            );
        }

        let mut seen_vacant = vec![false; self.indirection.len()];
        let mut vacant_count = 0_usize;
        let mut current = self.free_head;

        while current != NO_FREE_ID {
            assert!(!self.has(current), "free list contains live ID {current}");
            assert!(
                !seen_vacant[to_index(current)],
                "free list contains ID {current} twice"
            );

            seen_vacant[to_index(current)] = true;
            vacant_count += 1;
            current = self.indirection[to_index(current)];
        }

        assert_eq!(
            vacant_count + self.values.len(),
            self.indirection.len(),
            "every minted ID must be either live or on the free list"
        );
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn to_index(id: u32) -> usize {
    // u32 always fits in usize on the platforms we support.
    id as usize
}

#[inline]
fn to_u32(value: usize) -> u32 {
    u32::try_from(value).expect("packed positions and minted IDs are bounded by a u32 ID limit")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashMap;

    use new_zealand::nz;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn smoke_test() {
        let mut table = SlotTable::new();

        let a = table.add(10);
        let b = table.add(20);
        let c = table.add(30);

        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(table.len(), 3);
        assert_eq!(*table.get(b), 20);

        assert_eq!(table.remove(b), 20);
        assert_eq!(table.len(), 2);
        assert!(!table.has(b));
        assert_eq!(*table.get(a), 10);
        assert_eq!(*table.get(c), 30);

        table.integrity_check();
    }

    #[test]
    fn removing_first_moves_last_into_hole() {
        let mut table = SlotTable::new();

        let a = table.add('a');
        let b = table.add('b');
        let c = table.add('c');

        table.remove(a);

        // 'c' was swapped into position 0.
        assert_eq!(table.ids(), &[c, b]);
        assert_eq!(*table.get(c), 'c');
        assert_eq!(*table.get(b), 'b');

        table.integrity_check();
    }

    #[test]
    fn removing_only_value_empties_table() {
        let mut table = SlotTable::new();

        let a = table.add("only");
        assert_eq!(table.remove(a), "only");

        assert!(table.is_empty());
        assert!(!table.has(a));
        table.integrity_check();
    }

    #[test]
    fn cycling_reuses_ids_without_growth() {
        let mut table = SlotTable::new();

        let first = table.add(0_u32);

        for i in 1..1_000_u32 {
            table.remove(first);
            assert_eq!(table.add(i), first);
        }

        assert_eq!(table.len(), 1);
        assert_eq!(table.next_id(), Some(1));
        table.integrity_check();
    }

    #[test]
    fn freed_ids_are_reused_most_recent_first() {
        let mut table = SlotTable::new();

        let ids: Vec<u32> = (0..5).map(|i| table.add(i)).collect();

        table.remove(ids[1]);
        table.remove(ids[3]);

        assert_eq!(table.next_id(), Some(ids[3]));
        assert_eq!(table.add(100), ids[3]);
        assert_eq!(table.add(101), ids[1]);
        assert_eq!(table.add(102), 5);
    }

    #[test]
    #[should_panic]
    fn exhausting_id_space_panics() {
        let mut table = SlotTable::with_id_limit(nz!(2));

        table.add(1);
        table.add(2);
        table.add(3);
    }

    #[test]
    fn next_id_reports_exhaustion() {
        let mut table = SlotTable::with_id_limit(nz!(1));

        assert_eq!(table.next_id(), Some(0));
        let id = table.add(());
        assert_eq!(table.next_id(), None);

        table.remove(id);
        assert_eq!(table.next_id(), Some(0));
    }

    #[test]
    #[should_panic]
    fn get_vacant_panics() {
        let mut table = SlotTable::new();

        let id = table.add(1);
        table.remove(id);

        _ = table.get(id);
    }

    #[test]
    #[should_panic]
    fn remove_twice_panics() {
        let mut table = SlotTable::new();

        let id = table.add(1);
        table.remove(id);
        table.remove(id);
    }

    #[test]
    fn unknown_ids_are_absent() {
        let mut table = SlotTable::new();
        table.add(1);

        assert!(!table.has(1));
        assert!(!table.has(NO_FREE_ID));
        assert!(table.try_get(500).is_none());
    }

    #[test]
    fn insert_at_beyond_minted_range_frees_the_gap() {
        let mut table = SlotTable::new();

        table.insert_at(3, "three");

        assert_eq!(*table.get(3), "three");
        assert_eq!(table.len(), 1);
        table.integrity_check();

        // IDs 0, 1 and 2 are now vacant and handed out by add().
        let mut reused: Vec<u32> = (0..3).map(|_| table.add("filler")).collect();
        reused.sort_unstable();
        assert_eq!(reused, vec![0, 1, 2]);
        assert_eq!(table.add("next"), 4);

        table.integrity_check();
    }

    #[test]
    fn insert_at_vacant_id_unlinks_it_from_free_list() {
        let mut table = SlotTable::new();

        let ids: Vec<u32> = (0..4).map(|i| table.add(i)).collect();
        table.remove(ids[0]);
        table.remove(ids[2]);
        table.remove(ids[3]);

        // ids[2] is in the middle of the free list.
        table.insert_at(ids[2], 42);
        table.integrity_check();

        assert_eq!(*table.get(ids[2]), 42);
        assert_eq!(table.add(7), ids[3]);
        assert_eq!(table.add(8), ids[0]);
        table.integrity_check();
    }

    #[test]
    #[should_panic]
    fn insert_at_occupied_panics() {
        let mut table = SlotTable::new();

        let id = table.add(1);
        table.insert_at(id, 2);
    }

    #[test]
    #[should_panic]
    fn insert_at_beyond_limit_panics() {
        let mut table = SlotTable::with_id_limit(nz!(4));

        table.insert_at(4, ());
    }

    #[test]
    fn drain_returns_everything_and_resets_ids() {
        let mut table = SlotTable::new();

        let a = table.add('a');
        let b = table.add('b');
        table.remove(a);

        let drained = table.drain();

        assert_eq!(drained, vec![(b, 'b')]);
        assert!(table.is_empty());
        assert_eq!(table.add('c'), 0);
        table.integrity_check();
    }

    #[test]
    fn iteration_visits_every_live_value_once() {
        let mut table = SlotTable::new();

        let ids: Vec<u32> = (0..10).map(|i| table.add(i * 10)).collect();
        for id in ids.iter().step_by(3) {
            table.remove(*id);
        }

        for (_, value) in table.iter_mut() {
            *value += 1;
        }

        let mut seen: Vec<(u32, i32)> = table.iter().map(|(id, v)| (id, *v)).collect();
        seen.sort_unstable();

        let expected: Vec<(u32, i32)> = ids
            .iter()
            .copied()
            .filter(|id| id % 3 != 0)
            .map(|id| (id, i32::try_from(id).unwrap() * 10 + 1))
            .collect();

        assert_eq!(seen, expected);
    }

    #[test]
    fn random_churn_matches_model() {
        let mut rng = SmallRng::seed_from_u64(0x5107);
        let mut table = SlotTable::new();
        let mut model: HashMap<u32, u64> = HashMap::new();

        for step in 0..5_000_u64 {
            if model.is_empty() || rng.random_bool(0.55) {
                let id = table.add(step);
                assert!(model.insert(id, step).is_none(), "ID {id} handed out twice");
            } else {
                let live: Vec<u32> = model.keys().copied().collect();
                let victim = live[rng.random_range(0..live.len())];

                assert_eq!(table.remove(victim), model.remove(&victim).unwrap());
            }

            if step % 250 == 0 {
                table.integrity_check();
            }
        }

        assert_eq!(table.len(), model.len());
        for (id, value) in &model {
            assert_eq!(table.get(*id), value);
        }

        table.integrity_check();
    }
}
