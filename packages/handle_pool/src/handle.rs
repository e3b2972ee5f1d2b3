use std::fmt;

/// Number of bits used for the slot index in both handle flavors.
pub const INDEX_BITS: u32 = 20;

/// Number of bits used for the pool ID in both handle flavors.
pub const POOL_ID_BITS: u32 = 8;

/// Number of bits used for the strong-generation tag of a [`StrongHandle`].
pub const STRONG_GENERATION_BITS: u32 = 4;

/// Number of bits used for the weak-generation tag of a [`WeakHandle`].
pub const WEAK_GENERATION_BITS: u32 = 36;

/// The number of distinct slot indexes a handle can address. This is the upper bound for the
/// slot limit of any pool.
pub const MAX_SLOTS: u32 = 1 << INDEX_BITS;

const INDEX_MASK: u32 = MAX_SLOTS - 1;
const POOL_ID_MASK: u32 = (1 << POOL_ID_BITS) - 1;
const STRONG_GENERATION_SHIFT: u32 = INDEX_BITS + POOL_ID_BITS;
const WEAK_GENERATION_SHIFT: u32 = INDEX_BITS + POOL_ID_BITS;

pub(crate) const STRONG_GENERATION_MASK: u8 = (1 << STRONG_GENERATION_BITS) - 1;
pub(crate) const WEAK_GENERATION_MASK: u64 = (1 << WEAK_GENERATION_BITS) - 1;

/// Whether strong handles carry and verify a strong-generation tag in this build.
///
/// The weak-generation check is not affected by this - it is always performed.
pub(crate) const STRONG_GENERATION_CHECKS: bool =
    cfg!(any(debug_assertions, feature = "checked"));

const _: () = assert!(INDEX_BITS + POOL_ID_BITS + STRONG_GENERATION_BITS == u32::BITS);
const _: () = assert!(INDEX_BITS + POOL_ID_BITS + WEAK_GENERATION_BITS == u64::BITS);

/// Identifies a pool within a [`Registry`][crate::Registry].
///
/// The all-ones value is reserved, which guarantees that no handle issued by a registered pool
/// can ever be equal to the invalid sentinel of either handle flavor.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PoolId(u8);

impl PoolId {
    /// The highest pool ID a registry will hand out.
    pub const MAX: Self = Self(254);

    /// How many pools can be registered in one registry at the same time.
    pub const COUNT: usize = 255;

    /// Creates a pool ID from its numeric value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is greater than [`PoolId::MAX`].
    #[must_use]
    pub fn new(value: u8) -> Self {
        assert!(
            value <= Self::MAX.0,
            "pool ID {value} is reserved, the highest usable pool ID is {}",
            Self::MAX.0
        );

        Self(value)
    }

    /// The numeric value of the pool ID.
    #[must_use]
    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    #[must_use]
    pub(crate) fn as_index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference-counted handle to an item in a pool, packed into a single 32-bit word.
///
/// Layout, from the least significant bit:
///
/// | bits  | field               |
/// |-------|---------------------|
/// | 0-19  | slot index          |
/// | 20-27 | pool ID             |
/// | 28-31 | strong generation   |
///
/// The strong generation is only stamped and verified when debug assertions or the `checked`
/// feature are enabled. Otherwise it is always zero.
///
/// This is a plain value - it does not by itself own a reference. Ownership is a contract between
/// the code that obtained the handle (e.g. via [`Pool::acquire_raw()`][crate::Pool::acquire_raw])
/// and the pool. Use [`Handle<T>`][crate::Handle] or [`AnyHandle`][crate::AnyHandle] to have the
/// reference released automatically.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StrongHandle(u32);

impl StrongHandle {
    /// The sentinel value that does not refer to any item.
    pub const INVALID: Self = Self(u32::MAX);

    /// Packs the fields into a handle.
    ///
    /// Only the low [`STRONG_GENERATION_BITS`] of `generation` are kept. An `index` that does not
    /// fit into [`INDEX_BITS`] is a contract violation (checked in debug builds).
    #[must_use]
    pub fn new(index: u32, pool_id: PoolId, generation: u8) -> Self {
        debug_assert!(
            index < MAX_SLOTS,
            "slot index {index} does not fit into {INDEX_BITS} bits"
        );

        Self(
            (index & INDEX_MASK)
                | (u32::from(pool_id.0) << INDEX_BITS)
                | (u32::from(generation & STRONG_GENERATION_MASK) << STRONG_GENERATION_SHIFT),
        )
    }

    /// Reinterprets a raw word previously obtained from [`to_bits()`](Self::to_bits).
    #[must_use]
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw packed word.
    #[must_use]
    #[inline]
    pub fn to_bits(self) -> u32 {
        self.0
    }

    /// The slot index the handle refers to.
    #[must_use]
    #[inline]
    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    /// The ID of the pool that issued the handle.
    #[must_use]
    #[inline]
    pub fn pool_id(self) -> PoolId {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to POOL_ID_BITS, which is 8"
        )]
        let pool_id = ((self.0 >> INDEX_BITS) & POOL_ID_MASK) as u8;
        PoolId(pool_id)
    }

    /// The strong-generation tag. Always zero in builds without strong-generation checks.
    #[must_use]
    #[inline]
    pub fn generation(self) -> u8 {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "the shift leaves exactly STRONG_GENERATION_BITS"
        )]
        let generation = (self.0 >> STRONG_GENERATION_SHIFT) as u8;
        generation
    }

    /// Whether the handle is anything other than the invalid sentinel.
    ///
    /// A valid handle may still be stale - validity is a property of the value, not of the pool.
    #[must_use]
    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Overwrites the handle with the invalid sentinel.
    #[inline]
    pub fn set_null(&mut self) {
        *self = Self::INVALID;
    }
}

impl Default for StrongHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for StrongHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("StrongHandle(INVALID)");
        }

        f.debug_struct("StrongHandle")
            .field("index", &self.index())
            .field("pool_id", &self.pool_id().0)
            .field("generation", &self.generation())
            .finish()
    }
}

/// A non-owning handle to an item in a pool, packed into a single 64-bit word.
///
/// Layout, from the least significant bit:
///
/// | bits  | field               |
/// |-------|---------------------|
/// | 0-19  | slot index          |
/// | 20-27 | pool ID             |
/// | 28-63 | weak generation     |
///
/// The weak generation is compared against the slot's current generation every time the handle
/// is [locked][crate::Pool::lock_raw], in every build configuration. Each allocation of a slot
/// takes a new generation from a per-pool counter, so a weak handle to a released item does not
/// validate again when its slot is reused for a different item.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct WeakHandle(u64);

impl WeakHandle {
    /// The sentinel value that does not refer to any item.
    pub const INVALID: Self = Self(u64::MAX);

    /// Packs the fields into a handle.
    ///
    /// Only the low [`WEAK_GENERATION_BITS`] of `generation` are kept.
    #[must_use]
    pub fn new(index: u32, pool_id: PoolId, generation: u64) -> Self {
        debug_assert!(
            index < MAX_SLOTS,
            "slot index {index} does not fit into {INDEX_BITS} bits"
        );

        Self(
            u64::from(index & INDEX_MASK)
                | (u64::from(pool_id.0) << INDEX_BITS)
                | ((generation & WEAK_GENERATION_MASK) << WEAK_GENERATION_SHIFT),
        )
    }

    /// Reinterprets a raw word previously obtained from [`to_bits()`](Self::to_bits).
    #[must_use]
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The raw packed word.
    #[must_use]
    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// The slot index the handle refers to.
    #[must_use]
    #[inline]
    pub fn index(self) -> u32 {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to INDEX_BITS, which fits in u32"
        )]
        let index = (self.0 & u64::from(INDEX_MASK)) as u32;
        index
    }

    /// The ID of the pool that issued the handle.
    #[must_use]
    #[inline]
    pub fn pool_id(self) -> PoolId {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to POOL_ID_BITS, which is 8"
        )]
        let pool_id = ((self.0 >> INDEX_BITS) & u64::from(POOL_ID_MASK)) as u8;
        PoolId(pool_id)
    }

    /// The weak-generation tag.
    #[must_use]
    #[inline]
    pub fn generation(self) -> u64 {
        self.0 >> WEAK_GENERATION_SHIFT
    }

    /// Whether the handle is anything other than the invalid sentinel.
    #[must_use]
    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Overwrites the handle with the invalid sentinel.
    #[inline]
    pub fn set_null(&mut self) {
        *self = Self::INVALID;
    }
}

impl Default for WeakHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for WeakHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return f.write_str("WeakHandle(INVALID)");
        }

        f.debug_struct("WeakHandle")
            .field("index", &self.index())
            .field("pool_id", &self.pool_id().0)
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(StrongHandle: Send, Sync, Copy, Default, fmt::Debug);
    assert_impl_all!(WeakHandle: Send, Sync, Copy, Default, fmt::Debug);
    assert_impl_all!(PoolId: Send, Sync, Copy, fmt::Display);

    #[test]
    fn strong_fields_survive_packing() {
        let handle = StrongHandle::new(12_345, PoolId::new(17), 9);

        assert_eq!(handle.index(), 12_345);
        assert_eq!(handle.pool_id(), PoolId::new(17));
        assert_eq!(handle.generation(), 9);
        assert!(handle.is_valid());
    }

    #[test]
    fn strong_extremes_stay_valid() {
        let handle = StrongHandle::new(MAX_SLOTS - 1, PoolId::MAX, STRONG_GENERATION_MASK);

        assert_eq!(handle.index(), MAX_SLOTS - 1);
        assert_eq!(handle.pool_id(), PoolId::MAX);
        assert_eq!(handle.generation(), STRONG_GENERATION_MASK);
        assert!(handle.is_valid());
    }

    #[test]
    fn strong_generation_is_truncated_to_field_width() {
        let handle = StrongHandle::new(1, PoolId::new(0), 0x1F);

        assert_eq!(handle.generation(), 0x0F);
        assert_eq!(handle.index(), 1);
    }

    #[test]
    fn weak_fields_survive_packing() {
        let handle = WeakHandle::new(777, PoolId::new(3), 0x9_8765_4321);

        assert_eq!(handle.index(), 777);
        assert_eq!(handle.pool_id(), PoolId::new(3));
        assert_eq!(handle.generation(), 0x9_8765_4321);
        assert!(handle.is_valid());
    }

    #[test]
    fn weak_extremes_stay_valid() {
        let handle = WeakHandle::new(MAX_SLOTS - 1, PoolId::MAX, WEAK_GENERATION_MASK);

        assert_eq!(handle.generation(), WEAK_GENERATION_MASK);
        assert!(handle.is_valid());
    }

    #[test]
    fn weak_generation_wraps_at_field_width() {
        let handle = WeakHandle::new(5, PoolId::new(1), WEAK_GENERATION_MASK + 3);

        assert_eq!(handle.generation(), 2);
        assert_eq!(handle.index(), 5);
        assert_eq!(handle.pool_id(), PoolId::new(1));
    }

    #[test]
    fn defaults_are_invalid() {
        assert!(!StrongHandle::default().is_valid());
        assert!(!WeakHandle::default().is_valid());
    }

    #[test]
    fn set_null_invalidates() {
        let mut strong = StrongHandle::new(1, PoolId::new(1), 1);
        let mut weak = WeakHandle::new(1, PoolId::new(1), 1);

        strong.set_null();
        weak.set_null();

        assert_eq!(strong, StrongHandle::INVALID);
        assert_eq!(weak, WeakHandle::INVALID);
    }

    #[test]
    fn bits_round_trip() {
        let strong = StrongHandle::new(42, PoolId::new(2), 3);
        let weak = WeakHandle::new(42, PoolId::new(2), 3);

        assert_eq!(StrongHandle::from_bits(strong.to_bits()), strong);
        assert_eq!(WeakHandle::from_bits(weak.to_bits()), weak);
    }

    #[test]
    fn ordering_follows_raw_word() {
        let low = StrongHandle::new(1, PoolId::new(0), 0);
        let high = StrongHandle::new(0, PoolId::new(1), 0);

        assert!(low < high);
        assert_eq!(low.cmp(&high), low.to_bits().cmp(&high.to_bits()));
    }

    #[test]
    #[should_panic]
    fn reserved_pool_id_panics() {
        _ = PoolId::new(255);
    }

    #[test]
    fn debug_output_shows_fields() {
        let handle = StrongHandle::new(4, PoolId::new(5), 6);
        let output = format!("{handle:?}");

        assert!(output.contains("index: 4"));
        assert!(output.contains("pool_id: 5"));
        assert_eq!(format!("{:?}", WeakHandle::INVALID), "WeakHandle(INVALID)");
    }
}
