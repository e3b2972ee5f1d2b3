/// Determines how a pool treats items that are still referenced when the pool is dropped.
///
/// Dropping a pool always force-releases every item once and then drops all values. Any item
/// whose strong count was above one at that point was leaked by its owners, since some strong
/// handle outlived the pool. The policy decides what happens to such leaks.
///
/// # Examples
///
/// ```
/// use handle_pool::{DropPolicy, Pool, Registry};
///
/// let registry = Registry::new();
///
/// // The drop policy is set at pool creation time.
/// let pool = Pool::<u32>::builder()
///     .drop_policy(DropPolicy::MustNotLeak)
///     .build(&registry);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// Leaked items are reported as a warning through `tracing` and then dropped. This is the
    /// default.
    #[default]
    ReportLeaks,

    /// The pool will panic if any item is leaked when it is dropped.
    ///
    /// Use this when every handle is expected to be released before teardown, so that a leak
    /// points at a bookkeeping bug rather than at a normal shutdown path.
    MustNotLeak,
}
