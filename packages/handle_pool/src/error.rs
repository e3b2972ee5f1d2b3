use thiserror::Error;

use crate::SaveMode;

/// Errors that can occur when restoring pool contents or loading external resources.
///
/// Misuse of handles (releasing a stale handle, dereferencing a handle from another pool and
/// similar) is not reported through this type - such contract violations panic.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The input ended before a value could be fully decoded.
    #[error("unexpected end of input: needed {needed} more bytes but only {remaining} remain")]
    UnexpectedEnd {
        /// How many bytes the decoder tried to consume.
        needed: usize,

        /// How many bytes were left in the input.
        remaining: usize,
    },

    /// The input was decoded but did not describe a valid value.
    #[error("malformed input: {problem}")]
    Malformed {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// The input was saved in a different persistence mode than the one used to load it.
    #[error("input was saved in {stored:?} mode but is being loaded in {requested:?} mode")]
    ModeMismatch {
        /// The mode recorded in the input.
        stored: SaveMode,

        /// The mode the caller asked to load with.
        requested: SaveMode,
    },

    /// None of the registered resource sources could produce data for the locator.
    #[error("no resource source can open '{locator}'")]
    ResourceNotFound {
        /// The locator that was requested, in `scheme:path` form.
        locator: String,
    },

    /// Data for the locator was found but no registered pool accepted it.
    #[error("no pool accepted the resource '{locator}'")]
    ResourceRejected {
        /// The locator that was requested, in `scheme:path` form.
        locator: String,
    },

    /// A resource source failed for a reason other than the resource being absent.
    #[error("failed to read resource '{locator}'")]
    Io {
        /// The locator that was requested, in `scheme:path` form.
        locator: String,

        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn malformed(problem: impl Into<String>) -> Self {
        Self::Malformed {
            problem: problem.into(),
        }
    }
}

/// A specialized `Result` type for pool persistence and resource loading, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
