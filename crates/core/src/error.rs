//! Error types for progress operations.

use thiserror::Error;

/// Errors reported by progress operations.
///
/// All of these signal caller misuse. No operation retries internally,
/// and a failed operation leaves the counter untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProgressError {
    /// The total was read, or required, before it was ever assigned.
    #[error("'total' is not set")]
    TotalNotSet,

    /// An update tried to move the current value backwards.
    #[error("'current' cannot be reduced by an update ({from} -> {to})")]
    RegressiveUpdate {
        /// Current value at the time of the call.
        from: f64,
        /// Value the caller asked for.
        to: f64,
    },

    /// A sub-allocation target lies behind progress already committed.
    #[error("cannot allocate to a regressive target: 'to' was {to}, but the projected total is already {projected}")]
    RegressiveTarget {
        /// Target the caller asked for.
        to: f64,
        /// Projected total covering current progress plus pending obligations.
        projected: f64,
    },

    /// Mutually exclusive sizing options were both supplied.
    #[error("'size' and 'to' cannot both be specified")]
    ConflictingOptions,
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ProgressError>;
