//! Progress event payload.

use serde::{Deserialize, Serialize};

/// Snapshot carried by every progress notification.
///
/// Emitted after each successful `update`, `tick` or `end`, including
/// those driven internally by child delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Work units completed so far.
    pub current: f64,

    /// Declared capacity; `None` while the total has never been assigned.
    pub total: Option<f64>,

    /// Derived completion fraction in `[0, 1]`.
    pub ratio: f64,

    /// Caller-supplied annotation for this change, if any.
    pub message: Option<String>,
}
