//! Recursive progress decomposition.
//!
//! Lets a long-running operation split its progress into weighted
//! sub-allocations, each tracked independently while aggregating into
//! the parent's counter.

#![warn(missing_docs)]

pub mod tracker;

pub use tracker::{SpawnOptions, Tracker};
