//! Taskmeter core primitives.
//!
//! This crate defines the single-level building blocks of the progress
//! engine: a bounded counter with monotonic updates and a synchronous
//! notification channel that reports every change to registered listeners.

#![warn(missing_docs)]

// Error surface
mod error;

// Event payload and delivery
mod event;
mod notify;

// Bounded counting
mod meter;

// Re-exports
pub use error::{ProgressError, Result};
pub use event::ProgressEvent;
pub use meter::{Meter, MeterOptions};
pub use notify::{ListenerId, Notifier};
