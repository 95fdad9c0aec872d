//! Bounded progress counting.

use std::cell::RefCell;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{ProgressError, Result};
use crate::event::ProgressEvent;
use crate::notify::{ListenerId, Notifier};

/// Construction options for a [`Meter`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MeterOptions {
    /// Initial completed work units. Defaults to 0.
    pub current: Option<f64>,

    /// Initial capacity. Left unset when omitted.
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct MeterState {
    current: f64,
    total: Option<f64>,
}

/// A single-level progress counter.
///
/// Tracks `current` against an optional `total`, derives a completion
/// ratio, and notifies listeners on every successful update. `current`
/// only moves forward through [`Meter::update`]; overshooting a set
/// total inflates the total rather than clamping the overshoot.
pub struct Meter {
    state: RefCell<MeterState>,
    notifier: Notifier,
}

impl Meter {
    /// Create a meter from options.
    pub fn new(options: MeterOptions) -> Self {
        Self {
            state: RefCell::new(MeterState {
                current: options.current.unwrap_or(0.0),
                total: options.total,
            }),
            notifier: Notifier::new(),
        }
    }

    /// Work units completed so far.
    pub fn current(&self) -> f64 {
        self.state.borrow().current
    }

    /// Raw assignment of `current`. Does not validate and does not emit.
    pub fn set_current(&self, value: f64) {
        self.state.borrow_mut().current = value;
    }

    /// Declared capacity.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TotalNotSet`] if the total was never assigned.
    pub fn total(&self) -> Result<f64> {
        self.state.borrow().total.ok_or(ProgressError::TotalNotSet)
    }

    /// Declared capacity, or `None` while unset.
    pub fn total_opt(&self) -> Option<f64> {
        self.state.borrow().total
    }

    /// Raw assignment of `total`. Does not emit.
    pub fn set_total(&self, value: f64) {
        self.state.borrow_mut().total = Some(value);
    }

    /// Completion fraction in `[0, 1]`.
    ///
    /// With the total unset or zero there is no meaningful denominator:
    /// any nonzero `current` reads as complete, zero as untouched.
    pub fn ratio(&self) -> f64 {
        let state = self.state.borrow();
        match state.total {
            None => ratio_without_total(state.current),
            Some(total) if total == 0.0 => ratio_without_total(state.current),
            Some(total) => {
                if state.current <= 0.0 {
                    0.0
                } else if state.current >= total {
                    1.0
                } else {
                    state.current / total
                }
            }
        }
    }

    /// Move the completed count forward to `current`, inflating a set
    /// total when overshot, then notify listeners.
    ///
    /// # Errors
    ///
    /// [`ProgressError::RegressiveUpdate`] if `current` is less than the
    /// present value. The counter is left untouched on failure.
    pub fn update(&self, current: f64, msg: Option<&str>) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            if current < state.current {
                return Err(ProgressError::RegressiveUpdate {
                    from: state.current,
                    to: current,
                });
            }
            state.current = current;
            if let Some(total) = state.total {
                if total < current {
                    state.total = Some(current);
                }
            }
        }
        trace!(current, total = ?self.total_opt(), "progress updated");
        self.emit_progress(msg);
        Ok(())
    }

    /// Advance `current` by one.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Meter::update`].
    pub fn tick(&self, msg: Option<&str>) -> Result<()> {
        self.update(self.current() + 1.0, msg)
    }

    /// Drive the counter to completion: `current` becomes
    /// `max(total, current)`.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TotalNotSet`] if the total was never assigned;
    /// otherwise propagates errors from [`Meter::update`].
    pub fn end(&self, msg: Option<&str>) -> Result<()> {
        let total = self.total()?;
        self.update(total.max(self.current()), msg)
    }

    /// Register a progress listener.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProgressEvent) + 'static,
    {
        self.notifier.on(listener)
    }

    /// Remove a progress listener.
    pub fn off(&self, id: ListenerId) -> bool {
        self.notifier.off(id)
    }

    /// Re-broadcast an event to this meter's listeners.
    pub fn emit(&self, event: &ProgressEvent) {
        self.notifier.emit(event);
    }

    fn emit_progress(&self, msg: Option<&str>) {
        let event = {
            let state = self.state.borrow();
            ProgressEvent {
                current: state.current,
                total: state.total,
                ratio: self.ratio(),
                message: msg.map(str::to_owned),
            }
        };
        self.notifier.emit(&event);
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new(MeterOptions::default())
    }
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Meter")
            .field("current", &state.current)
            .field("total", &state.total)
            .finish()
    }
}

fn ratio_without_total(current: f64) -> f64 {
    if current != 0.0 {
        1.0
    } else {
        0.0
    }
}
