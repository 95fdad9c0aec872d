//! Weighted sub-allocation tracking.
//!
//! A [`Tracker`] wraps one [`Meter`] and lets callers carve off weighted
//! children with [`Tracker::spawn`]. Each child reports on its own
//! scale; the parent translates the child's completion ratio into a
//! proportional credit against the child's declared `size`, and keeps
//! its own total inflated so the denominator always covers every
//! promised-but-unfinished child.
//!
//! Everything is synchronous: a child's update runs the whole cascade
//! up to the root on the same call stack before returning.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use taskmeter_core::{
    ListenerId, Meter, MeterOptions, ProgressError, ProgressEvent, Result,
};

/// Options for [`Tracker::spawn`].
///
/// `current` and `total` seed the child's own counter. The two sizing
/// fields are mutually exclusive: `size` declares the child's weight in
/// parent units directly (default 1), while `to` asks for whatever
/// weight makes the parent land exactly on `to` once the child
/// finishes, given the obligations already outstanding.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Initial completed work units of the child.
    pub current: Option<f64>,

    /// Initial capacity of the child.
    pub total: Option<f64>,

    /// Weight credited to the parent once the child completes.
    pub size: Option<f64>,

    /// Parent value the child's completion should reach.
    pub to: Option<f64>,
}

/// One pending sub-allocation.
struct SubSlot {
    child: Tracker,
    /// Parent units granted once the child completes.
    size: f64,
    /// Parent units already credited for this child.
    tally: f64,
    listener: ListenerId,
}

/// Arena of pending sub-allocations, keyed by a monotonic id.
#[derive(Default)]
struct SubTable {
    next_id: u64,
    pending: HashMap<u64, SubSlot>,
}

struct Node {
    meter: Meter,
    subs: RefCell<SubTable>,
}

impl Node {
    /// Parent units still owed by pending children.
    fn outstanding(&self) -> f64 {
        self.subs
            .borrow()
            .pending
            .values()
            .map(|slot| slot.size - slot.tally)
            .sum()
    }

    /// The total the parent would need right now to cover its own
    /// progress plus every outstanding child obligation.
    fn projected_total(&self) -> f64 {
        self.meter.current() + self.outstanding()
    }

    /// Raise the total to the projected total when it falls short.
    /// Raising the total this way does not emit.
    fn reserve(&self) {
        let projected = self.projected_total();
        if let Some(total) = self.meter.total_opt() {
            if projected > total {
                self.meter.set_total(projected);
            }
        }
    }

    /// Fold a child's progress event into this node.
    fn absorb(node: &Rc<Self>, id: u64, event: &ProgressEvent) {
        let (delta, completed) = {
            let mut subs = node.subs.borrow_mut();
            let Some(slot) = subs.pending.get_mut(&id) else {
                // Detached child; events are dropped without effect.
                return;
            };
            // The child's ratio can dip when its total inflates, so the
            // tally is floored at its previous value.
            let new_tally = (event.ratio * slot.size).max(slot.tally);
            let delta = new_tally - slot.tally;
            slot.tally = new_tally;
            (delta, event.ratio >= 1.0)
        };

        let next = node.meter.current() + delta;
        if let Err(err) = node.meter.update(next, event.message.as_deref()) {
            // The delta is never negative, so this branch is
            // unreachable; losing a credit beats unwinding out of a
            // child's emission.
            error!("dropping sub-allocation credit: {err}");
            return;
        }
        node.reserve();

        if completed {
            let slot = node.subs.borrow_mut().pending.remove(&id);
            if let Some(slot) = slot {
                slot.child.off(slot.listener);
                debug!(id, "sub-allocation completed");
            }
        }
    }
}

/// A progress node that can be recursively decomposed.
///
/// Exposes the same counting surface as [`Meter`] and adds
/// [`Tracker::spawn`]. A `Tracker` is a cheap handle; cloning it shares
/// the underlying node.
#[derive(Clone)]
pub struct Tracker {
    inner: Rc<Node>,
}

impl Tracker {
    /// Create a root node from counter options.
    pub fn new(options: MeterOptions) -> Self {
        Self {
            inner: Rc::new(Node {
                meter: Meter::new(options),
                subs: RefCell::new(SubTable::default()),
            }),
        }
    }

    /// Create and attach a weighted child node.
    ///
    /// The child is returned for the caller to drive directly; its
    /// progress flows into this node until it completes or this node
    /// ends. Children may spawn children of their own, to any depth.
    ///
    /// # Errors
    ///
    /// - [`ProgressError::ConflictingOptions`] when both `size` and
    ///   `to` are given.
    /// - [`ProgressError::TotalNotSet`] when this node's total has
    ///   never been assigned, since sizing and reservation both read it.
    /// - [`ProgressError::RegressiveTarget`] when `to` lies behind the
    ///   projected total already committed.
    ///
    /// Failed spawns leave this node untouched.
    pub fn spawn(&self, options: SpawnOptions) -> Result<Tracker> {
        if self.inner.meter.total_opt().is_none() {
            return Err(ProgressError::TotalNotSet);
        }
        let size = match (options.size, options.to) {
            (Some(_), Some(_)) => return Err(ProgressError::ConflictingOptions),
            (Some(size), None) => size,
            (None, Some(to)) => {
                let projected = self.inner.projected_total();
                let size = to - projected;
                if size < 0.0 {
                    return Err(ProgressError::RegressiveTarget { to, projected });
                }
                size
            }
            (None, None) => 1.0,
        };

        let child = Tracker::new(MeterOptions {
            current: options.current,
            total: options.total,
        });

        let id = {
            let mut subs = self.inner.subs.borrow_mut();
            let id = subs.next_id;
            subs.next_id += 1;
            id
        };
        let parent = Rc::downgrade(&self.inner);
        let listener = child.on(move |event| {
            if let Some(parent) = parent.upgrade() {
                Node::absorb(&parent, id, event);
            }
        });
        self.inner.subs.borrow_mut().pending.insert(
            id,
            SubSlot {
                child: child.clone(),
                size,
                tally: 0.0,
                listener,
            },
        );
        debug!(id, size, "spawned sub-allocation");
        self.inner.reserve();

        Ok(child)
    }

    /// Number of children still pending on this node.
    pub fn pending_children(&self) -> usize {
        self.inner.subs.borrow().pending.len()
    }

    /// Work units completed so far.
    pub fn current(&self) -> f64 {
        self.inner.meter.current()
    }

    /// Raw assignment of `current`. Does not validate and does not emit.
    pub fn set_current(&self, value: f64) {
        self.inner.meter.set_current(value);
    }

    /// Declared capacity.
    ///
    /// # Errors
    ///
    /// [`ProgressError::TotalNotSet`] if the total was never assigned.
    pub fn total(&self) -> Result<f64> {
        self.inner.meter.total()
    }

    /// Declared capacity, or `None` while unset.
    pub fn total_opt(&self) -> Option<f64> {
        self.inner.meter.total_opt()
    }

    /// Raw assignment of `total`. Does not emit.
    pub fn set_total(&self, value: f64) {
        self.inner.meter.set_total(value);
    }

    /// Completion fraction in `[0, 1]`.
    pub fn ratio(&self) -> f64 {
        self.inner.meter.ratio()
    }

    /// Move `current` forward, then re-check the reservation: a manual
    /// update can push `current` past the point where the existing
    /// total still covers outstanding children.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Meter::update`].
    pub fn update(&self, current: f64, msg: Option<&str>) -> Result<()> {
        self.inner.meter.update(current, msg)?;
        self.inner.reserve();
        Ok(())
    }

    /// Advance `current` by one, then re-check the reservation.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Meter::update`].
    pub fn tick(&self, msg: Option<&str>) -> Result<()> {
        self.inner.meter.tick(msg)?;
        self.inner.reserve();
        Ok(())
    }

    /// Drive this node to completion and detach every pending child.
    ///
    /// Detached children keep working for whoever holds them, but their
    /// events no longer reach this node.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Meter::end`]; nothing is detached on
    /// failure.
    pub fn end(&self, msg: Option<&str>) -> Result<()> {
        self.inner.meter.end(msg)?;
        let detached: Vec<SubSlot> = {
            let mut subs = self.inner.subs.borrow_mut();
            subs.pending.drain().map(|(_, slot)| slot).collect()
        };
        if !detached.is_empty() {
            debug!(count = detached.len(), "detached pending sub-allocations");
        }
        for slot in detached {
            slot.child.off(slot.listener);
        }
        Ok(())
    }

    /// Register a progress listener on this node.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProgressEvent) + 'static,
    {
        self.inner.meter.on(listener)
    }

    /// Remove a progress listener from this node.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.meter.off(id)
    }

    /// Re-broadcast an event to this node's listeners.
    pub fn emit(&self, event: &ProgressEvent) {
        self.inner.meter.emit(event);
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(MeterOptions::default())
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("current", &self.current())
            .field("total", &self.total_opt())
            .field("pending_children", &self.pending_children())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn root(current: f64, total: f64) -> Tracker {
        Tracker::new(MeterOptions {
            current: Some(current),
            total: Some(total),
        })
    }

    fn sized(total: f64, size: f64) -> SpawnOptions {
        SpawnOptions {
            total: Some(total),
            size: Some(size),
            ..SpawnOptions::default()
        }
    }

    fn record_events(tracker: &Tracker) -> Rc<RefCell<Vec<ProgressEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        tracker.on(move |event| sink.borrow_mut().push(event.clone()));
        events
    }

    #[test]
    fn seeds_child_counter_like_a_standalone_one() {
        let parent = root(0.0, 10.0);

        let child = parent
            .spawn(SpawnOptions {
                current: Some(53.0),
                ..SpawnOptions::default()
            })
            .unwrap();
        assert_eq!(child.current(), 53.0);
        assert_eq!(child.total(), Err(ProgressError::TotalNotSet));

        let child = parent.spawn(SpawnOptions::default()).unwrap();
        assert_eq!(child.current(), 0.0);

        let child = parent
            .spawn(SpawnOptions {
                total: Some(42.0),
                ..SpawnOptions::default()
            })
            .unwrap();
        assert_eq!(child.total(), Ok(42.0));
    }

    #[test]
    fn completed_child_credits_its_default_size_of_one() {
        let parent = root(0.0, 10.0);
        let child = parent
            .spawn(SpawnOptions {
                total: Some(10.0),
                ..SpawnOptions::default()
            })
            .unwrap();

        child.end(None).unwrap();

        assert_eq!(parent.current(), 1.0);
    }

    #[test]
    fn completed_child_credits_its_declared_size() {
        let parent = root(0.0, 10.0);
        let child = parent.spawn(sized(10.0, 2.0)).unwrap();

        child.end(None).unwrap();

        assert_eq!(parent.current(), 2.0);
        assert_eq!(parent.pending_children(), 0);
    }

    #[test]
    fn spawn_requires_the_parent_total() {
        let parent = Tracker::default();
        let err = parent
            .spawn(SpawnOptions {
                total: Some(10.0),
                ..SpawnOptions::default()
            })
            .unwrap_err();
        assert_eq!(err, ProgressError::TotalNotSet);
        assert_eq!(parent.pending_children(), 0);
    }

    #[test]
    fn spawn_rejects_both_sizing_options() {
        let parent = root(0.0, 10.0);
        let err = parent
            .spawn(SpawnOptions {
                size: Some(1.0),
                to: Some(2.0),
                ..SpawnOptions::default()
            })
            .unwrap_err();
        assert_eq!(err, ProgressError::ConflictingOptions);
        assert_eq!(parent.pending_children(), 0);
    }

    #[test]
    fn to_target_sizes_the_child_to_land_on_it() {
        let parent = root(5.0, 10.0);
        let child = parent
            .spawn(SpawnOptions {
                total: Some(10.0),
                to: Some(8.0),
                ..SpawnOptions::default()
            })
            .unwrap();

        child.end(None).unwrap();

        assert_eq!(parent.current(), 8.0);
    }

    #[test]
    fn to_target_accounts_for_pending_siblings() {
        let parent = root(0.0, 10.0);
        let first = parent.spawn(sized(1.0, 5.0)).unwrap();
        let second = parent
            .spawn(SpawnOptions {
                total: Some(10.0),
                to: Some(8.0),
                ..SpawnOptions::default()
            })
            .unwrap();

        first.end(None).unwrap();
        second.end(None).unwrap();

        assert_eq!(parent.current(), 8.0);
    }

    #[test]
    fn to_target_behind_current_progress_is_rejected() {
        let parent = root(5.0, 10.0);
        let err = parent
            .spawn(SpawnOptions {
                total: Some(10.0),
                to: Some(4.0),
                ..SpawnOptions::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            ProgressError::RegressiveTarget {
                to: 4.0,
                projected: 5.0
            }
        );
    }

    #[test]
    fn to_target_behind_committed_reservations_is_rejected() {
        let parent = root(5.0, 10.0);
        let _first = parent.spawn(sized(1.0, 5.0)).unwrap();

        let err = parent
            .spawn(SpawnOptions {
                total: Some(10.0),
                to: Some(4.0),
                ..SpawnOptions::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            ProgressError::RegressiveTarget {
                to: 4.0,
                projected: 10.0
            }
        );
    }

    #[test]
    fn child_progress_is_credited_proportionally() {
        let parent = root(0.0, 10.0);
        let child = parent.spawn(sized(100.0, 10.0)).unwrap();

        child.update(3.0, None).unwrap();

        assert_eq!(parent.current(), 3.0 / 100.0 * 10.0);
    }

    #[test]
    fn spawn_inflates_the_total_to_cover_the_reservation() {
        let parent = root(5.0, 10.0);
        let _child = parent.spawn(sized(10.0, 10.0)).unwrap();
        assert_eq!(parent.total(), Ok(15.0));
    }

    #[test]
    fn manual_update_inflates_the_total_past_the_reservation() {
        let parent = root(0.0, 10.0);
        let _child = parent.spawn(sized(10.0, 10.0)).unwrap();

        parent.update(5.0, None).unwrap();

        assert_eq!(parent.total(), Ok(15.0));
    }

    #[test]
    fn manual_tick_inflates_the_total_past_the_reservation() {
        let parent = root(0.0, 10.0);
        let _child = parent.spawn(sized(10.0, 10.0)).unwrap();

        parent.tick(Some("WOWO!")).unwrap();

        assert_eq!(parent.total(), Ok(11.0));
    }

    #[test]
    fn completed_child_stops_reaching_the_parent() {
        let parent = root(0.0, 10.0);
        let child = parent
            .spawn(SpawnOptions {
                total: Some(2.0),
                ..SpawnOptions::default()
            })
            .unwrap();
        let events = record_events(&parent);

        child.tick(None).unwrap();
        child.end(None).unwrap();
        assert_eq!(events.borrow().len(), 2);
        assert_eq!(parent.current(), 1.0);

        // The child keeps working, the parent no longer hears it.
        child.tick(None).unwrap();
        assert_eq!(events.borrow().len(), 2);
        assert_eq!(parent.current(), 1.0);
    }

    #[test]
    fn ended_parent_ignores_pending_children() {
        let parent = root(0.0, 10.0);
        let child = parent.spawn(sized(10.0, 2.0)).unwrap();

        parent.end(None).unwrap();
        assert_eq!(parent.current(), 10.0);
        assert_eq!(parent.pending_children(), 0);

        let events = record_events(&parent);
        child.tick(None).unwrap();
        assert_eq!(parent.current(), 10.0);
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn failed_end_leaves_the_attachment_intact() {
        let parent = root(0.0, 10.0);
        let child = parent
            .spawn(SpawnOptions {
                size: Some(2.0),
                ..SpawnOptions::default()
            })
            .unwrap();

        // The child has no total of its own, so ending it fails and the
        // parent keeps the pending slot.
        assert_eq!(child.end(None), Err(ProgressError::TotalNotSet));
        assert_eq!(parent.pending_children(), 1);
        assert_eq!(parent.current(), 0.0);

        child.set_total(2.0);
        child.end(None).unwrap();
        assert_eq!(parent.current(), 2.0);
        assert_eq!(parent.pending_children(), 0);
    }

    #[test]
    fn grandchild_progress_cascades_to_the_root() {
        let grandparent = root(0.0, 4.0);
        let parent = grandparent.spawn(sized(2.0, 4.0)).unwrap();
        let child = parent.spawn(sized(2.0, 2.0)).unwrap();

        child.tick(None).unwrap();
        assert_eq!(parent.current(), 1.0);
        assert_eq!(grandparent.current(), 2.0);

        child.tick(None).unwrap();
        assert_eq!(parent.current(), 2.0);
        assert_eq!(grandparent.current(), 4.0);
        assert_eq!(grandparent.ratio(), 1.0);
        assert_eq!(grandparent.pending_children(), 0);
        assert_eq!(parent.pending_children(), 0);
    }

    #[test]
    fn child_messages_pass_through_to_the_parent() {
        let parent = root(0.0, 10.0);
        let child = parent.spawn(sized(4.0, 2.0)).unwrap();
        let events = record_events(&parent);

        child.tick(Some("halfway there")).unwrap();

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message.as_deref(), Some("halfway there"));
    }

    #[test]
    fn forwards_the_counter_contract() {
        let tracker = root(15.0, 20.0);
        assert_eq!(tracker.ratio(), 0.75);

        assert_eq!(
            tracker.update(14.0, None),
            Err(ProgressError::RegressiveUpdate {
                from: 15.0,
                to: 14.0
            })
        );

        tracker.update(25.0, None).unwrap();
        assert_eq!(tracker.total(), Ok(25.0));

        tracker.set_current(30.0);
        tracker.set_total(60.0);
        assert_eq!(tracker.current(), 30.0);
        assert_eq!(tracker.ratio(), 0.5);
    }

    #[test]
    fn clones_share_the_same_node() {
        let tracker = root(0.0, 10.0);
        let alias = tracker.clone();

        alias.tick(None).unwrap();

        assert_eq!(tracker.current(), 1.0);
    }
}
