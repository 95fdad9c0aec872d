//! Synchronous progress notification.
//!
//! The engine has exactly one event kind, so the notifier is a closed
//! channel carrying [`ProgressEvent`] rather than a generic event map.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::event::ProgressEvent;

type Listener = Rc<dyn Fn(&ProgressEvent)>;

/// Handle identifying one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Synchronous publish/subscribe channel for progress events.
///
/// Listeners run on the emitting call stack, in registration order.
/// Emission iterates over a snapshot of the listener list: `on` and
/// `off` calls made by a listener take effect for later emissions, not
/// for the pass that is currently running.
#[derive(Default)]
pub struct Notifier {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, Listener)>>,
}

impl Notifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; returns the handle used to remove it.
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ProgressEvent) + 'static,
    {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    /// Remove a previous registration. Returns `false` if the handle
    /// was unknown or already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Invoke every currently registered listener with `event`.
    ///
    /// Listener panics are not caught and unwind to the caller.
    pub fn emit(&self, event: &ProgressEvent) {
        // Snapshot first so the list is not borrowed while listeners
        // run; a listener may re-enter with on/off.
        let snapshot: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners.
    ///
    /// Hosts can use this to check whether anyone is still observing a
    /// counter; the engine itself never reads it.
    pub fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// True when no listeners are registered. See [`Notifier::len`].
    pub fn is_empty(&self) -> bool {
        self.listeners.borrow().is_empty()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.len())
            .finish()
    }
}
