#![forbid(unsafe_code)]

//! Ordered listener registry shared by all store kinds.
//!
//! # Design
//!
//! Each store owns a [`Registry<E>`] where `E` is the emission payload the
//! store fans out (value + previous value for atoms, mapping + changed keys
//! for map stores). An emission snapshots the matching entries and queues a
//! single notification pass on the runtime's emission queue; the pass calls
//! each callback in registration order.
//!
//! # Invariants
//!
//! 1. Callbacks run in registration order within a pass.
//! 2. A listener added during a pass is not part of that pass (the snapshot
//!    was taken before it existed).
//! 3. A listener removed during a pass is skipped for the remainder of that
//!    pass (its alive flag is cleared before the entry is dropped).
//! 4. Unsubscribing is idempotent: [`Subscription::unsubscribe`] consumes
//!    the guard, and `Drop` after `detach()` does nothing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::runtime::Runtime;

pub(crate) struct Entry<E> {
    pub(crate) id: u64,
    pub(crate) alive: Rc<Cell<bool>>,
    /// Watched-key filter; `None` receives every emission.
    pub(crate) keys: Option<Vec<String>>,
    pub(crate) callback: Rc<dyn Fn(&E)>,
}

/// Insertion-ordered set of listeners for one store.
pub(crate) struct Registry<E> {
    entries: RefCell<Vec<Entry<E>>>,
    next_id: Cell<u64>,
}

impl<E: 'static> Registry<E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    /// Register a callback; returns the entry id and its alive flag.
    pub(crate) fn add(
        &self,
        keys: Option<Vec<String>>,
        callback: Rc<dyn Fn(&E)>,
    ) -> (u64, Rc<Cell<bool>>) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let alive = Rc::new(Cell::new(true));
        self.entries.borrow_mut().push(Entry {
            id,
            alive: Rc::clone(&alive),
            keys,
            callback,
        });
        (id, alive)
    }

    /// Remove an entry by id. Returns false if it was already gone.
    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Snapshot the entries matching `changed` and queue one notification
    /// pass delivering `payload` to each of them.
    ///
    /// An entry matches if it has no key filter, or if at least one watched
    /// key appears in `changed`. The whole pass is one queue item, so a
    /// filtered listener fires at most once per emission no matter how many
    /// of its keys changed.
    pub(crate) fn emit(&self, rt: &Runtime, payload: E, changed: &[String]) {
        let snapshot: Vec<(Rc<Cell<bool>>, Rc<dyn Fn(&E)>)> = self
            .entries
            .borrow()
            .iter()
            .filter(|entry| match &entry.keys {
                None => true,
                Some(keys) => keys.iter().any(|k| changed.contains(k)),
            })
            .map(|entry| (Rc::clone(&entry.alive), Rc::clone(&entry.callback)))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        tracing::trace!(listeners = snapshot.len(), "queueing notification pass");
        rt.enqueue_emission(Box::new(move || {
            for (alive, callback) in &snapshot {
                if alive.get() {
                    callback(&payload);
                }
            }
        }));
    }
}

/// RAII guard for a registered listener.
///
/// Dropping the guard (or calling [`unsubscribe`](Subscription::unsubscribe))
/// removes the listener and, through the store's bookkeeping, feeds the
/// lifecycle state machine. [`detach`](Subscription::detach) leaves the
/// listener registered for as long as the store lives.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    alive: Rc<Cell<bool>>,
    remove: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub(crate) fn new(alive: Rc<Cell<bool>>, remove: Box<dyn FnOnce()>) -> Self {
        Self {
            alive,
            remove: Some(remove),
        }
    }

    /// Remove the listener now. Move semantics make a second unsubscribe
    /// unrepresentable.
    pub fn unsubscribe(mut self) {
        self.run_removal();
    }

    /// Keep the listener registered forever (well, for the store's life).
    pub fn detach(mut self) {
        self.remove = None;
    }

    fn run_removal(&mut self) {
        if let Some(remove) = self.remove.take() {
            self.alive.set(false);
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_removal();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("alive", &self.alive.get())
            .finish_non_exhaustive()
    }
}
