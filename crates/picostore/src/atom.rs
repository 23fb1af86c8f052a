#![forbid(unsafe_code)]

//! Base observable value cell.
//!
//! # Design
//!
//! [`Atom<T>`] wraps a value in shared, reference-counted storage
//! (`Rc<..>` inside). Cloning an `Atom` creates a new handle to the same
//! cell. `set` replaces the value and synchronously notifies listeners in
//! registration order with `(new, previous)`.
//!
//! Atoms notify on **every** `set`, including one that stores a value equal
//! to the current one. Duplicate suppression is a keyed concern and lives in
//! [`MapStore`](crate::map::MapStore); the base cell stays policy-free.
//!
//! # Invariants
//!
//! 1. `get()` is side-effect free (beyond dependency tracking) and works
//!    with zero listeners; the value persists independent of activity.
//! 2. Listeners are notified in registration order; a re-entrant `set`
//!    from inside a listener queues a fresh pass after the current one.
//! 3. `subscribe` invokes the callback exactly once, with the current
//!    value and no previous value, before returning.
//! 4. Listener-count transitions 0→1 and 1→0 drive the lifecycle state
//!    machine (mount / debounced teardown).

use std::cell::RefCell;
use std::rc::Rc;

use crate::action::{ActionCell, ActionStore};
use crate::lifecycle::{LifecycleCell, Lifecycled};
use crate::listener::{Registry, Subscription};
use crate::runtime::{DepListen, Runtime};
use crate::Readable;

/// Emission payload: new value plus the previous value (`None` only for the
/// immediate `subscribe` delivery).
type Payload<T> = (T, Option<T>);

struct AtomInner<T> {
    rt: Runtime,
    value: RefCell<T>,
    listeners: Registry<Payload<T>>,
    lifecycle: Rc<LifecycleCell>,
    actions: ActionCell,
}

/// A shared observable value cell.
///
/// Cloning creates another handle to the **same** cell: both see the same
/// value and share listeners.
pub struct Atom<T> {
    inner: Rc<AtomInner<T>>,
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug + 'static> std::fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom")
            .field("value", &*self.inner.value.borrow())
            .field("listeners", &self.inner.listeners.len())
            .field("active", &self.inner.lifecycle.active())
            .finish()
    }
}

impl<T: Clone + 'static> Atom<T> {
    /// Create an atom owned by `rt` with the given initial value.
    #[must_use]
    pub fn new(rt: &Runtime, value: T) -> Self {
        Self {
            inner: Rc::new(AtomInner {
                rt: rt.clone(),
                value: RefCell::new(value),
                listeners: Registry::new(),
                lifecycle: LifecycleCell::new(),
                actions: ActionCell::new(),
            }),
        }
    }

    /// The runtime this atom belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.rt
    }

    /// Get a clone of the current value.
    ///
    /// Inside a computed store's compute function this registers the atom
    /// as a dependency of that computed store.
    #[must_use]
    pub fn get(&self) -> T {
        self.track_read();
        self.inner.value.borrow().clone()
    }

    /// Access the current value by reference without cloning. Registers a
    /// dependency like [`get`](Atom::get).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track_read();
        f(&self.inner.value.borrow())
    }

    /// Replace the value and synchronously notify every current listener
    /// with `(new, previous)`. Always notifies, even if the new value
    /// equals the old one.
    pub fn set(&self, value: T) {
        let previous = self.inner.value.replace(value.clone());
        match self.inner.actions.current() {
            Some(tag) => tracing::trace!(action = %tag.name, id = tag.id, "atom set"),
            None => tracing::trace!("atom set"),
        }
        self.inner
            .listeners
            .emit(&self.inner.rt, (value, Some(previous)), &[]);
    }

    /// Mutate the value in place, then notify (same always-notify policy
    /// as [`set`](Atom::set)).
    pub fn update(&self, mutate: impl FnOnce(&mut T)) {
        let previous = self.inner.value.borrow().clone();
        mutate(&mut self.inner.value.borrow_mut());
        let current = self.inner.value.borrow().clone();
        self.inner
            .listeners
            .emit(&self.inner.rt, (current, Some(previous)), &[]);
    }

    /// Register a change listener and immediately invoke it once with the
    /// current value (previous value `None`).
    pub fn subscribe(&self, callback: impl Fn(&T, Option<&T>) + 'static) -> Subscription {
        let callback = Rc::new(callback);
        let adapted: Rc<dyn Fn(&Payload<T>)> = {
            let callback = Rc::clone(&callback);
            Rc::new(move |payload| callback(&payload.0, payload.1.as_ref()))
        };
        let sub = self.add_entry(adapted);
        let current = self.inner.value.borrow().clone();
        callback(&current, None);
        sub
    }

    /// Register a change listener without the immediate invocation; use
    /// when the caller already has the value and only wants future changes.
    pub fn listen(&self, callback: impl Fn(&T, Option<&T>) + 'static) -> Subscription {
        let adapted: Rc<dyn Fn(&Payload<T>)> =
            Rc::new(move |payload| callback(&payload.0, payload.1.as_ref()));
        self.add_entry(adapted)
    }

    fn add_entry(&self, callback: Rc<dyn Fn(&Payload<T>)>) -> Subscription {
        let (id, alive) = self.inner.listeners.add(None, callback);
        LifecycleCell::listener_added(&self.inner.lifecycle, &self.inner.rt);
        let weak = Rc::downgrade(&self.inner);
        let rt = self.inner.rt.clone();
        Subscription::new(
            alive,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if inner.listeners.remove(id) {
                        LifecycleCell::listener_removed(&inner.lifecycle, &rt);
                    }
                }
            }),
        )
    }

    /// Identity key for dependency edges: the shared cell's address.
    pub(crate) fn dep_key(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    /// Register an untyped invalidation listener (computed-engine edge).
    pub(crate) fn listen_invalidate(&self, callback: Rc<dyn Fn()>) -> Subscription {
        let adapted: Rc<dyn Fn(&Payload<T>)> = Rc::new(move |_| callback());
        self.add_entry(adapted)
    }

    fn track_read(&self) {
        let this = self.clone();
        self.inner.rt.track_read(self.dep_key(), move || {
            let listen: DepListen = Box::new(move |cb| this.listen_invalidate(cb));
            listen
        });
    }
}

impl<T: Clone + 'static> Readable<T> for Atom<T> {
    fn get(&self) -> T {
        Atom::get(self)
    }

    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        Atom::with(self, f)
    }
}

impl<T: Clone + 'static> Lifecycled for Atom<T> {
    fn register_mount_callback(&self, callback: Rc<dyn Fn() -> Option<crate::lifecycle::Teardown>>) {
        LifecycleCell::register_mount(&self.inner.lifecycle, callback);
    }

    fn register_start_callback(&self, callback: Rc<dyn Fn()>) {
        self.inner.lifecycle.register_start(callback);
    }

    fn register_stop_callback(&self, callback: Rc<dyn Fn()>) {
        self.inner.lifecycle.register_stop(callback);
    }

    fn active(&self) -> bool {
        self.inner.lifecycle.active()
    }
}

impl<T: Clone + 'static> ActionStore for Atom<T> {
    fn action_cell(&self) -> &ActionCell {
        &self.inner.actions
    }

    fn runtime_handle(&self) -> Runtime {
        self.inner.rt.clone()
    }
}
