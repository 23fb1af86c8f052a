#![forbid(unsafe_code)]

//! Mount/unmount lifecycle with debounced teardown.
//!
//! # Design
//!
//! Every store carries a [`LifecycleCell`] driven by its listener-count
//! transitions:
//!
//! ```text
//!              first listener              last listener leaves
//!  Inactive ────────────────► Active ────────────────────────► Stopping
//!     ▲                         ▲                                  │
//!     │   debounce elapses,     │   listener added before the      │
//!     └──── teardowns run ──────┴──── debounce timer elapses ──────┘
//! ```
//!
//! Mount callbacks run on `Inactive → Active`, may call `set` to seed a
//! value, and may return a teardown closure. Teardowns run only when the
//! debounce window elapses with the listener count still at zero, so rapid
//! subscribe/unsubscribe churn (a component remounting, or a
//! subscribe-read-unsubscribe one-shot) does not thrash expensive setup.
//! Re-activation during the window cancels the timer and re-runs nothing.
//!
//! # Invariants
//!
//! 1. `active()` is true iff the listener count is > 0 OR a teardown timer
//!    is pending (`Stopping`).
//! 2. Mount callbacks run at most once per `Inactive → Active` transition;
//!    `Stopping → Active` re-runs nothing.
//! 3. Teardowns run in mount-registration order, exactly once per
//!    `Stopping → Inactive` transition.
//! 4. State and listener count are committed before user callbacks run, so
//!    a panicking callback leaves the bookkeeping consistent.
//!
//! # Failure Modes
//!
//! - **Mount or teardown panic**: propagates to the caller that triggered
//!   the transition (listener add, or the timer poll). Callbacks later in
//!   the same batch are skipped; the state machine itself is already in its
//!   target state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::runtime::{Runtime, TimerHandle};

/// Teardown closure returned by a mount callback.
pub type Teardown = Box<dyn FnOnce()>;

type MountFn = dyn Fn() -> Option<Teardown>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Inactive,
    Active,
    Stopping,
}

/// Per-store lifecycle bookkeeping. Stores hold it behind an `Rc` so the
/// debounce timer can reach it after the triggering call returns.
pub(crate) struct LifecycleCell {
    state: Cell<State>,
    count: Cell<usize>,
    mounts: RefCell<Vec<Rc<MountFn>>>,
    starts: RefCell<Vec<Rc<dyn Fn()>>>,
    stops: RefCell<Vec<Rc<dyn Fn()>>>,
    teardowns: RefCell<Vec<Teardown>>,
    timer: RefCell<Option<TimerHandle>>,
}

impl LifecycleCell {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(State::Inactive),
            count: Cell::new(0),
            mounts: RefCell::new(Vec::new()),
            starts: RefCell::new(Vec::new()),
            stops: RefCell::new(Vec::new()),
            teardowns: RefCell::new(Vec::new()),
            timer: RefCell::new(None),
        })
    }

    pub(crate) fn active(&self) -> bool {
        self.state.get() != State::Inactive
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.count.get()
    }

    /// A listener joined. Handles `Inactive → Active` (run starts + mounts)
    /// and `Stopping → Active` (cancel the pending teardown).
    pub(crate) fn listener_added(this: &Rc<Self>, _rt: &Runtime) {
        this.count.set(this.count.get() + 1);
        if this.count.get() != 1 {
            return;
        }
        match this.state.get() {
            State::Stopping => {
                if let Some(timer) = this.timer.borrow_mut().take() {
                    timer.cancel();
                }
                this.state.set(State::Active);
                tracing::debug!("store re-activated within debounce window");
            }
            State::Inactive => {
                this.state.set(State::Active);
                tracing::debug!("store mounting");
                this.run_starts_and_mounts();
            }
            State::Active => {}
        }
    }

    /// A listener left. On the 1 → 0 transition, arm the debounced
    /// teardown timer.
    pub(crate) fn listener_removed(this: &Rc<Self>, rt: &Runtime) {
        this.count.set(this.count.get().saturating_sub(1));
        if this.count.get() != 0 || this.state.get() != State::Active {
            return;
        }
        this.state.set(State::Stopping);
        let window = rt.config().teardown_debounce_window();
        let cell = Rc::clone(this);
        let handle = rt.schedule_timer(window, move || cell.finish_stop());
        *this.timer.borrow_mut() = Some(handle);
        tracing::debug!(debounce_ms = window.as_millis() as u64, "store stopping");
    }

    /// Register a mount callback. If the store is already active, the setup
    /// runs immediately and its teardown is remembered.
    pub(crate) fn register_mount(this: &Rc<Self>, callback: Rc<MountFn>) {
        this.mounts.borrow_mut().push(Rc::clone(&callback));
        if this.state.get() != State::Inactive {
            if let Some(teardown) = callback() {
                this.teardowns.borrow_mut().push(teardown);
            }
        }
    }

    pub(crate) fn register_start(&self, callback: Rc<dyn Fn()>) {
        self.starts.borrow_mut().push(callback);
    }

    pub(crate) fn register_stop(&self, callback: Rc<dyn Fn()>) {
        self.stops.borrow_mut().push(callback);
    }

    fn run_starts_and_mounts(&self) {
        // Snapshots: a callback may register further hooks on this store.
        let starts: Vec<_> = self.starts.borrow().clone();
        for start in starts {
            start();
        }
        let mounts: Vec<_> = self.mounts.borrow().clone();
        for mount in mounts {
            if let Some(teardown) = mount() {
                self.teardowns.borrow_mut().push(teardown);
            }
        }
    }

    fn finish_stop(&self) {
        if self.state.get() != State::Stopping || self.count.get() != 0 {
            return;
        }
        self.state.set(State::Inactive);
        *self.timer.borrow_mut() = None;
        tracing::debug!("store unmounting");
        // Teardowns first; stop observers see a fully unmounted store.
        let teardowns: Vec<Teardown> = std::mem::take(&mut *self.teardowns.borrow_mut());
        for teardown in teardowns {
            teardown();
        }
        let stops: Vec<_> = self.stops.borrow().clone();
        for stop in stops {
            stop();
        }
    }
}

/// Lifecycle hook surface shared by every store kind.
///
/// `on_mount` pairs setup with teardown; `on_start`/`on_stop` observe the
/// same transitions without the paired-closure shape. Hooks registered on an
/// already-active store: `on_mount` runs its setup immediately, the others
/// wait for the next transition.
pub trait Lifecycled {
    #[doc(hidden)]
    fn register_mount_callback(&self, callback: Rc<MountFn>);
    #[doc(hidden)]
    fn register_start_callback(&self, callback: Rc<dyn Fn()>);
    #[doc(hidden)]
    fn register_stop_callback(&self, callback: Rc<dyn Fn()>);

    /// Whether the store currently has listeners or a pending teardown.
    fn active(&self) -> bool;

    /// Register setup to run when the store gains its first listener. The
    /// returned closure, if any, runs as teardown after the debounce window
    /// following the last listener's departure.
    fn on_mount(&self, callback: impl Fn() -> Option<Teardown> + 'static) {
        self.register_mount_callback(Rc::new(callback));
    }

    /// Observe `Inactive → Active` transitions.
    fn on_start(&self, callback: impl Fn() + 'static) {
        self.register_start_callback(Rc::new(callback));
    }

    /// Observe debounced `Stopping → Inactive` transitions.
    fn on_stop(&self, callback: impl Fn() + 'static) {
        self.register_stop_callback(Rc::new(callback));
    }
}
