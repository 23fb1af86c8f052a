#![forbid(unsafe_code)]

//! Cooperative runtime: clock, timers, microtasks, and per-runtime counters.
//!
//! # Design
//!
//! Stores do not reach for global state. Every store is created against a
//! [`Runtime`], a cheaply cloneable handle (`Rc` inside) that owns the whole
//! cooperative scheduling surface:
//!
//! - a **microtask queue**, drained by [`flush()`](Runtime::flush). Computed
//!   stores schedule their batched recomputation here.
//! - a **timer queue** (min-heap of cancellable entries), fired by
//!   [`advance()`](Runtime::advance) on a lab clock or
//!   [`poll()`](Runtime::poll) on the real clock. The lifecycle debounce
//!   lives here.
//! - an **emission queue** that serializes notification passes, so a `set`
//!   performed inside a listener starts a fresh pass after the current one
//!   finishes instead of interleaving callbacks.
//! - the **tracking stack** of dependency-collection frames used by computed
//!   stores, push/pop scoped and reentrant for nested computations.
//! - the **action id** and **pending action** counters.
//!
//! Constructing a fresh `Runtime` per test gives full isolation; there is no
//! shared mutable state between runtimes.
//!
//! # Invariants
//!
//! 1. Notification passes never interleave: at most one pass runs at a time
//!    and re-entrant emissions are appended to the queue.
//! 2. A microtask enqueued during a flush runs in the same flush.
//! 3. A cancelled timer never fires; an elapsed timer fires exactly once.
//! 4. `advance`/`poll` fire every due timer before flushing microtasks.
//! 5. Tracking frames are popped even when the tracked closure panics.
//!
//! # Failure Modes
//!
//! - **Listener panic during a pass**: the panic propagates to the caller
//!   that triggered the emission. Remaining queued passes stay queued and
//!   are drained by the next emission; the pass-in-progress flag is reset
//!   via an RAII guard so the runtime stays usable.
//! - **`advance` on a real-clock runtime**: panics; advancing wall-clock
//!   time is only meaningful with [`Runtime::lab`].

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;

use web_time::{Duration, Instant};

use crate::error::StoreError;
use crate::listener::Subscription;

/// Default grace period between the last listener leaving and teardown.
pub const DEFAULT_TEARDOWN_DEBOUNCE: Duration = Duration::from_millis(1000);

// ─── Configuration ───────────────────────────────────────────────────────────

/// Tunables for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    teardown_debounce: Duration,
}

impl RuntimeConfig {
    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            teardown_debounce: DEFAULT_TEARDOWN_DEBOUNCE,
        }
    }

    /// Set the debounce window between a store losing its last listener and
    /// its teardown callbacks running. Zero is legal and means teardown runs
    /// on the next timer poll.
    #[must_use]
    pub fn teardown_debounce(mut self, window: Duration) -> Self {
        self.teardown_debounce = window;
        self
    }

    /// The configured debounce window.
    #[must_use]
    pub fn teardown_debounce_window(&self) -> Duration {
        self.teardown_debounce
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Clock ───────────────────────────────────────────────────────────────────

/// Time source: real wall clock, or a manually advanced lab clock for
/// deterministic tests.
#[derive(Debug)]
enum Clock {
    Real,
    Lab { epoch: Instant, offset: Cell<Duration> },
}

impl Clock {
    fn now(&self) -> Instant {
        match self {
            Self::Real => Instant::now(),
            Self::Lab { epoch, offset } => *epoch + offset.get(),
        }
    }
}

// ─── Timers ──────────────────────────────────────────────────────────────────

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Rc<Cell<bool>>,
    callback: Option<Box<dyn FnOnce()>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cancellation handle for a scheduled timer.
///
/// Dropping the handle does NOT cancel the timer; call
/// [`cancel()`](TimerHandle::cancel).
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    /// Prevent the timer from firing. Idempotent; cancelling an already
    /// fired timer is a no-op.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// Whether the timer has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

// ─── Dependency tracking ─────────────────────────────────────────────────────

/// Type-erased subscription factory a store hands to the active tracking
/// frame when it is read. Invoked at most once, with the invalidation
/// callback of the computed store that performed the read.
pub(crate) type DepListen = Box<dyn FnOnce(Rc<dyn Fn()>) -> Subscription>;

/// One discovered dependency edge: the source store's identity key plus a
/// way to listen to it.
pub(crate) struct DepRef {
    pub(crate) key: usize,
    pub(crate) listen: DepListen,
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

struct RuntimeInner {
    config: RuntimeConfig,
    clock: Clock,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_seq: Cell<u64>,
    tasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    flushing: Cell<bool>,
    emissions: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    emitting: Cell<bool>,
    tracking: RefCell<Vec<Vec<DepRef>>>,
    next_action_id: Cell<u64>,
    pending_actions: Cell<usize>,
}

/// Handle to the cooperative runtime. Cloning is cheap and all clones share
/// the same queues, clock, and counters.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("pending_timers", &self.inner.timers.borrow().len())
            .field("pending_tasks", &self.inner.tasks.borrow().len())
            .field("pending_actions", &self.inner.pending_actions.get())
            .finish()
    }
}

impl Runtime {
    /// Create a runtime on the real clock with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::new())
    }

    /// Create a runtime on the real clock with the given configuration.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::build(config, Clock::Real)
    }

    /// Create a runtime on a manually advanced lab clock (deterministic
    /// tests). Time moves only through [`advance()`](Runtime::advance).
    #[must_use]
    pub fn lab() -> Self {
        Self::lab_with_config(RuntimeConfig::new())
    }

    /// Lab-clock runtime with explicit configuration.
    #[must_use]
    pub fn lab_with_config(config: RuntimeConfig) -> Self {
        Self::build(
            config,
            Clock::Lab {
                epoch: Instant::now(),
                offset: Cell::new(Duration::ZERO),
            },
        )
    }

    fn build(config: RuntimeConfig, clock: Clock) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                clock,
                timers: RefCell::new(BinaryHeap::new()),
                timer_seq: Cell::new(0),
                tasks: RefCell::new(VecDeque::new()),
                flushing: Cell::new(false),
                emissions: RefCell::new(VecDeque::new()),
                emitting: Cell::new(false),
                tracking: RefCell::new(Vec::new()),
                next_action_id: Cell::new(1),
                pending_actions: Cell::new(0),
            }),
        }
    }

    /// The runtime's configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Current time according to this runtime's clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.inner.clock.now()
    }

    /// Whether this runtime uses a lab clock.
    #[must_use]
    pub fn is_lab(&self) -> bool {
        matches!(self.inner.clock, Clock::Lab { .. })
    }

    // ── Store factories ──────────────────────────────────────────────

    /// Create an [`Atom`](crate::atom::Atom) owned by this runtime.
    #[must_use]
    pub fn atom<T: Clone + 'static>(&self, value: T) -> crate::atom::Atom<T> {
        crate::atom::Atom::new(self, value)
    }

    /// Create a [`MapStore`](crate::map::MapStore) owned by this runtime.
    #[must_use]
    pub fn map<V: Clone + PartialEq + 'static>(
        &self,
        initial: impl IntoIterator<Item = (String, V)>,
    ) -> crate::map::MapStore<V> {
        crate::map::MapStore::new(self, initial)
    }

    /// Create an auto-tracking [`Computed`](crate::computed::Computed) store.
    #[must_use]
    pub fn computed<T: Clone + PartialEq + 'static>(
        &self,
        compute: impl Fn() -> T + 'static,
    ) -> crate::computed::Computed<T> {
        crate::computed::Computed::new(self, compute)
    }

    // ── Microtasks ───────────────────────────────────────────────────

    /// Queue a closure to run at the next [`flush()`](Runtime::flush).
    pub fn enqueue_task(&self, task: impl FnOnce() + 'static) {
        self.inner.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Drain the microtask queue to quiescence. Tasks enqueued while
    /// flushing run in the same flush. Re-entrant calls are no-ops.
    pub fn flush(&self) {
        if self.inner.flushing.get() {
            return;
        }
        self.inner.flushing.set(true);
        let _reset = FlagGuard(&self.inner.flushing);
        loop {
            let next = self.inner.tasks.borrow_mut().pop_front();
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Schedule `callback` to fire once `after` has elapsed on this
    /// runtime's clock. Returns a cancellation handle.
    pub fn schedule_timer(
        &self,
        after: Duration,
        callback: impl FnOnce() + 'static,
    ) -> TimerHandle {
        let seq = self.inner.timer_seq.get();
        self.inner.timer_seq.set(seq + 1);
        let cancelled = Rc::new(Cell::new(false));
        self.inner.timers.borrow_mut().push(TimerEntry {
            deadline: self.now() + after,
            seq,
            cancelled: Rc::clone(&cancelled),
            callback: Some(Box::new(callback)),
        });
        TimerHandle { cancelled }
    }

    /// Advance the lab clock by `delta`, fire every timer that became due,
    /// then flush microtasks.
    ///
    /// # Panics
    ///
    /// Panics on a real-clock runtime; use [`poll()`](Runtime::poll) there.
    pub fn advance(&self, delta: Duration) {
        match &self.inner.clock {
            Clock::Lab { offset, .. } => offset.set(offset.get() + delta),
            Clock::Real => panic!("Runtime::advance requires a lab clock; use Runtime::poll"),
        }
        self.fire_due_timers();
        self.flush();
    }

    /// Fire every timer due at the current clock reading, then flush
    /// microtasks. On a real clock, call this from the host's tick loop.
    pub fn poll(&self) {
        self.fire_due_timers();
        self.flush();
    }

    fn fire_due_timers(&self) {
        loop {
            let due = {
                let mut timers = self.inner.timers.borrow_mut();
                match timers.peek() {
                    Some(entry) if entry.deadline <= self.now() => timers.pop(),
                    _ => None,
                }
            };
            let Some(mut entry) = due else { break };
            if entry.cancelled.get() {
                continue;
            }
            if let Some(callback) = entry.callback.take() {
                callback();
            }
        }
    }

    // ── Emissions ────────────────────────────────────────────────────

    /// Append a notification pass and, unless a pass is already running,
    /// drain the queue. Called by store notify paths; a `set` inside a
    /// listener therefore queues a fresh pass instead of recursing.
    pub(crate) fn enqueue_emission(&self, pass: Box<dyn FnOnce()>) {
        self.inner.emissions.borrow_mut().push_back(pass);
        if self.inner.emitting.get() {
            return;
        }
        self.inner.emitting.set(true);
        let _reset = FlagGuard(&self.inner.emitting);
        loop {
            let next = self.inner.emissions.borrow_mut().pop_front();
            match next {
                Some(pass) => pass(),
                None => break,
            }
        }
    }

    // ── Dependency tracking ──────────────────────────────────────────

    /// Run `compute` under a fresh dependency-collection frame and return
    /// its result together with the exact set of stores it read.
    pub(crate) fn tracked<R>(&self, compute: impl FnOnce() -> R) -> (R, Vec<DepRef>) {
        self.inner.tracking.borrow_mut().push(Vec::new());
        let mut guard = FrameGuard {
            tracking: &self.inner.tracking,
            armed: true,
        };
        let result = compute();
        guard.armed = false;
        let frame = self
            .inner
            .tracking
            .borrow_mut()
            .pop()
            .expect("tracking frame pushed above");
        (result, frame)
    }

    /// Register a store read with the innermost tracking frame, if any.
    /// `make_listen` is only invoked for the first read of a given store
    /// within a frame.
    pub(crate) fn track_read(&self, key: usize, make_listen: impl FnOnce() -> DepListen) {
        let mut stack = self.inner.tracking.borrow_mut();
        if let Some(frame) = stack.last_mut() {
            if !frame.iter().any(|dep| dep.key == key) {
                frame.push(DepRef {
                    key,
                    listen: make_listen(),
                });
            }
        }
    }

    // ── Counters ─────────────────────────────────────────────────────

    /// Allocate a fresh monotonically increasing action id.
    #[must_use]
    pub fn next_action_id(&self) -> u64 {
        let id = self.inner.next_action_id.get();
        self.inner.next_action_id.set(id + 1);
        id
    }

    /// Number of asynchronous actions that have started but not settled.
    #[must_use]
    pub fn pending_actions(&self) -> usize {
        self.inner.pending_actions.get()
    }

    pub(crate) fn action_started(&self) {
        self.inner
            .pending_actions
            .set(self.inner.pending_actions.get() + 1);
    }

    pub(crate) fn action_settled(&self) {
        self.inner
            .pending_actions
            .set(self.inner.pending_actions.get().saturating_sub(1));
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets a busy flag when a queue drain unwinds.
struct FlagGuard<'a>(&'a Cell<bool>);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Pops an abandoned tracking frame when the tracked closure unwinds.
struct FrameGuard<'a> {
    tracking: &'a RefCell<Vec<Vec<DepRef>>>,
    armed: bool,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracking.borrow_mut().pop();
        }
    }
}

// ─── Deferred ────────────────────────────────────────────────────────────────

enum DeferredState<T, E> {
    Pending,
    Settled(Result<T, E>),
}

struct DeferredInner<T, E> {
    state: DeferredState<T, E>,
    observers: Vec<Box<dyn FnOnce(&Result<T, E>)>>,
}

/// A single-threaded promise: the runtime's model of a "deferred
/// computation" produced by an asynchronous mutation function.
///
/// A deferred settles exactly once, via [`resolve`](Deferred::resolve) or
/// [`reject`](Deferred::reject). Observers registered with
/// [`on_settle`](Deferred::on_settle) run immediately at settlement, in
/// registration order; observers registered after settlement run inline.
///
/// There is no cancellation: the engine can only report a deferred's
/// existence (see [`Runtime::pending_actions`]), never abort it.
pub struct Deferred<T, E> {
    inner: Rc<RefCell<DeferredInner<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> std::fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settled = matches!(self.inner.borrow().state, DeferredState::Settled(_));
        f.debug_struct("Deferred").field("settled", &settled).finish()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Deferred<T, E> {
    /// Create a pending deferred.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(DeferredInner {
                state: DeferredState::Pending,
                observers: Vec::new(),
            })),
        }
    }

    /// An already-resolved deferred.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        let _ = deferred.resolve(value);
        deferred
    }

    /// An already-rejected deferred.
    #[must_use]
    pub fn rejected(error: E) -> Self {
        let deferred = Self::new();
        let _ = deferred.reject(error);
        deferred
    }

    /// Settle with a success value. Errors if already settled.
    pub fn resolve(&self, value: T) -> Result<(), StoreError> {
        self.settle(Ok(value))
    }

    /// Settle with a failure. Errors if already settled.
    pub fn reject(&self, error: E) -> Result<(), StoreError> {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, E>) -> Result<(), StoreError> {
        let observers = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, DeferredState::Settled(_)) {
                return Err(StoreError::AlreadySettled);
            }
            inner.state = DeferredState::Settled(outcome.clone());
            std::mem::take(&mut inner.observers)
        };
        for observer in observers {
            observer(&outcome);
        }
        Ok(())
    }

    /// Observe settlement. Runs inline if already settled.
    pub fn on_settle(&self, observer: impl FnOnce(&Result<T, E>) + 'static) {
        let settled = {
            let inner = self.inner.borrow();
            match &inner.state {
                DeferredState::Settled(outcome) => Some(outcome.clone()),
                DeferredState::Pending => None,
            }
        };
        match settled {
            Some(outcome) => observer(&outcome),
            None => self.inner.borrow_mut().observers.push(Box::new(observer)),
        }
    }

    /// Whether the deferred has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self.inner.borrow().state, DeferredState::Settled(_))
    }

    /// Clone of the settled outcome, or `None` while pending. The failure
    /// path is never swallowed by the engine: callers see the original
    /// error here.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().state {
            DeferredState::Settled(outcome) => Some(outcome.clone()),
            DeferredState::Pending => None,
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}
