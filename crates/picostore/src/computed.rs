#![forbid(unsafe_code)]

//! Derived stores with automatic dependency tracking.
//!
//! # Design
//!
//! A [`Computed<T>`] owns a compute closure and discovers its dependencies
//! by running it inside a tracking frame ([`Runtime::tracked`] internally):
//! every store `get`/`with` during the run records an edge. Edges are
//! re-collected on every recompute, so a conditional read that stops
//! happening stops producing invalidations.
//!
//! While **active** (has listeners), the store keeps one invalidation
//! subscription per dependency. A dependency change marks the store dirty
//! and schedules a single microtask; several changes before the next
//! [`Runtime::flush`] coalesce into one recompute. While **inactive** there
//! are no edges and no cache trust: every read recomputes.
//!
//! Two value slots keep inline reads and batched emission independent:
//! `cached` is the memo the last recompute produced, `emitted` is what
//! listeners last saw. The flush pass notifies only when the two differ,
//! so an equal-valued recompute is silent and an inline `get()` between a
//! change and its flush does not swallow the listener notification.
//!
//! # Invariants
//!
//! 1. `get()` never returns a stale value, active or not.
//! 2. N dependency writes before a flush cause at most one recompute and
//!    at most one notification pass.
//! 3. A recompute that produces a value equal (`PartialEq`) to the last
//!    emitted one notifies nobody.
//! 4. Deactivation drops every dependency edge; the dependencies' own
//!    lifecycles wind down through their normal debounce.
//!
//! # Failure Modes
//!
//! A panic inside the compute closure unwinds through the tracking frame
//! (the frame guard pops it) and leaves the store dirty, so the next read
//! retries the computation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ahash::AHashMap;

use crate::lifecycle::{LifecycleCell, Lifecycled, Teardown};
use crate::listener::{Registry, Subscription};
use crate::runtime::{DepListen, DepRef, Runtime};
use crate::Readable;

type Payload<T> = (T, Option<T>);

struct ComputedInner<T> {
    rt: Runtime,
    compute: Box<dyn Fn() -> T>,
    cached: RefCell<Option<T>>,
    emitted: RefCell<Option<T>>,
    dirty: Cell<bool>,
    scheduled: Cell<bool>,
    edges: RefCell<AHashMap<usize, Subscription>>,
    listeners: Registry<Payload<T>>,
    lifecycle: Rc<LifecycleCell>,
}

impl<T: Clone + PartialEq + 'static> ComputedInner<T> {
    /// Run the compute closure inside a tracking frame, refresh the memo,
    /// and (when active) reconcile dependency edges against what the run
    /// actually read.
    fn recompute(this: &Rc<Self>) -> T {
        let (value, deps) = this.rt.tracked(|| (this.compute)());
        tracing::trace!(deps = deps.len(), "computed recompute");
        *this.cached.borrow_mut() = Some(value.clone());
        this.dirty.set(false);
        if this.lifecycle.active() {
            Self::sync_edges(this, deps);
        }
        value
    }

    /// Keep edges for dependencies read again, subscribe to new ones,
    /// drop the rest.
    fn sync_edges(this: &Rc<Self>, deps: Vec<DepRef>) {
        let mut old = this.edges.take();
        let mut next = AHashMap::with_capacity(deps.len());
        for dep in deps {
            match old.remove(&dep.key) {
                Some(existing) => {
                    next.insert(dep.key, existing);
                }
                None => {
                    let weak = Rc::downgrade(this);
                    let invalidate: Rc<dyn Fn()> = Rc::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.dirty.set(true);
                            Self::schedule(&inner);
                        }
                    });
                    next.insert(dep.key, (dep.listen)(invalidate));
                }
            }
        }
        *this.edges.borrow_mut() = next;
        // Subscriptions left in `old` unsubscribe as they drop.
    }

    /// Queue the flush pass once per dirty burst.
    fn schedule(this: &Rc<Self>) {
        if this.scheduled.get() {
            return;
        }
        this.scheduled.set(true);
        let weak = Rc::downgrade(this);
        this.rt.enqueue_task(move || {
            if let Some(inner) = weak.upgrade() {
                Self::flush_pass(&inner);
            }
        });
    }

    /// Microtask body: recompute if dirty, notify if the memo moved past
    /// what listeners last saw.
    fn flush_pass(this: &Rc<Self>) {
        this.scheduled.set(false);
        if !this.lifecycle.active() {
            return;
        }
        if this.dirty.get() {
            Self::recompute(this);
        }
        let current = match this.cached.borrow().as_ref() {
            Some(value) => value.clone(),
            None => return,
        };
        let previous = this.emitted.borrow().clone();
        if previous.as_ref() == Some(&current) {
            return;
        }
        *this.emitted.borrow_mut() = Some(current.clone());
        this.listeners.emit(&this.rt, (current, previous), &[]);
    }
}

/// A store whose value is derived from other stores.
///
/// Cloning creates another handle to the same derived cell.
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: std::fmt::Debug + 'static> std::fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("cached", &*self.inner.cached.borrow())
            .field("dirty", &self.inner.dirty.get())
            .field("listeners", &self.inner.listeners.len())
            .field("active", &self.inner.lifecycle.active())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    /// Create a derived store. `compute` runs lazily: nothing happens until
    /// the first read or the first listener.
    #[must_use]
    pub fn new(rt: &Runtime, compute: impl Fn() -> T + 'static) -> Self {
        let inner = Rc::new(ComputedInner {
            rt: rt.clone(),
            compute: Box::new(compute),
            cached: RefCell::new(None),
            emitted: RefCell::new(None),
            dirty: Cell::new(true),
            scheduled: Cell::new(false),
            edges: RefCell::new(AHashMap::new()),
            listeners: Registry::new(),
            lifecycle: LifecycleCell::new(),
        });

        // Activation wires the dependency edges; deactivation drops them
        // and stops trusting the memo.
        let weak = Rc::downgrade(&inner);
        LifecycleCell::register_mount(
            &inner.lifecycle,
            Rc::new(move || {
                let inner = weak.upgrade()?;
                ComputedInner::recompute(&inner);
                *inner.emitted.borrow_mut() = inner.cached.borrow().clone();
                let weak = Rc::downgrade(&inner);
                Some(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.edges.borrow_mut().clear();
                        inner.dirty.set(true);
                    }
                }) as Teardown)
            }),
        );

        Self { inner }
    }

    /// Derive from one source store.
    #[must_use]
    pub fn from1<A, SA>(rt: &Runtime, source: &SA, derive: impl Fn(&A) -> T + 'static) -> Self
    where
        A: Clone + 'static,
        SA: Readable<A> + Clone + 'static,
    {
        let source = source.clone();
        Self::new(rt, move || source.with(|a| derive(a)))
    }

    /// Derive from two source stores.
    #[must_use]
    pub fn from2<A, B, SA, SB>(
        rt: &Runtime,
        a: &SA,
        b: &SB,
        derive: impl Fn(&A, &B) -> T + 'static,
    ) -> Self
    where
        A: Clone + 'static,
        B: Clone + 'static,
        SA: Readable<A> + Clone + 'static,
        SB: Readable<B> + Clone + 'static,
    {
        let a = a.clone();
        let b = b.clone();
        Self::new(rt, move || {
            let av = a.get();
            b.with(|bv| derive(&av, bv))
        })
    }

    /// Derive from three source stores.
    #[must_use]
    pub fn from3<A, B, C, SA, SB, SC>(
        rt: &Runtime,
        a: &SA,
        b: &SB,
        c: &SC,
        derive: impl Fn(&A, &B, &C) -> T + 'static,
    ) -> Self
    where
        A: Clone + 'static,
        B: Clone + 'static,
        C: Clone + 'static,
        SA: Readable<A> + Clone + 'static,
        SB: Readable<B> + Clone + 'static,
        SC: Readable<C> + Clone + 'static,
    {
        let a = a.clone();
        let b = b.clone();
        let c = c.clone();
        Self::new(rt, move || {
            let av = a.get();
            let bv = b.get();
            c.with(|cv| derive(&av, &bv, cv))
        })
    }

    /// The runtime this store belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.rt
    }

    /// Get a clone of the derived value, recomputing first if the memo
    /// cannot be trusted. Never returns a stale value.
    #[must_use]
    pub fn get(&self) -> T {
        self.with(Clone::clone)
    }

    /// Access the derived value by reference. Same freshness guarantee as
    /// [`get`](Computed::get).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track_read();
        if self.inner.lifecycle.active() && !self.inner.dirty.get() {
            if let Some(value) = self.inner.cached.borrow().as_ref() {
                return f(value);
            }
        }
        let value = ComputedInner::recompute(&self.inner);
        f(&value)
    }

    /// Register a change listener and immediately invoke it once with the
    /// current derived value (previous value `None`).
    pub fn subscribe(&self, callback: impl Fn(&T, Option<&T>) + 'static) -> Subscription {
        let callback = Rc::new(callback);
        let adapted: Rc<dyn Fn(&Payload<T>)> = {
            let callback = Rc::clone(&callback);
            Rc::new(move |payload| callback(&payload.0, payload.1.as_ref()))
        };
        let sub = self.add_entry(adapted);
        // The memo may still be dirty here: registration only recomputes on
        // the first listener, and a source may have written since the last
        // flush. Same freshness rule as `get`.
        let memo = if self.inner.dirty.get() {
            None
        } else {
            self.inner.cached.borrow().clone()
        };
        let current = match memo {
            Some(value) => value,
            None => ComputedInner::recompute(&self.inner),
        };
        callback(&current, None);
        sub
    }

    /// Register a change listener without the immediate invocation.
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

    pub(crate) fn dep_key(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

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

impl<T: Clone + PartialEq + 'static> Readable<T> for Computed<T> {
    fn get(&self) -> T {
        Computed::get(self)
    }

    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        Computed::with(self, f)
    }
}

impl<T: Clone + PartialEq + 'static> Lifecycled for Computed<T> {
    fn register_mount_callback(&self, callback: Rc<dyn Fn() -> Option<Teardown>>) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use web_time::Duration;

    #[test]
    fn lazy_first_compute() {
        let rt = Runtime::lab();
        let source = rt.atom(2);
        let computes = Rc::new(Cell::new(0u32));

        let s = source.clone();
        let c = Rc::clone(&computes);
        let doubled = rt.computed(move || {
            c.set(c.get() + 1);
            s.get() * 2
        });

        assert_eq!(computes.get(), 0);
        assert_eq!(doubled.get(), 4);
        assert_eq!(computes.get(), 1);
    }

    #[test]
    fn inactive_reads_always_recompute() {
        let rt = Runtime::lab();
        let source = rt.atom(1);
        let computes = Rc::new(Cell::new(0u32));

        let s = source.clone();
        let c = Rc::clone(&computes);
        let derived = rt.computed(move || {
            c.set(c.get() + 1);
            s.get() + 1
        });

        assert_eq!(derived.get(), 2);
        source.set(10);
        assert_eq!(derived.get(), 11, "no edges while inactive, so the read recomputes");
        assert_eq!(computes.get(), 2);
    }

    #[test]
    fn active_reads_hit_the_memo() {
        let rt = Runtime::lab();
        let source = rt.atom(1);
        let computes = Rc::new(Cell::new(0u32));

        let s = source.clone();
        let c = Rc::clone(&computes);
        let derived = rt.computed(move || {
            c.set(c.get() + 1);
            s.get() + 1
        });

        let _sub = derived.listen(|_, _| {});
        assert_eq!(computes.get(), 1, "mount computed once");
        assert_eq!(derived.get(), 2);
        assert_eq!(derived.get(), 2);
        assert_eq!(computes.get(), 1, "clean memo serves repeated reads");
    }

    #[test]
    fn burst_of_writes_coalesces_into_one_recompute() {
        let rt = Runtime::lab();
        let a = rt.atom(1);
        let b = rt.atom(10);
        let computes = Rc::new(Cell::new(0u32));

        let (a2, b2) = (a.clone(), b.clone());
        let c = Rc::clone(&computes);
        let sum = rt.computed(move || {
            c.set(c.get() + 1);
            a2.get() + b2.get()
        });

        let emissions = Rc::new(RefCell::new(Vec::new()));
        let e = Rc::clone(&emissions);
        let _sub = sum.listen(move |new, _| e.borrow_mut().push(*new));
        assert_eq!(computes.get(), 1);

        a.set(2);
        b.set(20);
        a.set(3);
        assert_eq!(emissions.borrow().len(), 0, "nothing until flush");

        rt.flush();
        assert_eq!(computes.get(), 2, "three writes, one recompute");
        assert_eq!(*emissions.borrow(), vec![23]);
    }

    #[test]
    fn inline_get_between_write_and_flush_stays_fresh_and_still_emits() {
        let rt = Runtime::lab();
        let source = rt.atom(1);

        let s = source.clone();
        let derived = rt.computed(move || s.get() * 10);

        let emissions = Rc::new(RefCell::new(Vec::new()));
        let e = Rc::clone(&emissions);
        let _sub = derived.listen(move |new, old| e.borrow_mut().push((*new, old.copied())));

        source.set(2);
        assert_eq!(derived.get(), 20, "inline read sees the new value before flush");
        rt.flush();
        assert_eq!(*emissions.borrow(), vec![(20, Some(10))]);
    }

    #[test]
    fn equal_result_is_silent() {
        let rt = Runtime::lab();
        let source = rt.atom(2);

        let s = source.clone();
        let parity = rt.computed(move || s.get() % 2);

        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let _sub = parity.listen(move |_, _| c.set(c.get() + 1));

        source.set(4);
        rt.flush();
        assert_eq!(count.get(), 0, "parity unchanged");

        source.set(5);
        rt.flush();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn conditional_dependency_is_dropped_when_untaken() {
        let rt = Runtime::lab();
        let gate = rt.atom(true);
        let left = rt.atom(1);
        let right = rt.atom(100);
        let computes = Rc::new(Cell::new(0u32));

        let (g, l, r) = (gate.clone(), left.clone(), right.clone());
        let c = Rc::clone(&computes);
        let picked = rt.computed(move || {
            c.set(c.get() + 1);
            if g.get() { l.get() } else { r.get() }
        });

        let _sub = picked.listen(|_, _| {});
        assert_eq!(computes.get(), 1);

        right.set(200);
        rt.flush();
        assert_eq!(computes.get(), 1, "untaken branch must not invalidate");

        gate.set(false);
        rt.flush();
        assert_eq!(computes.get(), 2);
        assert_eq!(picked.get(), 200);

        left.set(2);
        rt.flush();
        assert_eq!(computes.get(), 2, "left edge was dropped on re-track");
    }

    #[test]
    fn computed_chains_propagate_through_flush() {
        let rt = Runtime::lab();
        let source = rt.atom(1);

        let s = source.clone();
        let doubled = rt.computed(move || s.get() * 2);
        let d = doubled.clone();
        let plus_one = rt.computed(move || d.get() + 1);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sn = Rc::clone(&seen);
        let _sub = plus_one.listen(move |new, _| sn.borrow_mut().push(*new));

        source.set(5);
        rt.flush();
        assert_eq!(*seen.borrow(), vec![11]);
        assert_eq!(plus_one.get(), 11);
    }

    #[test]
    fn diamond_emits_once_per_flush() {
        let rt = Runtime::lab();
        let root = rt.atom(1);

        let r1 = root.clone();
        let a = rt.computed(move || r1.get() + 1);
        let r2 = root.clone();
        let b = rt.computed(move || r2.get() * 10);
        let joined = Computed::from2(&rt, &a, &b, |x, y| x + y);

        let emissions = Rc::new(RefCell::new(Vec::new()));
        let e = Rc::clone(&emissions);
        let _sub = joined.listen(move |new, _| e.borrow_mut().push(*new));

        root.set(2);
        rt.flush();
        assert_eq!(*emissions.borrow(), vec![23], "(2+1) + (2*10), emitted once");
    }

    #[test]
    fn from3_combines_sources() {
        let rt = Runtime::lab();
        let a = rt.atom(1);
        let b = rt.atom(2);
        let c = rt.atom(3);
        let total = Computed::from3(&rt, &a, &b, &c, |x, y, z| x + y + z);
        assert_eq!(total.get(), 6);
        b.set(20);
        assert_eq!(total.get(), 24);
    }

    #[test]
    fn subscribe_delivers_fresh_value_immediately() {
        let rt = Runtime::lab();
        let source = rt.atom(3);
        let s = source.clone();
        let squared = rt.computed(move || {
            let v = s.get();
            v * v
        });

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sn = Rc::clone(&seen);
        let _sub = squared.subscribe(move |new, old| sn.borrow_mut().push((*new, old.copied())));
        assert_eq!(*seen.borrow(), vec![(9, None)]);
    }

    #[test]
    fn subscribe_on_dirty_store_delivers_the_current_value() {
        let rt = Runtime::lab();
        let source = rt.atom(1);
        let s = source.clone();
        let derived = rt.computed(move || s.get() * 10);

        // First listener activates the store; the write marks it dirty
        // without flushing.
        let _first = derived.listen(|_, _| {});
        source.set(2);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sn = Rc::clone(&seen);
        let _second = derived.subscribe(move |new, old| sn.borrow_mut().push((*new, old.copied())));
        assert_eq!(*seen.borrow(), vec![(20, None)], "immediate delivery must not be stale");
    }

    #[test]
    fn debug_reports_dirty_and_listener_count() {
        let rt = Runtime::lab();
        let source = rt.atom(1);
        let s = source.clone();
        let derived = rt.computed(move || s.get());
        let _sub = derived.listen(|_, _| {});
        let rendered = format!("{derived:?}");
        assert!(rendered.contains("dirty: false"), "{rendered}");
        assert!(rendered.contains("listeners: 1"), "{rendered}");
    }

    #[test]
    fn deactivation_unwinds_dependency_lifecycles() {
        let rt = Runtime::lab();
        let source = rt.atom(1);
        let s = source.clone();
        let derived = rt.computed(move || s.get());

        let sub = derived.listen(|_, _| {});
        assert!(source.active(), "edge keeps the dependency mounted");

        sub.unsubscribe();
        rt.advance(Duration::from_millis(1000));
        assert!(!derived.active());
        rt.advance(Duration::from_millis(1000));
        assert!(!source.active(), "dropped edge lets the dependency wind down");
    }
}
