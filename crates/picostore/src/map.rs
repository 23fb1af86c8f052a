#![forbid(unsafe_code)]

//! Keyed store with per-key change detection.
//!
//! # Design
//!
//! [`MapStore<V>`] holds a `String → V` map and reports **which keys
//! changed** alongside the new map snapshot. Unlike [`Atom`](crate::atom::Atom),
//! a write that leaves a key's value equal to the stored one (by
//! `PartialEq`) is a no-op and produces zero notifications.
//!
//! Key-filtered listeners ([`listen_keys`](MapStore::listen_keys)) fire only
//! when the changed-key set intersects their filter; the filter must be
//! non-empty or registration fails with
//! [`StoreError::EmptyKeyFilter`](crate::error::StoreError::EmptyKeyFilter).
//!
//! # Invariants
//!
//! 1. Whole-map [`set`](MapStore::set) emits at most one notification pass
//!    carrying every added, removed, and value-changed key.
//! 2. Changed-key lists are sorted, so notification content is
//!    deterministic regardless of hash-map iteration order.
//! 3. A removed key appears in the changed list exactly like a changed one;
//!    listeners distinguish removal by its absence from the snapshot.

use std::rc::Rc;
use std::cell::RefCell;

use ahash::AHashMap;

use crate::action::{ActionCell, ActionStore};
use crate::error::StoreError;
use crate::lifecycle::{LifecycleCell, Lifecycled};
use crate::listener::{Registry, Subscription};
use crate::runtime::{DepListen, Runtime};
use crate::Readable;

/// Emission payload: full map snapshot plus the sorted changed-key list.
type Payload<V> = (AHashMap<String, V>, Vec<String>);

struct MapInner<V> {
    rt: Runtime,
    value: RefCell<AHashMap<String, V>>,
    listeners: Registry<Payload<V>>,
    lifecycle: Rc<LifecycleCell>,
    actions: ActionCell,
}

/// A shared observable `String → V` map.
///
/// Cloning creates another handle to the same map.
pub struct MapStore<V> {
    inner: Rc<MapInner<V>>,
}

impl<V> Clone for MapStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<V: std::fmt::Debug + 'static> std::fmt::Debug for MapStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapStore")
            .field("value", &*self.inner.value.borrow())
            .field("listeners", &self.inner.listeners.len())
            .field("active", &self.inner.lifecycle.active())
            .finish()
    }
}

impl<V: Clone + PartialEq + 'static> MapStore<V> {
    /// Create a map store owned by `rt` with the given initial entries.
    #[must_use]
    pub fn new(rt: &Runtime, initial: impl IntoIterator<Item = (String, V)>) -> Self {
        Self {
            inner: Rc::new(MapInner {
                rt: rt.clone(),
                value: RefCell::new(initial.into_iter().collect()),
                listeners: Registry::new(),
                lifecycle: LifecycleCell::new(),
                actions: ActionCell::new(),
            }),
        }
    }

    /// The runtime this store belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.rt
    }

    /// Get a clone of the whole map. Registers a dependency when called
    /// inside a computed store's compute function.
    #[must_use]
    pub fn get(&self) -> AHashMap<String, V> {
        self.track_read();
        self.inner.value.borrow().clone()
    }

    /// Access the map by reference without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&AHashMap<String, V>) -> R) -> R {
        self.track_read();
        f(&self.inner.value.borrow())
    }

    /// Get a clone of one key's value, if present. Tracks a dependency on
    /// the whole store, not just the key.
    #[must_use]
    pub fn get_key(&self, key: &str) -> Option<V> {
        self.track_read();
        self.inner.value.borrow().get(key).cloned()
    }

    /// Set one key. Storing a value equal to the current one is a no-op:
    /// no notification of any kind.
    pub fn set_key(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        {
            let map = self.inner.value.borrow();
            if map.get(&key).is_some_and(|current| *current == value) {
                return;
            }
        }
        self.inner.value.borrow_mut().insert(key.clone(), value);
        self.trace_write("map set_key");
        self.emit_changed(vec![key]);
    }

    /// Remove one key. Removing an absent key is a no-op.
    pub fn del_key(&self, key: &str) {
        let removed = self.inner.value.borrow_mut().remove(key).is_some();
        if !removed {
            return;
        }
        self.trace_write("map del_key");
        self.emit_changed(vec![key.to_owned()]);
    }

    /// Replace the whole map. Emits a single notification pass whose
    /// changed-key list is the union of added, removed, and value-changed
    /// keys; emits nothing if the new map equals the old one.
    pub fn set(&self, value: AHashMap<String, V>) {
        let mut changed: Vec<String> = Vec::new();
        {
            let old = self.inner.value.borrow();
            for (key, new_value) in &value {
                match old.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    _ => changed.push(key.clone()),
                }
            }
            for key in old.keys() {
                if !value.contains_key(key) {
                    changed.push(key.clone());
                }
            }
        }
        if changed.is_empty() {
            return;
        }
        changed.sort_unstable();
        *self.inner.value.borrow_mut() = value;
        self.trace_write("map set");
        self.emit_changed(changed);
    }

    /// Register a listener for all keys and immediately invoke it once with
    /// the current snapshot and an empty changed-key list.
    pub fn subscribe(
        &self,
        callback: impl Fn(&AHashMap<String, V>, &[String]) + 'static,
    ) -> Subscription {
        let callback = Rc::new(callback);
        let adapted: Rc<dyn Fn(&Payload<V>)> = {
            let callback = Rc::clone(&callback);
            Rc::new(move |payload| callback(&payload.0, &payload.1))
        };
        let sub = self.add_entry(None, adapted);
        let snapshot = self.inner.value.borrow().clone();
        callback(&snapshot, &[]);
        sub
    }

    /// Register a listener for all keys without the immediate invocation.
    pub fn listen(
        &self,
        callback: impl Fn(&AHashMap<String, V>, &[String]) + 'static,
    ) -> Subscription {
        let adapted: Rc<dyn Fn(&Payload<V>)> =
            Rc::new(move |payload| callback(&payload.0, &payload.1));
        self.add_entry(None, adapted)
    }

    /// Register a listener that fires only when one of `keys` changes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EmptyKeyFilter`] when `keys` is empty; an empty
    /// filter would silently never fire.
    pub fn listen_keys(
        &self,
        keys: impl IntoIterator<Item = impl Into<String>>,
        callback: impl Fn(&AHashMap<String, V>, &[String]) + 'static,
    ) -> Result<Subscription, StoreError> {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(StoreError::EmptyKeyFilter);
        }
        let adapted: Rc<dyn Fn(&Payload<V>)> =
            Rc::new(move |payload| callback(&payload.0, &payload.1));
        Ok(self.add_entry(Some(keys), adapted))
    }

    fn emit_changed(&self, changed: Vec<String>) {
        let snapshot = self.inner.value.borrow().clone();
        self.inner
            .listeners
            .emit(&self.inner.rt, (snapshot, changed.clone()), &changed);
    }

    fn trace_write(&self, op: &'static str) {
        match self.inner.actions.current() {
            Some(tag) => tracing::trace!(action = %tag.name, id = tag.id, "{op}"),
            None => tracing::trace!("{op}"),
        }
    }

    fn add_entry(
        &self,
        keys: Option<Vec<String>>,
        callback: Rc<dyn Fn(&Payload<V>)>,
    ) -> Subscription {
        let (id, alive) = self.inner.listeners.add(keys, callback);
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
        let adapted: Rc<dyn Fn(&Payload<V>)> = Rc::new(move |_| callback());
        self.add_entry(None, adapted)
    }

    fn track_read(&self) {
        let this = self.clone();
        self.inner.rt.track_read(self.dep_key(), move || {
            let listen: DepListen = Box::new(move |cb| this.listen_invalidate(cb));
            listen
        });
    }
}

impl<V: Clone + PartialEq + 'static> Readable<AHashMap<String, V>> for MapStore<V> {
    fn get(&self) -> AHashMap<String, V> {
        MapStore::get(self)
    }

    fn with<R>(&self, f: impl FnOnce(&AHashMap<String, V>) -> R) -> R {
        MapStore::with(self, f)
    }
}

impl<V: Clone + PartialEq + 'static> Lifecycled for MapStore<V> {
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

impl<V: Clone + PartialEq + 'static> ActionStore for MapStore<V> {
    fn action_cell(&self) -> &ActionCell {
        &self.inner.actions
    }

    fn runtime_handle(&self) -> Runtime {
        self.inner.rt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn store(rt: &Runtime) -> MapStore<i32> {
        let mut initial = AHashMap::new();
        initial.insert("a".to_owned(), 1);
        initial.insert("b".to_owned(), 2);
        rt.map(initial)
    }

    #[test]
    fn set_key_reports_that_key() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        let _sub = map.listen(move |snapshot, changed| {
            l.borrow_mut().push((changed.to_vec(), snapshot.get("a").copied()));
        });

        map.set_key("a", 5);
        assert_eq!(*log.borrow(), vec![(vec!["a".to_owned()], Some(5))]);
    }

    #[test]
    fn equal_value_set_key_is_silent() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let _sub = map.listen(move |_, _| c.set(c.get() + 1));

        map.set_key("a", 1);
        assert_eq!(count.get(), 0);
        map.set_key("a", 2);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn del_key_reports_removal() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        let _sub = map.listen(move |snapshot, changed| {
            l.borrow_mut().push((changed.to_vec(), snapshot.contains_key("a")));
        });

        map.del_key("a");
        assert_eq!(*log.borrow(), vec![(vec!["a".to_owned()], false)]);

        map.del_key("missing");
        assert_eq!(log.borrow().len(), 1, "absent key removal is silent");
    }

    #[test]
    fn whole_map_set_unions_changed_keys() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        let _sub = map.listen(move |_, changed| l.borrow_mut().push(changed.to_vec()));

        // "a" keeps its value, "b" is removed, "c" is added.
        let mut next = AHashMap::new();
        next.insert("a".to_owned(), 1);
        next.insert("c".to_owned(), 3);
        map.set(next);

        assert_eq!(*log.borrow(), vec![vec!["b".to_owned(), "c".to_owned()]]);
    }

    #[test]
    fn equal_whole_map_set_is_silent() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let count = Rc::new(Cell::new(0u32));
        let c = Rc::clone(&count);
        let _sub = map.listen(move |_, _| c.set(c.get() + 1));

        map.set(map.get());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn listen_keys_filters() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let hits = Rc::new(Cell::new(0u32));

        let h = Rc::clone(&hits);
        let _sub = map
            .listen_keys(["a"], move |_, _| h.set(h.get() + 1))
            .unwrap();

        map.set_key("b", 9);
        assert_eq!(hits.get(), 0);
        map.set_key("a", 9);
        assert_eq!(hits.get(), 1);
        map.del_key("a");
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn keyed_listener_fires_once_per_call_even_for_multiple_watched_keys() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let hits = Rc::new(Cell::new(0u32));

        let h = Rc::clone(&hits);
        let _sub = map
            .listen_keys(["a", "b"], move |_, _| h.set(h.get() + 1))
            .unwrap();

        let mut next = AHashMap::new();
        next.insert("a".to_owned(), 7);
        next.insert("b".to_owned(), 8);
        map.set(next);
        assert_eq!(hits.get(), 1, "both watched keys changed in one call");
    }

    #[test]
    fn listen_keys_rejects_empty_filter() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let err = map
            .listen_keys(Vec::<String>::new(), |_, _| {})
            .unwrap_err();
        assert_eq!(err, StoreError::EmptyKeyFilter);
    }

    #[test]
    fn subscribe_delivers_snapshot_with_empty_changed_list() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        let _sub = map.subscribe(move |snapshot, changed| {
            l.borrow_mut().push((snapshot.len(), changed.to_vec()));
        });
        assert_eq!(*log.borrow(), vec![(2, Vec::new())]);
    }

    #[test]
    fn debug_reports_listener_count() {
        let rt = Runtime::lab();
        let map = store(&rt);
        let _sub = map.listen(|_, _| {});
        let rendered = format!("{map:?}");
        assert!(rendered.contains("listeners: 1"), "{rendered}");
    }

    #[test]
    fn get_key_reads_one_entry() {
        let rt = Runtime::lab();
        let map = store(&rt);
        assert_eq!(map.get_key("a"), Some(1));
        assert_eq!(map.get_key("zzz"), None);
    }
}
