#![forbid(unsafe_code)]

//! Named, id-tagged mutation wrappers for tracing tools.
//!
//! # Design
//!
//! [`action`] wraps a mutation closure so that every `set`/`set_key` it
//! performs carries an [`ActionTag`] (`{name, id}`) as inspectable metadata.
//! The closure receives a [`Tagged`] handle; each of the handle's mutating
//! methods attaches the tag immediately before the underlying call and
//! detaches it immediately afterwards through an RAII guard, so the tag is
//! removed even when a listener panics, and a nested action's tag shadows
//! the outer one only for the duration of its own call.
//!
//! [`action_async`] additionally emits [`ActionEvent`] start/error/end
//! lifecycle events through the store's tracing hooks and registers the
//! in-flight work with the runtime's pending-action counter, so teardown
//! code can wait for quiescence. Failures are reported to the hooks and
//! left in the returned [`Deferred`]: tracing is observational, never
//! suppressive.

use std::cell::RefCell;
use std::rc::Rc;

use crate::runtime::{Deferred, Runtime};

/// Metadata attached to a store around a tagged mutation call.
#[derive(Debug, Clone)]
pub struct ActionTag {
    /// Human-readable action name, for attribution in tracing tools.
    pub name: Rc<str>,
    /// Per-invocation id, monotonically increasing per runtime.
    pub id: u64,
}

/// Lifecycle event of an asynchronous action, delivered to hooks registered
/// with [`ActionStore::on_action`].
#[derive(Debug, Clone)]
pub enum ActionEvent {
    /// The wrapped closure was invoked and returned a deferred computation.
    Start { id: u64, name: Rc<str> },
    /// The deferred settled with a failure. The failure itself is still
    /// delivered to the caller; `message` is its rendered form.
    Error { id: u64, name: Rc<str>, message: String },
    /// The deferred settled (either outcome).
    End { id: u64, name: Rc<str> },
}

/// Per-store action state: the currently attached tag and the registered
/// event hooks.
pub(crate) struct ActionCell {
    tag: RefCell<Option<ActionTag>>,
    hooks: RefCell<Vec<Rc<dyn Fn(&ActionEvent)>>>,
}

impl ActionCell {
    pub(crate) fn new() -> Self {
        Self {
            tag: RefCell::new(None),
            hooks: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn current(&self) -> Option<ActionTag> {
        self.tag.borrow().clone()
    }

    pub(crate) fn swap(&self, tag: Option<ActionTag>) -> Option<ActionTag> {
        self.tag.replace(tag)
    }

    pub(crate) fn add_hook(&self, hook: Rc<dyn Fn(&ActionEvent)>) {
        self.hooks.borrow_mut().push(hook);
    }

    pub(crate) fn emit(&self, event: &ActionEvent) {
        let hooks: Vec<_> = self.hooks.borrow().clone();
        for hook in hooks {
            hook(event);
        }
    }
}

/// Writable stores that can carry an action tag.
///
/// Implemented by [`Atom`](crate::atom::Atom) and
/// [`MapStore`](crate::map::MapStore). Computed stores are read-only and
/// cannot be action targets.
pub trait ActionStore: Clone {
    #[doc(hidden)]
    fn action_cell(&self) -> &ActionCell;
    #[doc(hidden)]
    fn runtime_handle(&self) -> Runtime;

    /// The `{name, id}` of the action currently performing a tagged
    /// mutation on this store, if any. Meaningful from inside a listener
    /// or an `on_action` hook.
    fn current_action(&self) -> Option<ActionTag> {
        self.action_cell().current()
    }

    /// Register an observer for [`ActionEvent`]s. Hooks live as long as the
    /// store does.
    fn on_action(&self, hook: impl Fn(&ActionEvent) + 'static) {
        self.action_cell().add_hook(Rc::new(hook));
    }
}

/// Restores the previously attached tag when a tagged call unwinds.
struct TagGuard<'a, S: ActionStore> {
    store: &'a S,
    previous: Option<ActionTag>,
}

impl<'a, S: ActionStore> TagGuard<'a, S> {
    fn attach(store: &'a S, tag: ActionTag) -> Self {
        let previous = store.action_cell().swap(Some(tag));
        Self { store, previous }
    }
}

impl<S: ActionStore> Drop for TagGuard<'_, S> {
    fn drop(&mut self) {
        self.store.action_cell().swap(self.previous.take());
    }
}

/// Handle given to an action's mutation closure. Mutating methods attach
/// the action's tag around the underlying store call; reads pass through.
pub struct Tagged<S> {
    store: S,
    tag: ActionTag,
}

impl<S> Tagged<S> {
    /// The wrapped store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// This invocation's tag.
    #[must_use]
    pub fn tag(&self) -> &ActionTag {
        &self.tag
    }
}

impl<T: Clone + 'static> Tagged<crate::atom::Atom<T>> {
    /// Current value (untagged read).
    #[must_use]
    pub fn get(&self) -> T {
        self.store.get()
    }

    /// Tagged `set`: the store carries this action's tag for the duration
    /// of the call, including all synchronous listener notification.
    pub fn set(&self, value: T) {
        let _tag = TagGuard::attach(&self.store, self.tag.clone());
        self.store.set(value);
    }

    /// Tagged in-place update.
    pub fn update(&self, mutate: impl FnOnce(&mut T)) {
        let _tag = TagGuard::attach(&self.store, self.tag.clone());
        self.store.update(mutate);
    }
}

impl<V: Clone + PartialEq + 'static> Tagged<crate::map::MapStore<V>> {
    /// Current mapping snapshot (untagged read).
    #[must_use]
    pub fn get(&self) -> ahash::AHashMap<String, V> {
        self.store.get()
    }

    /// Tagged whole-mapping replacement.
    pub fn set(&self, value: ahash::AHashMap<String, V>) {
        let _tag = TagGuard::attach(&self.store, self.tag.clone());
        self.store.set(value);
    }

    /// Tagged single-key update.
    pub fn set_key(&self, key: impl Into<String>, value: V) {
        let _tag = TagGuard::attach(&self.store, self.tag.clone());
        self.store.set_key(key, value);
    }

    /// Tagged single-key removal.
    pub fn del_key(&self, key: &str) {
        let _tag = TagGuard::attach(&self.store, self.tag.clone());
        self.store.del_key(key);
    }
}

/// Wrap a synchronous mutation closure. Each invocation allocates a fresh
/// id from the store's runtime and hands `mutate` a [`Tagged`] view of the
/// store; the result is returned directly with no task-tracking overhead.
///
/// The store argument is curried away: the returned closure is usable
/// anywhere the original was.
pub fn action<S, A, R, F>(store: &S, name: impl Into<Rc<str>>, mut mutate: F) -> impl FnMut(A) -> R
where
    S: ActionStore + 'static,
    F: FnMut(&Tagged<S>, A) -> R,
{
    let store = store.clone();
    let name: Rc<str> = name.into();
    move |args: A| {
        let id = store.runtime_handle().next_action_id();
        tracing::debug!(action = %name, id, "action invoked");
        let tagged = Tagged {
            store: store.clone(),
            tag: ActionTag {
                name: Rc::clone(&name),
                id,
            },
        };
        mutate(&tagged, args)
    }
}

/// Wrap an asynchronous mutation closure (one returning a [`Deferred`]).
///
/// Per invocation: emits [`ActionEvent::Start`] through the store's action
/// hooks, registers the pending work with the runtime's pending-action
/// counter, and observes settlement: a failure emits
/// [`ActionEvent::Error`] while staying visible to the caller through the
/// returned deferred, and either outcome emits [`ActionEvent::End`] and
/// decrements the counter.
pub fn action_async<S, A, T, E, F>(
    store: &S,
    name: impl Into<Rc<str>>,
    mut mutate: F,
) -> impl FnMut(A) -> Deferred<T, E>
where
    S: ActionStore + 'static,
    T: Clone + 'static,
    E: Clone + std::fmt::Display + 'static,
    F: FnMut(&Tagged<S>, A) -> Deferred<T, E>,
{
    let store = store.clone();
    let name: Rc<str> = name.into();
    move |args: A| {
        let rt = store.runtime_handle();
        let id = rt.next_action_id();
        tracing::debug!(action = %name, id, "async action started");
        store.action_cell().emit(&ActionEvent::Start {
            id,
            name: Rc::clone(&name),
        });
        rt.action_started();

        let tagged = Tagged {
            store: store.clone(),
            tag: ActionTag {
                name: Rc::clone(&name),
                id,
            },
        };
        let deferred = mutate(&tagged, args);

        let settle_store = store.clone();
        let settle_name = Rc::clone(&name);
        deferred.on_settle(move |outcome| {
            if let Err(error) = outcome {
                tracing::debug!(action = %settle_name, id, %error, "async action failed");
                settle_store.action_cell().emit(&ActionEvent::Error {
                    id,
                    name: Rc::clone(&settle_name),
                    message: error.to_string(),
                });
            }
            settle_store.action_cell().emit(&ActionEvent::End {
                id,
                name: Rc::clone(&settle_name),
            });
            rt.action_settled();
            tracing::debug!(action = %settle_name, id, "async action settled");
        });
        deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn sync_action_tags_each_set() {
        let rt = Runtime::lab();
        let counter = rt.atom(0i32);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let counter_for_listener = counter.clone();
        counter
            .listen(move |_, _| {
                seen2.borrow_mut().push(
                    counter_for_listener
                        .current_action()
                        .map(|tag| (tag.name.to_string(), tag.id)),
                );
            })
            .detach();

        let mut increase = action(&counter, "increase", |store: &Tagged<_>, ()| {
            store.set(store.get() + 1);
        });
        increase(());
        increase(());

        assert_eq!(counter.get(), 2);
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Some(("increase".to_string(), 1)));
        assert_eq!(seen[1], Some(("increase".to_string(), 2)));
    }

    #[test]
    fn tag_detaches_after_set() {
        let rt = Runtime::lab();
        let counter = rt.atom(0i32);
        let mut bump = action(&counter, "bump", |store: &Tagged<_>, ()| {
            store.set(1);
            assert!(store.store().current_action().is_none());
        });
        bump(());
        assert!(counter.current_action().is_none());
    }

    #[test]
    fn sync_action_returns_result_directly() {
        let rt = Runtime::lab();
        let counter = rt.atom(10i32);
        let mut double = action(&counter, "double", |store: &Tagged<_>, ()| {
            let next = store.get() * 2;
            store.set(next);
            next
        });
        assert_eq!(double(()), 20);
        assert_eq!(rt.pending_actions(), 0);
    }

    #[test]
    fn async_action_emits_start_end() {
        let rt = Runtime::lab();
        let counter = rt.atom(0i32);
        let events = Rc::new(RefCell::new(Vec::new()));
        let events2 = Rc::clone(&events);
        counter.on_action(move |event| {
            events2.borrow_mut().push(match event {
                ActionEvent::Start { id, .. } => format!("start:{id}"),
                ActionEvent::Error { id, .. } => format!("error:{id}"),
                ActionEvent::End { id, .. } => format!("end:{id}"),
            });
        });

        let mut load = action_async(&counter, "load", |_store: &Tagged<_>, ()| {
            Deferred::<i32, String>::new()
        });
        let deferred = load(());
        assert_eq!(rt.pending_actions(), 1);
        assert_eq!(*events.borrow(), vec!["start:1".to_string()]);

        deferred.resolve(5).unwrap();
        assert_eq!(rt.pending_actions(), 0);
        assert_eq!(
            *events.borrow(),
            vec!["start:1".to_string(), "end:1".to_string()]
        );
    }

    #[test]
    fn async_action_error_is_reported_and_visible() {
        let rt = Runtime::lab();
        let counter = rt.atom(0i32);
        let errors = Rc::new(RefCell::new(Vec::new()));
        let errors2 = Rc::clone(&errors);
        counter.on_action(move |event| {
            if let ActionEvent::Error { message, .. } = event {
                errors2.borrow_mut().push(message.clone());
            }
        });

        let mut load = action_async(&counter, "load", |_store: &Tagged<_>, ()| {
            Deferred::<i32, String>::rejected("connection refused".into())
        });
        let deferred = load(());

        assert_eq!(*errors.borrow(), vec!["connection refused".to_string()]);
        // The failure is still the caller's to observe.
        assert_eq!(deferred.outcome(), Some(Err("connection refused".into())));
        assert_eq!(rt.pending_actions(), 0);
    }

    #[test]
    fn nested_action_restores_outer_tag() {
        let rt = Runtime::lab();
        let counter = rt.atom(0i32);
        let names = Rc::new(RefCell::new(Vec::new()));

        let names2 = Rc::clone(&names);
        let counter_probe = counter.clone();
        counter
            .listen(move |_, _| {
                names2
                    .borrow_mut()
                    .push(counter_probe.current_action().map(|t| t.name.to_string()));
            })
            .detach();

        let inner = Rc::new(RefCell::new(action(
            &counter,
            "inner",
            |store: &Tagged<_>, ()| store.set(store.get() + 10),
        )));
        let inner_for_outer = Rc::clone(&inner);
        let mut outer = action(&counter, "outer", move |store: &Tagged<_>, ()| {
            store.set(1);
            (inner_for_outer.borrow_mut())(());
            store.set(store.get() + 1);
        });
        outer(());

        assert_eq!(
            *names.borrow(),
            vec![
                Some("outer".to_string()),
                Some("inner".to_string()),
                Some("outer".to_string()),
            ]
        );
    }

    #[test]
    fn sync_action_panic_propagates() {
        let rt = Runtime::lab();
        let counter = rt.atom(0i32);
        let target = counter.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut explode = action(&target, "explode", |_store: &Tagged<_>, ()| {
                panic!("boom");
            });
            explode(());
        }));
        assert!(result.is_err());
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn tag_detaches_when_listener_panics() {
        let rt = Runtime::lab();
        let counter = rt.atom(0i32);
        let armed = Rc::new(Cell::new(true));
        let armed2 = Rc::clone(&armed);
        counter
            .listen(move |_, _| {
                if armed2.get() {
                    panic!("listener boom");
                }
            })
            .detach();

        let target = counter.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let mut bump = action(&target, "bump", |store: &Tagged<_>, ()| store.set(1));
            bump(());
        }));
        assert!(result.is_err());
        // The RAII guard detached the tag despite the unwind.
        assert!(counter.current_action().is_none());

        // The engine stays usable afterwards.
        armed.set(false);
        counter.set(2);
        assert_eq!(counter.get(), 2);
    }
}
