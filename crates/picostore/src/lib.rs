#![forbid(unsafe_code)]

//! Small reactive value containers with explicit scheduling.
//!
//! Everything hangs off a [`Runtime`]: it owns the microtask queue that
//! batches derived-store recomputation, the timer wheel behind debounced
//! lifecycle teardown, and the emission queue that keeps re-entrant
//! notification passes from interleaving. Runtimes are single-threaded;
//! handles are `Rc`-shared, not `Send`.
//!
//! Three store kinds:
//!
//! - [`Atom`] holds one value and notifies synchronously on every `set`.
//! - [`MapStore`] holds a `String → V` map, detects per-key changes with
//!   `PartialEq`, and tells listeners which keys moved.
//! - [`Computed`] derives a value from other stores, discovers its
//!   dependencies automatically, and coalesces bursts of upstream writes
//!   into one recomputation per [`Runtime::flush`].
//!
//! Stores activate when their first listener arrives and deactivate a
//! debounce window after their last one leaves, running [`Lifecycled`]
//! hooks at the transitions. [`action`] wraps mutations so concurrent
//! workflows stay attributable in traces.
//!
//! ```
//! use picostore::Runtime;
//!
//! let rt = Runtime::lab();
//! let celsius = rt.atom(25.0_f64);
//! let c = celsius.clone();
//! let fahrenheit = rt.computed(move || c.get() * 9.0 / 5.0 + 32.0);
//!
//! let sub = fahrenheit.listen(|new, _| println!("now {new}°F"));
//! celsius.set(30.0);
//! rt.flush();
//! sub.unsubscribe();
//! ```

pub mod action;
pub mod atom;
pub mod computed;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod map;
pub mod runtime;

pub use action::{action, action_async, ActionEvent, ActionStore, ActionTag, Tagged};
pub use atom::Atom;
pub use computed::Computed;
pub use error::StoreError;
pub use lifecycle::{Lifecycled, Teardown};
pub use listener::Subscription;
pub use map::MapStore;
pub use runtime::{Deferred, Runtime, RuntimeConfig};

/// Read access shared by every store kind.
///
/// Both methods register a dependency edge when called inside a computed
/// store's compute closure; `with` is the no-clone variant.
pub trait Readable<T: Clone> {
    /// Get a clone of the current value.
    fn get(&self) -> T;

    /// Access the current value by reference.
    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R;
}
