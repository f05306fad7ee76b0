//! Typed resource handles.
//!
//! # Design
//! Every engine-side resource is named by a non-zero integer. Each resource
//! kind gets its own newtype so a `TaskHandle` can never be passed where an
//! `EventHandle` is expected. Zero is the invalid sentinel and is not
//! representable: "no handle" is `Option::None`.
//!
//! Two containers live here:
//! - `HandleSlot` is held by the binding object that owns a handle. It hands
//!   the handle out exactly once for release.
//! - `HandleTable` is used by engines to mint ids and store the state they
//!   name. Ids are never reused, so a stale id simply misses.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ResourceKind;

/// A typed, non-zero identifier for one engine-side resource.
pub trait Handle: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn from_raw(raw: u64) -> Option<Self>;

    fn as_raw(self) -> u64;
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(NonZeroU64);

        impl Handle for $name {
            const KIND: ResourceKind = $kind;

            fn from_raw(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map($name)
            }

            fn as_raw(self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", Self::KIND, self.0)
            }
        }
    };
}

define_handle!(
    /// Names a running or finished measurement task.
    TaskHandle,
    ResourceKind::Task
);
define_handle!(
    /// Names one event popped from a task.
    EventHandle,
    ResourceKind::Event
);
define_handle!(
    /// Names a pending HTTP request.
    RequestHandle,
    ResourceKind::Request
);
define_handle!(
    /// Names the result of one HTTP exchange.
    ResponseHandle,
    ResourceKind::Response
);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner-side cell holding a handle until it is released.
///
/// `take` hands the handle out at most once, no matter how many threads race
/// on it. `with` runs a closure while the handle is guaranteed not to be
/// released concurrently; keep such closures short and non-blocking.
pub struct HandleSlot<H: Handle> {
    inner: Mutex<Option<H>>,
}

impl<H: Handle> HandleSlot<H> {
    pub fn new(handle: H) -> Self {
        Self {
            inner: Mutex::new(Some(handle)),
        }
    }

    pub fn get(&self) -> Option<H> {
        *lock(&self.inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(H) -> R) -> Option<R> {
        let guard = lock(&self.inner);
        guard.map(f)
    }

    /// Take the handle out for release. Returns `None` once released.
    pub fn take(&self) -> Option<H> {
        lock(&self.inner).take()
    }

    pub fn is_released(&self) -> bool {
        lock(&self.inner).is_none()
    }
}

impl<H: Handle> fmt::Debug for HandleSlot<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(h) => write!(f, "HandleSlot({h:?})"),
            None => write!(f, "HandleSlot({} released)", H::KIND),
        }
    }
}

/// Engine-side storage keyed by freshly minted handles.
pub struct HandleTable<H: Handle, T> {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
    _kind: std::marker::PhantomData<H>,
}

impl<H: Handle, T> HandleTable<H, T> {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            _kind: std::marker::PhantomData,
        }
    }

    /// Store `value` under a new handle. Returns `None` once the id space is
    /// exhausted.
    pub fn insert(&self, value: T) -> Option<H> {
        let raw = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1))
            .ok()?;
        let handle = H::from_raw(raw)?;
        lock(&self.entries).insert(raw, value);
        Some(handle)
    }

    pub fn with<R>(&self, handle: H, f: impl FnOnce(&T) -> R) -> Option<R> {
        lock(&self.entries).get(&handle.as_raw()).map(f)
    }

    pub fn with_mut<R>(&self, handle: H, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        lock(&self.entries).get_mut(&handle.as_raw()).map(f)
    }

    pub fn remove(&self, handle: H) -> Option<T> {
        lock(&self.entries).remove(&handle.as_raw())
    }

    /// Remove every entry, in no particular order.
    pub fn drain(&self) -> Vec<T> {
        lock(&self.entries).drain().map(|(_, value)| value).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: Handle, T: Clone> HandleTable<H, T> {
    pub fn get_cloned(&self, handle: H) -> Option<T> {
        self.with(handle, T::clone)
    }
}

impl<H: Handle, T> Default for HandleTable<H, T> {
    fn default() -> Self {
        Self::new()
    }
}
