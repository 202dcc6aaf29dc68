//! Reference-counted allocation with per-class capacity limits.
//!
//! The system this engine replaces hands out raw, refcounted blocks by class
//! name (`ObjectRegisterClass`, `ObjectCreate`, `ObjectRefInc/Dec`) so that
//! structures shared between the reader thread and control threads (cached
//! services, PID lists, filter groups) have a single place that runs their
//! destructor when the last reference drops. `Arc<T>`'s own strong-count and
//! `Drop` impl already gives every value that for free, so this module keeps
//! only the part `Arc` does not provide on its own: a named registry of
//! classes with a live-instance ceiling, so a class with unbounded allocation
//! pressure (filter groups, scan candidate lists) fails with [`EngineError::OutOfMemory`]
//! instead of growing without limit.

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A reference-counted, heap-allocated object with no capacity accounting.
/// Equivalent to a class registered with an unbounded ceiling.
pub type Shared<T> = Arc<T>;

struct ClassEntry {
    capacity: usize,
    live: AtomicUsize,
}

/// Registry of named object classes, each with a maximum live-instance count.
#[derive(Default)]
pub struct ObjectRegistry {
    classes: Mutex<HashMap<String, Arc<ClassEntry>>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a class with the given name and maximum number of
    /// simultaneously live instances. Registering the same name twice
    /// replaces the previous limit; live handles from the old registration
    /// are unaffected.
    pub fn register_class(&self, name: impl Into<String>, capacity: usize) {
        self.classes.lock().insert(
            name.into(),
            Arc::new(ClassEntry {
                capacity,
                live: AtomicUsize::new(0),
            }),
        );
    }

    /// Allocates a new instance of `classname` holding `value`. Fails with
    /// [`EngineError::UnknownClass`] if the class was never registered, or
    /// [`EngineError::OutOfMemory`] if the class is already at capacity.
    pub fn create<T>(&self, classname: &str, value: T) -> Result<Handle<T>> {
        let entry = self
            .classes
            .lock()
            .get(classname)
            .cloned()
            .ok_or_else(|| EngineError::UnknownClass(classname.to_string()))?;

        loop {
            let current = entry.live.load(Ordering::Acquire);
            if current >= entry.capacity {
                return Err(EngineError::OutOfMemory);
            }
            if entry
                .live
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        Ok(Handle {
            inner: Arc::new(value),
            class: entry,
        })
    }
}

/// A handle returned by [`ObjectRegistry::create`]. Cloning increments the
/// class's live-instance count (mirroring `ObjectRefInc`); dropping the last
/// clone decrements it and drops the inner value (mirroring `ObjectRefDec`
/// running the destructor at refcount zero).
pub struct Handle<T> {
    inner: Arc<T>,
    class: Arc<ClassEntry>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.class.live.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: self.inner.clone(),
            class: self.class.clone(),
        }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        self.class.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner
    }
}
