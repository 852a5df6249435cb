//! Object pooling for the request hot path.
//!
//! Pooling is a transparent optimization: correctness never depends on which
//! pooled object a caller receives. Objects are reset before they go back to
//! the pool, so a fresh `get` always observes zeroed fields.

use std::sync::Mutex;

/// A type that can be recycled through a [`Pool`].
pub trait Poolable: Default + Send {
    /// Returns the value to its zero state.
    fn reset(&mut self);
}

/// A bounded free-list of reusable objects.
pub struct Pool<T: Poolable> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Poolable> Pool<T> {
    /// Creates a pool retaining at most `capacity` idle objects.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Takes an object from the pool, or allocates a fresh one.
    pub fn get(&self) -> T {
        self.items
            .lock()
            .expect("pool lock poisoned")
            .pop()
            .unwrap_or_default()
    }

    /// Resets an object and returns it to the pool.
    ///
    /// Objects beyond the pool's capacity are dropped.
    pub fn put(&self, mut item: T) {
        item.reset();

        let mut items = self.items.lock().expect("pool lock poisoned");
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    /// Number of idle objects currently held.
    pub fn idle(&self) -> usize {
        self.items.lock().expect("pool lock poisoned").len()
    }
}
