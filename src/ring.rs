//! Circular buffer over the last N tracking snapshots.
//!
//! `put` is called from the dedicated poll thread while `get` is called from
//! arbitrary consumer threads, so every operation serializes through one
//! mutex. Reads that miss return the fallback value supplied at construction
//! instead of failing.

use std::sync::Mutex;

pub struct CircularBuffer<T: Clone> {
    inner: Mutex<Ring<T>>,
    fallback: T,
}

struct Ring<T> {
    items: Vec<T>,
    capacity: usize,
    /// Next write position.
    head: usize,
    count: usize,
}

impl<T: Clone> CircularBuffer<T> {
    pub fn new(capacity: usize, fallback: T) -> Self {
        assert!(capacity > 0, "ring capacity must be at least 1");
        Self {
            inner: Mutex::new(Ring {
                items: Vec::with_capacity(capacity),
                capacity,
                head: 0,
                count: 0,
            }),
            fallback,
        }
    }

    /// Overwrites the next logical slot; after the first `capacity` calls
    /// every put replaces the oldest entry in place.
    pub fn put(&self, item: T) {
        let mut ring = self.inner.lock().unwrap();
        let head = ring.head;
        if ring.items.len() < ring.capacity {
            ring.items.push(item);
        } else {
            ring.items[head] = item;
        }
        ring.head = (head + 1) % ring.capacity;
        ring.count = (ring.count + 1).min(ring.capacity);
    }

    /// Returns the item `index` positions back from the most recent put
    /// (0 = most recent). Out-of-range and empty reads return the fallback.
    pub fn get(&self, index: usize) -> T {
        let ring = self.inner.lock().unwrap();
        if index >= ring.count {
            return self.fallback.clone();
        }
        let pos = (ring.head + ring.capacity - 1 - index) % ring.capacity;
        ring.items[pos].clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Grows the buffer, migrating existing items oldest to newest. Shrinking
    /// is ignored.
    pub fn resize(&self, new_capacity: usize) {
        let mut ring = self.inner.lock().unwrap();
        if new_capacity <= ring.capacity {
            return;
        }
        let mut migrated = Vec::with_capacity(new_capacity);
        for back in (0..ring.count).rev() {
            let pos = (ring.head + ring.capacity - 1 - back) % ring.capacity;
            migrated.push(ring.items[pos].clone());
        }
        ring.head = migrated.len() % new_capacity;
        ring.count = migrated.len();
        ring.items = migrated;
        ring.capacity = new_capacity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_counts_back_from_most_recent() {
        let ring = CircularBuffer::new(4, -1i64);
        for id in 0..10 {
            ring.put(id);
        }
        // Ids 0..10 through capacity 4: most recent first.
        assert_eq!(ring.get(0), 9);
        assert_eq!(ring.get(1), 8);
        assert_eq!(ring.get(2), 7);
        assert_eq!(ring.get(3), 6);
        assert_eq!(ring.get(4), -1, "beyond retention returns the fallback");
        assert_eq!(ring.get(100), -1);
    }

    #[test]
    fn empty_ring_returns_fallback() {
        let ring = CircularBuffer::new(4, 0u32);
        assert_eq!(ring.get(0), 0);
        assert!(ring.is_empty());
    }

    #[test]
    fn partial_fill_reads_whats_there() {
        let ring = CircularBuffer::new(8, -1i32);
        ring.put(1);
        ring.put(2);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get(0), 2);
        assert_eq!(ring.get(1), 1);
        assert_eq!(ring.get(2), -1);
    }

    #[test]
    fn resize_preserves_order_and_keeps_filling() {
        let ring = CircularBuffer::new(3, -1i32);
        for id in 0..5 {
            ring.put(id);
        }
        ring.resize(6);
        assert_eq!(ring.get(0), 4);
        assert_eq!(ring.get(1), 3);
        assert_eq!(ring.get(2), 2);
        assert_eq!(ring.get(3), -1);

        ring.put(5);
        assert_eq!(ring.get(0), 5);
        assert_eq!(ring.get(3), 2);
        assert_eq!(ring.capacity(), 6);
    }
}
