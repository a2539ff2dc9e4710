//! Fixed-capacity object pool for reusable buffers.
//!
//! Slots are stamped with a strictly increasing global age on every checkout;
//! that age doubles as the generation value handles capture to detect slot
//! reuse. Age 0 means the slot is checked in and free. Checkout never fails:
//! when the pool is full and growth is disabled, the least-recently-used slot
//! is forcibly recycled.

use std::sync::{Arc, Mutex};

/// Buffers that can be returned to a pool and reused for another request.
pub trait Reusable: Default + Send {
    /// Resets the buffer to a reusable state. Allocations should be retained.
    fn reset(&mut self);
}

struct Slot<T> {
    item: Arc<Mutex<T>>,
    /// 0 when free; otherwise the generation stamped at checkout.
    age: u64,
}

/// The item, slot index and generation handed out by [`ObjectPool::check_out`].
pub struct Checkout<T> {
    pub item: Arc<Mutex<T>>,
    pub pool_index: usize,
    pub generation: u64,
}

pub struct ObjectPool<T> {
    slots: Vec<Slot<T>>,
    next_age: u64,
    growable: bool,
}

impl<T: Reusable> ObjectPool<T> {
    pub fn new(capacity: usize, growable: bool) -> Self {
        assert!(capacity > 0, "pool capacity must be at least 1");
        let slots = (0..capacity)
            .map(|_| Slot {
                item: Arc::new(Mutex::new(T::default())),
                age: 0,
            })
            .collect();
        Self {
            slots,
            next_age: 1,
            growable,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently checked out.
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.age > 0).count()
    }

    /// Checks out a buffer, preferring a free slot, then growing (when
    /// enabled), then recycling the oldest checked-out slot.
    pub fn check_out(&mut self) -> Checkout<T> {
        let index = match self.free_or_oldest() {
            Candidate::Free(i) => i,
            Candidate::Oldest(i) => {
                if self.growable {
                    self.grow()
                } else {
                    // Forced recycle: any handle still pointing at this slot
                    // becomes stale once the new generation is stamped.
                    let slot = &mut self.slots[i];
                    if let Ok(mut item) = slot.item.lock() {
                        item.reset();
                    }
                    i
                }
            }
        };

        let generation = self.next_age;
        self.next_age += 1;
        let slot = &mut self.slots[index];
        slot.age = generation;
        Checkout {
            item: Arc::clone(&slot.item),
            pool_index: index,
            generation,
        }
    }

    /// Returns a slot to the pool. A no-op unless `generation` still matches
    /// the slot's current stamp, so stale handles cannot release a recycled
    /// slot out from under its new owner.
    pub fn check_in(&mut self, pool_index: usize, generation: u64) -> bool {
        match self.slots.get_mut(pool_index) {
            Some(slot) if slot.age == generation => {
                slot.age = 0;
                if let Ok(mut item) = slot.item.lock() {
                    item.reset();
                }
                true
            }
            _ => false,
        }
    }

    /// Current generation of a slot; 0 when the slot is checked in.
    pub fn current_generation(&self, pool_index: usize) -> u64 {
        self.slots.get(pool_index).map_or(0, |s| s.age)
    }

    /// Linear scan for a checked-out slot by index.
    pub fn find_by_pool_index(&self, pool_index: usize) -> Option<Arc<Mutex<T>>> {
        self.slots
            .iter()
            .enumerate()
            .find(|(i, s)| *i == pool_index && s.age > 0)
            .map(|(_, s)| Arc::clone(&s.item))
    }

    /// Like [`find_by_pool_index`](Self::find_by_pool_index) but also requires
    /// the generation to match, rejecting stale handles.
    pub fn find(&self, pool_index: usize, generation: u64) -> Option<Arc<Mutex<T>>> {
        self.slots
            .get(pool_index)
            .filter(|s| s.age == generation && generation > 0)
            .map(|s| Arc::clone(&s.item))
    }

    fn free_or_oldest(&self) -> Candidate {
        let mut oldest = 0;
        let mut oldest_age = u64::MAX;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.age == 0 {
                return Candidate::Free(i);
            }
            if slot.age < oldest_age {
                oldest_age = slot.age;
                oldest = i;
            }
        }
        Candidate::Oldest(oldest)
    }

    /// Expands the backing array by 1.5x and returns the first new index.
    fn grow(&mut self) -> usize {
        let first_new = self.slots.len();
        let target = (self.slots.len() * 3 / 2).max(self.slots.len() + 1);
        for _ in first_new..target {
            self.slots.push(Slot {
                item: Arc::new(Mutex::new(T::default())),
                age: 0,
            });
        }
        first_new
    }
}

enum Candidate {
    Free(usize),
    Oldest(usize),
}
