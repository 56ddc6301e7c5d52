//! Generation-checked handle pools
//!
//! Every bounded runtime resource (sound slots, streaming and buffer
//! sources, fade nodes, per-group mix nodes, banks) lives in a
//! [`HandlePool`]. A [`Handle`] is an index plus the generation the slot had
//! when it was handed out; releasing a slot bumps its generation, so a
//! handle kept past its release no longer resolves.

use serde::Serialize;
use tracing::{trace, warn};

/// Index + generation reference into a [`HandlePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity pool with index recycling
pub struct HandlePool<T> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    /// Free indices; the last one released is reused first
    free: Vec<u32>,
}

impl<T> HandlePool<T> {
    /// # Arguments
    /// - `name`: used in log lines when the pool runs dry
    /// - `capacity`: maximum number of live values
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        Self {
            name,
            slots,
            free: (0..capacity as u32).rev().collect(),
        }
    }

    /// Store `value` in a free slot.
    ///
    /// # Returns
    /// `None` (and a warning) when the pool is full
    pub fn acquire(&mut self, value: T) -> Option<Handle> {
        let Some(index) = self.free.pop() else {
            warn!("{} pool exhausted ({} slots)", self.name, self.slots.len());
            return None;
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        trace!("{} slot {} acquired", self.name, index);
        Some(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Take the value out and recycle the slot
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        trace!("{} slot {} released", self.name, handle.index);
        Some(value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Live values
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live handles in index order
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_full() {
        let mut pool = HandlePool::new("test", 2);
        let a = pool.acquire("a").unwrap();
        let b = pool.acquire("b").unwrap();
        assert!(pool.is_full());
        assert!(pool.acquire("c").is_none());
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut pool = HandlePool::new("test", 1);
        let first = pool.acquire(1).unwrap();
        assert_eq!(pool.release(first), Some(1));

        let second = pool.acquire(2).unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());

        assert!(pool.get(first).is_none());
        assert!(pool.release(first).is_none());
        assert_eq!(pool.get(second), Some(&2));
    }

    #[test]
    fn test_last_released_index_reused_first() {
        let mut pool = HandlePool::new("test", 3);
        let handles: Vec<_> = (0..3).map(|i| pool.acquire(i).unwrap()).collect();
        pool.release(handles[0]);
        pool.release(handles[2]);
        assert_eq!(pool.acquire(8).unwrap().index(), 2);
        assert_eq!(pool.acquire(9).unwrap().index(), 0);
        assert_eq!(pool.handles().len(), 3);
    }

    #[test]
    fn test_iter_skips_free_slots() {
        let mut pool = HandlePool::new("test", 4);
        let a = pool.acquire('a').unwrap();
        pool.acquire('b').unwrap();
        pool.release(a);
        let values: Vec<char> = pool.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['b']);
    }
}
