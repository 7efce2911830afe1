//! Indexed entity pool with generation-tagged handles.
//!
//! Clients, channels and servers all live in an [`EntityPool`]. Slots are
//! recycled: freeing an entry pushes its index on the free list and the next
//! `create` reuses the lowest free index before growing the backing vector.
//!
//! Every slot carries a generation counter that is bumped on free. A
//! [`Handle`] remembers the generation it was issued with, so a handle that
//! outlives its entry fails with [`PoolError::InvalidHandle`] even after the
//! slot has been handed to an unrelated entity.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Errors returned by pool access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("stale or dead handle (slot {index}, generation {generation})")]
    InvalidHandle { index: u32, generation: u32 },
    #[error("no entry keyed {0:?}")]
    NotFound(String),
    #[error("pool capacity of {limit} entries exceeded")]
    CapacityExceeded { limit: usize },
}

/// Stable reference to a pool entry.
///
/// Typed by the entry so a `Handle<Client>` can never index the channel pool.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index. Unique among live entries, reused after free.
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Secondary lookup key for [`EntityPool::find`].
///
/// Implementors return an already case-folded key; callers fold the
/// needle the same way before calling `find`.
pub trait Keyed {
    fn key(&self) -> &str;
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Growable slot array with a free list.
#[derive(Debug)]
pub struct EntityPool<T> {
    slots: Vec<Slot<T>>,
    free: BinaryHeap<Reverse<u32>>,
    live: usize,
    limit: Option<usize>,
}

impl<T> Default for EntityPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EntityPool<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BinaryHeap::new(),
            live: 0,
            limit: None,
        }
    }

    /// Pool refusing to hold more than `limit` live entries.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn create(&mut self, value: T) -> Result<Handle<T>, PoolError> {
        self.create_with(|_| value)
    }

    /// Allocate a slot and build the entry from its handle.
    ///
    /// Entities that store their own handle use this form.
    pub fn create_with<F>(&mut self, build: F) -> Result<Handle<T>, PoolError>
    where
        F: FnOnce(Handle<T>) -> T,
    {
        if let Some(limit) = self.limit {
            if self.live >= limit {
                return Err(PoolError::CapacityExceeded { limit });
            }
        }

        let index = match self.free.pop() {
            Some(Reverse(index)) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        let handle = Handle::new(index, slot.generation);
        slot.value = Some(build(handle));
        self.live += 1;
        Ok(handle)
    }

    /// Kill the entry and return it. The slot goes back on the free list.
    pub fn free(&mut self, handle: Handle<T>) -> Result<T, PoolError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.value.is_some())
            .ok_or(PoolError::InvalidHandle {
                index: handle.index,
                generation: handle.generation,
            })?;

        let value = slot.value.take().ok_or(PoolError::InvalidHandle {
            index: handle.index,
            generation: handle.generation,
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(Reverse(handle.index));
        self.live -= 1;
        Ok(value)
    }

    pub fn get(&self, handle: Handle<T>) -> Result<&T, PoolError> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
            .ok_or(PoolError::InvalidHandle {
                index: handle.index,
                generation: handle.generation,
            })
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T, PoolError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
            .ok_or(PoolError::InvalidHandle {
                index: handle.index,
                generation: handle.generation,
            })
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_ok()
    }

    /// High-water slot count, dead slots included.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, s.generation), v))
        })
    }

    /// Snapshot of live handles, for loops that mutate the pool.
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(h, _)| h).collect()
    }

    /// First live entry matching `pred`.
    pub fn find_by<P>(&self, mut pred: P) -> Option<Handle<T>>
    where
        P: FnMut(&T) -> bool,
    {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }
}

impl<T: Keyed> EntityPool<T> {
    /// Linear lookup by secondary key.
    pub fn find(&self, key: &str) -> Result<Handle<T>, PoolError> {
        self.find_by(|v| v.key() == key)
            .ok_or_else(|| PoolError::NotFound(key.to_owned()))
    }
}
