//! Fixed-capacity pool of reusable slots.
//!
//! A [`SlotPool`] never grows: all of its storage is set aside when it is created, and storing a
//! value when every slot is taken fails with [`ExhaustedError`] instead of allocating. Freed slots
//! are reused in last-in first-out order, so releasing a slot and immediately allocating again
//! hands out the same storage (with a new generation).

pub mod errors;
pub mod ids;

use generational_arena::Arena;

pub use errors::{ExhaustedError, InvalidIdError};
pub use ids::SlotId;

#[derive(Debug)]
pub struct SlotPool<T> {
    arena: Arena<T>,
}

impl<T> SlotPool<T> {
    /// Create a pool with exactly `capacity` free slots.
    ///
    /// A pool always has at least one slot, so a `capacity` of `0` is treated as `1`.
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arena::with_capacity(capacity),
        }
    }

    /// Store `value` in a free slot, returning its id.
    ///
    /// Fails without blocking and without growing if no slot is free, handing `value` back.
    pub fn allocate(&mut self, value: T) -> Result<SlotId<T>, ExhaustedError<T>> {
        self.arena
            .try_insert(value)
            .map(SlotId::new)
            .map_err(ExhaustedError)
    }

    /// Free the slot `id` refers to, returning the value it held.
    ///
    /// The slot becomes the next one handed out by [`Self::allocate`].
    pub fn release(&mut self, id: SlotId<T>) -> Result<T, InvalidIdError> {
        self.arena.remove(id.index).ok_or(InvalidIdError)
    }

    pub fn get(&self, id: SlotId<T>) -> Result<&T, InvalidIdError> {
        self.arena.get(id.index).ok_or(InvalidIdError)
    }

    pub fn get_mut(&mut self, id: SlotId<T>) -> Result<&mut T, InvalidIdError> {
        self.arena.get_mut(id.index).ok_or(InvalidIdError)
    }

    /// Returns `true` if `id` still refers to an occupied slot.
    pub fn contains(&self, id: SlotId<T>) -> bool {
        self.arena.contains(id.index)
    }

    /// Total number of slots, free or in use. Never changes.
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Number of slots currently holding a value.
    pub fn in_use(&self) -> usize {
        self.arena.len()
    }

    /// Number of slots [`Self::allocate`] can still fill.
    pub fn available(&self) -> usize {
        self.arena.capacity() - self.arena.len()
    }

    /// Ids of all occupied slots.
    pub fn ids(&self) -> impl Iterator<Item = SlotId<T>> + '_ {
        self.arena.iter().map(|(index, _)| SlotId::new(index))
    }
}
