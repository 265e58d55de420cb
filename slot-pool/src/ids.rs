use std::{any::type_name, fmt::Debug, hash::Hash, marker::PhantomData};

use generational_arena::Index;

/// Handle to an occupied slot of a [`crate::SlotPool<T>`].
///
/// Carries the slot's generation, so a handle kept around after its slot was released and
/// reused never resolves to the new occupant.
pub struct SlotId<T> {
    pub(crate) index: Index,
    _phan: PhantomData<fn() -> T>,
}

impl<T> SlotId<T> {
    pub(crate) fn new(index: Index) -> Self {
        Self {
            index,
            _phan: PhantomData,
        }
    }

    /// Position of the slot in the pool's backing storage, in `0..capacity`.
    ///
    /// Two ids with the same slot but different generations refer to different occupancies of
    /// the same storage.
    pub fn slot(&self) -> usize {
        self.index.into_raw_parts().0
    }

    /// Generation of the occupancy this id refers to.
    pub fn generation(&self) -> u64 {
        self.index.into_raw_parts().1
    }
}

impl<T> Debug for SlotId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotId")
            .field("slot", &self.slot())
            .field("generation", &self.generation())
            .field("type", &type_name::<T>())
            .finish()
    }
}

impl<T> Clone for SlotId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotId<T> {}

impl<T> PartialEq for SlotId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index.eq(&other.index)
    }
}

impl<T> Eq for SlotId<T> {}

impl<T> Hash for SlotId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}
