//! The bounded set of request descriptors shared by submitters and the dispatch thread.

use crate::completion::{Completion, Finished};
use crate::lock;
use crate::request::{Buffer, RequestMode};
use crate::scatter::ScatterRequest;
use log::trace;
use slot_pool::{ExhaustedError, InvalidIdError, SlotId, SlotPool};
use std::sync::Mutex;

/// Data a descriptor carries to the dispatch thread.
#[derive(Debug)]
pub(crate) enum Payload {
    Single(Buffer),
    Scatter(ScatterRequest),
}

/// One pending or in-flight request.
///
/// A descriptor lives in the pool from submission until it is released: by the waiter of a
/// synchronous request after reading its result, or by the dispatch thread for every other
/// request, before the completion callback runs.
#[derive(Debug)]
pub(crate) struct Descriptor<C> {
    pub address: u32,
    pub length: usize,
    pub mode: RequestMode,
    /// Taken by the dispatch thread while the request executes.
    pub payload: Option<Payload>,
    /// Taken by the dispatch thread when the request finishes.
    pub completion: Option<Completion<C>>,
    /// The synchronous waiter gave up; whoever finishes the request releases the descriptor.
    pub abandoned: bool,
    /// The dispatch thread has taken the completion and is about to signal it.
    pub completed: bool,
}

impl<C> Descriptor<C> {
    pub fn new(
        address: u32,
        length: usize,
        mode: RequestMode,
        payload: Payload,
        completion: Completion<C>,
    ) -> Self {
        Self {
            address,
            length,
            mode,
            payload: Some(payload),
            completion: Some(completion),
            abandoned: false,
            completed: false,
        }
    }

    /// Take the completion signal of a synchronous request whose submitter is still waiting,
    /// marking the descriptor completed.
    ///
    /// Returns `None`, leaving the descriptor untouched, for any other request.
    pub fn take_waiter(&mut self) -> Option<oneshot::Sender<Finished>> {
        if self.abandoned {
            return None;
        }
        match self.completion.take() {
            Some(Completion::Sync(sender)) => {
                self.completed = true;
                Some(sender)
            }
            other => {
                self.completion = other;
                None
            }
        }
    }

    /// Give up waiting for a synchronous request, unless it already completed.
    ///
    /// Returns `true` if the descriptor is now abandoned.
    pub fn abandon(&mut self) -> bool {
        if !self.completed {
            self.abandoned = true;
        }
        self.abandoned
    }
}

pub(crate) type DescriptorId<C> = SlotId<Descriptor<C>>;

/// Fixed-capacity descriptor pool behind a single lock.
///
/// Allocation never blocks beyond the lock: an exhausted pool is reported to the caller
/// immediately.
#[derive(Debug)]
pub(crate) struct RequestPool<C> {
    slots: Mutex<SlotPool<Descriptor<C>>>,
}

impl<C> RequestPool<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(SlotPool::new(capacity)),
        }
    }

    pub fn allocate(
        &self,
        descriptor: Descriptor<C>,
    ) -> Result<DescriptorId<C>, ExhaustedError<Descriptor<C>>> {
        let id = lock(&self.slots).allocate(descriptor)?;
        trace!("Allocated descriptor {}:{}", id.slot(), id.generation());
        Ok(id)
    }

    pub fn release(&self, id: DescriptorId<C>) -> Result<Descriptor<C>, InvalidIdError> {
        let descriptor = lock(&self.slots).release(id)?;
        trace!("Released descriptor {}:{}", id.slot(), id.generation());
        Ok(descriptor)
    }

    /// Run `f` on the descriptor `id` under the pool lock.
    pub fn with<R>(
        &self,
        id: DescriptorId<C>,
        f: impl FnOnce(&mut Descriptor<C>) -> R,
    ) -> Result<R, InvalidIdError> {
        lock(&self.slots).get_mut(id).map(f)
    }

    pub fn capacity(&self) -> usize {
        lock(&self.slots).capacity()
    }

    pub fn in_use(&self) -> usize {
        lock(&self.slots).in_use()
    }

    pub fn available(&self) -> usize {
        lock(&self.slots).available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> Descriptor<u32> {
        Descriptor::new(
            0,
            4,
            RequestMode::WR_ASYNC_BYTE_INC,
            Payload::Single(Buffer::zeroed(4)),
            Completion::Async(7),
        )
    }

    #[test]
    fn exhaustion_is_reported_without_blocking() {
        let pool = RequestPool::new(2);
        pool.allocate(descriptor()).unwrap();
        pool.allocate(descriptor()).unwrap();
        let rejected = pool.allocate(descriptor()).unwrap_err().into_inner();
        assert!(matches!(rejected.completion, Some(Completion::Async(7))));
        assert_eq!(2, pool.in_use());
    }

    #[test]
    fn release_then_allocate_is_lifo() {
        let pool = RequestPool::new(4);
        let a = pool.allocate(descriptor()).unwrap();
        let b = pool.allocate(descriptor()).unwrap();
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        let c = pool.allocate(descriptor()).unwrap();
        assert_eq!(b.slot(), c.slot());
        assert!(pool.release(b).is_err());
        assert_eq!(4, pool.in_use() + pool.available());
    }

    #[test]
    fn completed_request_cannot_be_abandoned() {
        let (sender, _receiver) = oneshot::channel();
        let mut waiting = Descriptor::<()>::new(
            0,
            4,
            RequestMode::RD_SYNC_BYTE_INC,
            Payload::Single(Buffer::zeroed(4)),
            Completion::Sync(sender),
        );
        assert!(waiting.take_waiter().is_some());
        assert!(waiting.completed);
        assert!(!waiting.abandon());
        assert!(waiting.take_waiter().is_none());
    }

    #[test]
    fn abandoned_request_has_no_waiter() {
        let (sender, _receiver) = oneshot::channel();
        let mut waiting = Descriptor::<()>::new(
            0,
            4,
            RequestMode::RD_SYNC_BYTE_INC,
            Payload::Single(Buffer::zeroed(4)),
            Completion::Sync(sender),
        );
        assert!(waiting.abandon());
        assert!(waiting.take_waiter().is_none());
        assert!(matches!(waiting.completion, Some(Completion::Sync(_))));
    }

    #[test]
    fn async_request_has_no_waiter() {
        let mut async_request = descriptor();
        assert!(async_request.take_waiter().is_none());
        assert!(matches!(async_request.completion, Some(Completion::Async(7))));
    }
}
