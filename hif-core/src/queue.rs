//! The ordered list of work waiting for the dispatch thread.

use crate::lock;
use crate::pool::DescriptorId;
use log::trace;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// One unit of work for the dispatch thread.
#[derive(Debug)]
pub(crate) enum Work<C> {
    /// Execute the request held by a descriptor.
    Request(DescriptorId<C>),
    /// Service a device interrupt.
    Interrupt,
}

/// What woke the dispatch thread up.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Wake {
    Work,
    Shutdown,
}

#[derive(Debug)]
struct State<C> {
    entries: VecDeque<Work<C>>,
    /// An interrupt is queued and not yet serviced. Further notifications are folded into it.
    interrupt_queued: bool,
    /// Pushes are refused while closed.
    open: bool,
    shutdown: bool,
}

/// FIFO of [`Work`] with a wake-up signal for its single consumer.
///
/// Every operation holds the lock only for a single push or pop.
#[derive(Debug)]
pub(crate) struct SubmissionQueue<C> {
    state: Mutex<State<C>>,
    available: Condvar,
}

impl<C> SubmissionQueue<C> {
    /// Create a closed, empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                interrupt_queued: false,
                open: false,
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Start accepting work again, clearing any earlier shutdown request.
    pub fn open(&self) {
        let mut state = lock(&self.state);
        state.open = true;
        state.shutdown = false;
    }

    /// Append a request at the tail and wake the consumer.
    ///
    /// Fails, handing the id back, if the queue is closed.
    pub fn push(&self, id: DescriptorId<C>) -> Result<(), DescriptorId<C>> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(id);
        }
        state.entries.push_back(Work::Request(id));
        trace!(
            "Queued descriptor {}:{} ({} queued)",
            id.slot(),
            id.generation(),
            state.entries.len()
        );
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Append an interrupt at the tail, unless one is already waiting.
    ///
    /// Returns `true` if an interrupt was queued.
    pub fn push_interrupt(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.open || state.interrupt_queued {
            return false;
        }
        state.interrupt_queued = true;
        state.entries.push_back(Work::Interrupt);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Remove and return the head of the queue.
    pub fn pop(&self) -> Option<Work<C>> {
        let mut state = lock(&self.state);
        let work = state.entries.pop_front();
        if matches!(work, Some(Work::Interrupt)) {
            state.interrupt_queued = false;
        }
        work
    }

    /// Block until there is work or shutdown was requested.
    ///
    /// A poisoned lock counts as a shutdown request.
    pub fn wait(&self) -> Wake {
        let Ok(mut state) = self.state.lock() else {
            return Wake::Shutdown;
        };
        loop {
            if state.shutdown {
                return Wake::Shutdown;
            }
            if !state.entries.is_empty() {
                return Wake::Work;
            }
            state = match self.available.wait(state) {
                Ok(state) => state,
                Err(_) => return Wake::Shutdown,
            };
        }
    }

    /// Refuse further pushes, ask the consumer to exit, and wake it.
    pub fn shut_down(&self) {
        let mut state = lock(&self.state);
        state.open = false;
        state.shutdown = true;
        drop(state);
        self.available.notify_all();
    }

    /// Returns `true` if shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        lock(&self.state).shutdown
    }

    /// Remove everything still queued, in order.
    pub fn drain(&self) -> Vec<Work<C>> {
        let mut state = lock(&self.state);
        state.interrupt_queued = false;
        state.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }
}
