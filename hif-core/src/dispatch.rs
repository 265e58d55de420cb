//! The dispatch thread: the only code that touches the bus once a device is running.
//!
//! The thread sleeps until work is queued, claims the bus, and executes queued work in order
//! until the queue is empty (or the configured batch bound is hit), then releases the bus again.
//!
//! ```text
//!   Idle ──work──▶ BusClaimed ──pop──▶ Executing ──done──▶ BusClaimed ──empty──▶ Idle
//!    │                                                                              │
//!    └──────────────── shutdown ──▶ Terminated ◀──────────── shutdown ──────────────┘
//! ```

use crate::bounce::BounceBuffer;
use crate::bus::{Bus, BusClaim, TransportError};
use crate::completion::{Completion, Finished, HifCallbacks};
use crate::config::DeviceConfig;
use crate::encoder::Encoder;
use crate::error::{ArgumentError, HifError};
use crate::interrupt::{DsrContext, DsrStatus, InterruptGate};
use crate::lock;
use crate::pool::{Descriptor, DescriptorId, Payload, RequestPool};
use crate::queue::{SubmissionQueue, Wake, Work};
use log::{debug, error, trace, warn};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

/// State shared between a device handle, its submitters and its dispatch thread.
pub(crate) struct Shared<C> {
    pub bus: Arc<dyn Bus>,
    pub config: DeviceConfig,
    pub pool: RequestPool<C>,
    pub queue: SubmissionQueue<C>,
    pub callbacks: Mutex<Option<Arc<dyn HifCallbacks<C>>>>,
    pub interrupts: InterruptGate,
    pub scatter_enabled: AtomicBool,
    /// Set by the dispatch thread when it starts.
    pub dispatch_thread: Mutex<Option<ThreadId>>,
}

impl<C> Shared<C> {
    pub fn new(bus: Arc<dyn Bus>, config: DeviceConfig) -> Self {
        Self {
            bus,
            pool: RequestPool::new(config.pool_capacity),
            queue: SubmissionQueue::new(),
            callbacks: Mutex::new(None),
            interrupts: InterruptGate::new(),
            scatter_enabled: AtomicBool::new(false),
            dispatch_thread: Mutex::new(None),
            config,
        }
    }

    pub fn callbacks(&self) -> Option<Arc<dyn HifCallbacks<C>>> {
        lock(&self.callbacks).clone()
    }

    /// Returns `true` if called from this device's dispatch thread.
    pub fn on_dispatch_thread(&self) -> bool {
        *lock(&self.dispatch_thread) == Some(thread::current().id())
    }

    /// Complete the request `id` with `result`, handing `payload` back to its submitter.
    ///
    /// A waiting synchronous submitter is signalled and releases the descriptor itself. Every
    /// other descriptor is released here, before its completion runs, so the completion can
    /// reuse it. No lock is held while a completion runs.
    pub fn finish(&self, id: DescriptorId<C>, payload: Payload, result: Result<usize, HifError>) {
        let waiter = match self.pool.with(id, Descriptor::take_waiter) {
            Ok(waiter) => waiter,
            Err(_) => {
                warn!(
                    "Finished descriptor {}:{} no longer exists, dropping result",
                    id.slot(),
                    id.generation()
                );
                return;
            }
        };

        if let Some(sender) = waiter {
            match payload {
                Payload::Single(buffer) => {
                    if sender.send(Finished { result, buffer }).is_err() {
                        warn!("Synchronous submitter went away before its request completed");
                    }
                }
                Payload::Scatter(_) => error!("Scatter request with a synchronous waiter"),
            }
            return;
        }

        let descriptor = match self.pool.release(id) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                warn!("Descriptor {}:{} released twice", id.slot(), id.generation());
                return;
            }
        };
        match (descriptor.completion, payload) {
            (Some(Completion::Async(context)), Payload::Single(buffer)) => match self.callbacks() {
                Some(callbacks) => callbacks.on_async_complete(context, buffer, result),
                None => warn!("No completion handler attached, dropping asynchronous result"),
            },
            (Some(Completion::Scatter(complete)), Payload::Scatter(request)) => {
                complete(request, result)
            }
            (Some(Completion::Sync(_)), _) | (None, _) => {
                debug!("Dropping result of abandoned request: {result:?}")
            }
            (Some(completion), payload) => {
                error!("Completion {completion:?} does not match payload {payload:?}")
            }
        }
    }

    /// Complete the queued request `id` with `error` without executing it.
    pub fn abort(&self, id: DescriptorId<C>, error: HifError) {
        match self.pool.with(id, |d| d.payload.take()) {
            Ok(Some(payload)) => self.finish(id, payload, Err(error)),
            Ok(None) | Err(_) => warn!(
                "Aborted descriptor {}:{} is no longer queued",
                id.slot(),
                id.generation()
            ),
        }
    }
}

/// Body of the dispatch thread. Owns the device's bounce buffer.
pub(crate) struct Dispatcher<C> {
    shared: Arc<Shared<C>>,
    bounce: BounceBuffer,
}

impl<C> Dispatcher<C> {
    pub fn new(shared: Arc<Shared<C>>, bounce: BounceBuffer) -> Self {
        Self { shared, bounce }
    }

    pub fn run(mut self) {
        *lock(&self.shared.dispatch_thread) = Some(thread::current().id());
        debug!("Dispatch thread started");
        while self.shared.queue.wait() == Wake::Work {
            self.drain();
        }
        *lock(&self.shared.dispatch_thread) = None;
        debug!("Dispatch thread stopping");
    }

    /// Execute queued work until the queue is empty or shutdown is requested.
    fn drain(&mut self) {
        let shared = &*self.shared;
        let bounce = &mut self.bounce;
        let max_batch = shared.config.max_batch.map_or(usize::MAX, |n| n.get());

        loop {
            let claim = match BusClaim::acquire(&*shared.bus) {
                Ok(claim) => claim,
                Err(e) => {
                    error!("Failed to claim bus: {e}");
                    Self::fail_queued(shared, e);
                    return;
                }
            };
            trace!("Bus claimed");

            let mut executed = 0;
            while executed < max_batch {
                if shared.queue.is_shutting_down() {
                    return;
                }
                let Some(work) = shared.queue.pop() else {
                    trace!("Queue empty, releasing bus after {executed} requests");
                    return;
                };
                Self::execute(shared, bounce, claim.bus(), work);
                executed += 1;
            }
            trace!("Batch bound reached, releasing bus");
        }
    }

    fn execute(shared: &Shared<C>, bounce: &mut BounceBuffer, bus: &dyn Bus, work: Work<C>) {
        match work {
            Work::Request(id) => Self::execute_request(shared, bounce, bus, id),
            Work::Interrupt => Self::service_interrupt(shared, bounce, bus),
        }
    }

    fn execute_request(
        shared: &Shared<C>,
        bounce: &mut BounceBuffer,
        bus: &dyn Bus,
        id: DescriptorId<C>,
    ) {
        let taken = shared
            .pool
            .with(id, |d| (d.address, d.length, d.mode, d.payload.take()));
        let (address, length, mode, payload) = match taken {
            Ok((address, length, mode, Some(payload))) => (address, length, mode, payload),
            Ok((_, _, _, None)) | Err(_) => {
                warn!("Skipping stale queue entry {}:{}", id.slot(), id.generation());
                return;
            }
        };
        trace!(
            "Executing descriptor {}:{} ({mode} at {address:#x})",
            id.slot(),
            id.generation()
        );

        let config = &shared.config;
        let mut encoder = Encoder::new(bus, &config.mailboxes, config.block_size, bounce);
        match payload {
            Payload::Single(mut buffer) => {
                let capacity = buffer.len();
                let result = match buffer.get_mut(..length) {
                    Some(data) => encoder.perform(address, data, mode),
                    None => Err(ArgumentError::Length { length, capacity }.into()),
                };
                shared.finish(id, Payload::Single(buffer), result);
            }
            Payload::Scatter(mut request) => {
                let result = {
                    let mut fragments = request.fragments_mut();
                    encoder.perform_gathered(address, &mut fragments, mode)
                };
                shared.finish(id, Payload::Scatter(request), result);
            }
        }
    }

    fn service_interrupt(shared: &Shared<C>, bounce: &mut BounceBuffer, bus: &dyn Bus) {
        if shared.interrupts.is_masked() {
            trace!("Dropping interrupt delivered while masked");
            return;
        }
        let Some(callbacks) = shared.callbacks() else {
            warn!("Interrupt with no handler attached");
            return;
        };

        shared.interrupts.set_handling(true);
        let config = &shared.config;
        let mut ctx = DsrContext::new(Encoder::new(
            bus,
            &config.mailboxes,
            config.block_size,
            bounce,
        ));
        match callbacks.dsr(&mut ctx) {
            DsrStatus::Ok => trace!("Interrupt serviced"),
            DsrStatus::Canceled => debug!("Interrupt service canceled"),
        }
        shared.interrupts.set_handling(false);
    }

    /// Fail everything queued right now, after the bus could not be claimed.
    fn fail_queued(shared: &Shared<C>, e: TransportError) {
        while let Some(work) = shared.queue.pop() {
            match work {
                Work::Request(id) => shared.abort(id, HifError::Transport(e)),
                Work::Interrupt => warn!("Dropping interrupt, bus unavailable"),
            }
        }
    }
}
