use crate::bounce::BounceBuffer;
use crate::bus::Bus;
use crate::completion::{Completion, Finished, HifCallbacks, Submitted};
use crate::config::{ConfigOption, ConfigValue, DeviceConfig, IrqProcessingMode};
use crate::dispatch::{Dispatcher, Shared};
use crate::encoder::transfer_length;
use crate::error::{ArgumentError, HifError, ScatterSubmitError, SetupError, SubmitError};
use crate::interrupt::{HOST_INT_STATUS_ADDRESS, HOST_INT_STATUS_MBOX0, PENDING_POLL_ATTEMPTS};
use crate::lock;
use crate::pool::{Descriptor, DescriptorId, Payload};
use crate::queue::Work;
use crate::request::{Buffer, Direction, Execution, Request, RequestMode, Transaction};
use crate::scatter::{ScatterInfo, ScatterRequest, MAX_SCATTER_ENTRIES};
use log::{debug, error, trace, warn};
use oneshot::RecvTimeoutError;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to one coprocessor on a bus.
///
/// Every request goes through [`submit`](Self::submit): it takes a descriptor from the device's
/// fixed pool, joins the back of the submission queue, and is executed by the device's dispatch
/// thread once everything queued before it has run. `C` is the context handed back with the
/// result of an asynchronous request.
///
/// The dispatch thread runs between [`start`](Self::start) and [`stop`](Self::stop). Dropping
/// the device stops it.
pub struct Device<C> {
    shared: Arc<Shared<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C> Debug for Device<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("bus", &self.shared.bus)
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl<C: Send + 'static> Device<C> {
    /// Spawn the dispatch thread, after which requests are accepted.
    pub fn start(&self) -> Result<(), SetupError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Err(SetupError::AlreadyRunning);
        }
        let config = &self.shared.config;
        if config.pool_capacity == 0 {
            return Err(SetupError::EmptyPool);
        }
        if config.block_size == 0 {
            return Err(SetupError::ZeroBlockSize);
        }
        let bounce = BounceBuffer::new(config.bounce_size)?;

        self.shared.queue.open();
        let dispatcher = Dispatcher::new(Arc::clone(&self.shared), bounce);
        let spawned = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || dispatcher.run());
        match spawned {
            Ok(handle) => {
                debug!("Started device on {:?}", self.shared.bus);
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn dispatch thread: {e}");
                self.shared.queue.shut_down();
                Err(e.into())
            }
        }
    }
}

impl<C> Device<C> {
    /// Create a stopped device on `bus`.
    pub fn new(bus: Arc<dyn Bus>, config: DeviceConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(bus, config)),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Number of descriptors currently taken, queued or executing.
    pub fn in_flight(&self) -> usize {
        self.shared.pool.in_use()
    }

    /// Number of entries waiting in the submission queue.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Total number of descriptors.
    pub fn pool_capacity(&self) -> usize {
        self.shared.pool.capacity()
    }

    /// Stop the dispatch thread and wait for it to exit.
    ///
    /// Work still queued is not executed: its requests complete with [`HifError::NotRunning`]
    /// and queued interrupts are dropped. Does nothing if the device isn't running.
    pub fn stop(&self) {
        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        debug!("Stopping device on {:?}", self.shared.bus);
        self.shared.queue.shut_down();
        if handle.thread().id() == thread::current().id() {
            warn!("Device stopped from its own dispatch thread, not waiting for it to exit");
        } else if handle.join().is_err() {
            error!("Dispatch thread panicked");
        }

        let mut flushed = 0;
        for work in self.shared.queue.drain() {
            if let Work::Request(id) = work {
                self.shared.abort(id, HifError::NotRunning);
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!("Completed {flushed} queued requests as not running");
        }
    }

    /// Issue a request.
    ///
    /// A synchronous request blocks until it has been executed and returns
    /// [`Submitted::Complete`]. An asynchronous request returns [`Submitted::Pending`] once
    /// queued; its outcome goes to [`HifCallbacks::on_async_complete`].
    ///
    /// Fails without queueing anything if the request is malformed, if every descriptor is in
    /// use ([`HifError::ResourceExhausted`]), or if the device isn't running. The buffer is handed
    /// back in the error.
    pub fn submit(&self, request: Request<C>) -> Result<Submitted, SubmitError> {
        self.submit_with(request, None)
    }

    /// Like [`submit`](Self::submit), but a synchronous submitter waits at most `timeout`.
    ///
    /// If the wait runs out, [`HifError::Interrupted`] is returned without the buffer. The
    /// request is not withdrawn: it still runs in its turn, and its result is discarded.
    pub fn submit_timeout(
        &self,
        request: Request<C>,
        timeout: Duration,
    ) -> Result<Submitted, SubmitError> {
        self.submit_with(request, Some(timeout))
    }

    fn submit_with(
        &self,
        request: Request<C>,
        timeout: Option<Duration>,
    ) -> Result<Submitted, SubmitError> {
        let Request {
            address,
            buffer,
            length,
            mode,
            context,
        } = request;
        let execution = match self.check_request(address, &buffer, length, mode) {
            Ok(execution) => execution,
            Err(e) => {
                debug!("Rejected request at {address:#x}: {e}");
                return Err(SubmitError::new(e, buffer));
            }
        };

        match execution {
            Execution::Asynchronous => {
                if self.shared.callbacks().is_none() {
                    return Err(SubmitError::new(ArgumentError::NoCompletionHandler, buffer));
                }
                let payload = Payload::Single(buffer);
                let descriptor =
                    Descriptor::new(address, length, mode, payload, Completion::Async(context));
                self.enqueue(descriptor).map_err(rejected)?;
                Ok(Submitted::Pending)
            }
            Execution::Synchronous => self.transfer_sync(address, buffer, length, mode, timeout),
        }
    }

    /// Validate a request before it takes a descriptor.
    fn check_request(
        &self,
        address: u32,
        buffer: &Buffer,
        length: usize,
        mode: RequestMode,
    ) -> Result<Execution, ArgumentError> {
        let transaction = Transaction::try_from(mode)?;
        let execution = mode.execution().ok_or(ArgumentError::Mode(mode))?;
        let Some(data) = buffer.get(..length) else {
            return Err(ArgumentError::Length {
                length,
                capacity: buffer.len(),
            });
        };

        let config = &self.shared.config;
        let transferred = self.check_mailbox(address, length, transaction)?;
        if transferred > config.bounce_size && !self.shared.bus.is_dma_capable(&data[..transferred])
        {
            return Err(ArgumentError::BounceOverflow {
                length: transferred,
                capacity: config.bounce_size,
            });
        }
        Ok(execution)
    }

    /// Length of the transfer `length` bytes turn into, rejecting writes that would spill over
    /// the end of a mailbox.
    fn check_mailbox(
        &self,
        address: u32,
        length: usize,
        transaction: Transaction,
    ) -> Result<usize, ArgumentError> {
        let config = &self.shared.config;
        let transferred = transfer_length(config.block_size, length, transaction.granularity);
        if transaction.direction == Direction::Write {
            if let Some(width) = config.mailboxes.width_at(address) {
                if transferred > width as usize {
                    return Err(ArgumentError::MailboxOverflow {
                        length: transferred,
                        width,
                    });
                }
            }
        }
        Ok(transferred)
    }

    fn transfer_sync(
        &self,
        address: u32,
        buffer: Buffer,
        length: usize,
        mode: RequestMode,
        timeout: Option<Duration>,
    ) -> Result<Submitted, SubmitError> {
        if self.shared.on_dispatch_thread() {
            return Err(SubmitError::new(ArgumentError::SyncFromDispatch, buffer));
        }
        let (sender, receiver) = oneshot::channel();
        let payload = Payload::Single(buffer);
        let descriptor = Descriptor::new(address, length, mode, payload, Completion::Sync(sender));
        let id = self.enqueue(descriptor).map_err(rejected)?;
        self.wait(id, receiver, timeout)
    }

    /// Take a descriptor and queue it, handing it back if either step fails.
    fn enqueue(
        &self,
        descriptor: Descriptor<C>,
    ) -> Result<DescriptorId<C>, (HifError, Descriptor<C>)> {
        let id = match self.shared.pool.allocate(descriptor) {
            Ok(id) => id,
            Err(exhausted) => {
                debug!("No free request descriptors");
                return Err((HifError::ResourceExhausted, exhausted.into_inner()));
            }
        };
        if let Err(id) = self.shared.queue.push(id) {
            let descriptor = match self.shared.pool.release(id) {
                Ok(descriptor) => descriptor,
                Err(_) => unreachable!("a descriptor that was never queued is owned by its submitter"),
            };
            return Err((HifError::NotRunning, descriptor));
        }
        Ok(id)
    }

    /// Wait for the synchronous request `id` to complete, then release its descriptor.
    fn wait(
        &self,
        id: DescriptorId<C>,
        receiver: oneshot::Receiver<Finished>,
        timeout: Option<Duration>,
    ) -> Result<Submitted, SubmitError> {
        let finished = match timeout {
            None => receiver.recv().ok(),
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(finished) => Some(finished),
                Err(RecvTimeoutError::Disconnected) => None,
                Err(RecvTimeoutError::Timeout) => {
                    // The dispatch thread may be completing the request right now. Whichever
                    // side gets the pool lock first decides who releases the descriptor.
                    if self.shared.pool.with(id, Descriptor::abandon).unwrap_or(true) {
                        debug!(
                            "Stopped waiting for descriptor {}:{}",
                            id.slot(),
                            id.generation()
                        );
                        return Err(SubmitError::without_buffer(HifError::Interrupted));
                    }
                    receiver.recv().ok()
                }
            },
        };

        if self.shared.pool.release(id).is_err() {
            warn!("Descriptor {}:{} was released early", id.slot(), id.generation());
        }
        match finished {
            Some(Finished {
                result: Ok(transferred),
                buffer,
            }) => Ok(Submitted::Complete {
                buffer,
                transferred,
            }),
            Some(Finished {
                result: Err(e),
                buffer,
            }) => Err(SubmitError::new(e, buffer)),
            None => Err(SubmitError::without_buffer(HifError::NotRunning)),
        }
    }

    /// Queue a scatter request. `on_complete` receives the request back, with its fragments
    /// filled in for a read, once it has run.
    ///
    /// Scatter requests are only accepted after [`ConfigOption::ScatterSetup`] succeeded.
    pub fn submit_scatter<F>(
        &self,
        request: ScatterRequest,
        on_complete: F,
    ) -> Result<(), ScatterSubmitError>
    where
        F: FnOnce(ScatterRequest, Result<usize, HifError>) + Send + 'static,
    {
        if !self.shared.scatter_enabled.load(Ordering::Acquire) {
            return Err(ScatterSubmitError::new(ArgumentError::ScatterDisabled, request));
        }
        let checked = request.validate(&self.scatter_info()).and_then(|transaction| {
            self.check_mailbox(request.address, request.total_length(), transaction)
        });
        if let Err(e) = checked {
            return Err(ScatterSubmitError::new(e, request));
        }

        let descriptor = Descriptor::new(
            request.address,
            request.total_length(),
            request.mode,
            Payload::Scatter(request),
            Completion::Scatter(Box::new(on_complete)),
        );
        self.enqueue(descriptor).map_err(|(error, descriptor)| {
            let Some(Payload::Scatter(request)) = descriptor.payload else {
                unreachable!("scatter descriptors carry a scatter payload")
            };
            ScatterSubmitError::new(error, request)
        })?;
        trace!("Queued scatter request");
        Ok(())
    }

    fn scatter_info(&self) -> ScatterInfo {
        ScatterInfo {
            max_entries: MAX_SCATTER_ENTRIES,
            max_transfer_size: self.shared.config.bounce_size,
        }
    }

    /// Register the handlers asynchronous completions and interrupts are delivered to.
    ///
    /// Fails with [`ArgumentError::AlreadyAttached`] if handlers are attached already.
    pub fn attach_notification_handlers(
        &self,
        callbacks: Arc<dyn HifCallbacks<C>>,
    ) -> Result<(), HifError> {
        let mut attached = lock(&self.shared.callbacks);
        if attached.is_some() {
            return Err(ArgumentError::AlreadyAttached.into());
        }
        *attached = Some(callbacks);
        debug!("Attached notification handlers");
        Ok(())
    }

    /// Unregister the handlers. Completions of asynchronous requests still in flight are dropped.
    pub fn detach(&self) {
        if lock(&self.shared.callbacks).take().is_some() {
            debug!("Detached notification handlers");
        }
    }

    pub fn configure(&self, option: ConfigOption) -> Result<ConfigValue, HifError> {
        let config = &self.shared.config;
        Ok(match option {
            ConfigOption::MailboxBlockSizes => {
                ConfigValue::MailboxBlockSizes(config.mailboxes.block_sizes())
            }
            ConfigOption::MailboxAddresses => {
                ConfigValue::MailboxAddresses(config.mailboxes.info())
            }
            ConfigOption::IrqProcessingMode => {
                ConfigValue::IrqProcessingMode(IrqProcessingMode::SyncOnly)
            }
            ConfigOption::ScatterSetup => {
                if !config.scatter_supported {
                    return Err(ArgumentError::UnsupportedOption(option.code()).into());
                }
                self.shared.scatter_enabled.store(true, Ordering::Release);
                ConfigValue::Scatter(self.scatter_info())
            }
            ConfigOption::OsDevice => ConfigValue::OsDevice(Arc::clone(&self.shared.bus)),
        })
    }

    /// Like [`configure`](Self::configure), taking the option's wire code.
    pub fn configure_raw(&self, code: u32) -> Result<ConfigValue, HifError> {
        let option = ConfigOption::try_from(code).map_err(|e| {
            warn!("Unsupported configuration option {code}");
            e
        })?;
        self.configure(option)
    }

    /// Report a device interrupt. It is serviced by the DSR on the dispatch thread, after the
    /// requests already queued.
    ///
    /// Returns `false` if interrupts are masked, the device isn't running, or an interrupt is
    /// already waiting to be serviced.
    pub fn notify_interrupt(&self) -> bool {
        if self.shared.interrupts.is_masked() {
            trace!("Ignoring interrupt while masked");
            return false;
        }
        self.shared.queue.push_interrupt()
    }

    pub fn unmask_interrupts(&self) {
        self.shared.interrupts.set_masked(false);
        trace!("Interrupts unmasked");
    }

    /// Stop delivering interrupts, waiting for a running DSR to return.
    pub fn mask_interrupts(&self) {
        self.shared.interrupts.set_masked(true);
        if !self.shared.on_dispatch_thread() {
            self.shared.interrupts.wait_idle();
        }
        trace!("Interrupts masked");
    }

    /// Wait for the DSR to finish and the coprocessor to stop signalling mailbox data.
    ///
    /// Polls the interrupt status register a bounded number of times. Returns `true` once no
    /// mailbox interrupt is pending, `false` if one still is after the last poll. A failed read
    /// counts as nothing pending.
    ///
    /// Called from the dispatch thread, for instance from the DSR, it can neither wait for the
    /// DSR nor read the register, and returns `false` straight away.
    pub fn wait_for_pending_interrupt(&self) -> bool {
        if self.shared.on_dispatch_thread() {
            warn!("Cannot wait for pending interrupts from the dispatch thread");
            return false;
        }
        for _ in 0..PENDING_POLL_ATTEMPTS {
            self.shared.interrupts.wait_idle();
            let status = self.transfer_sync(
                HOST_INT_STATUS_ADDRESS,
                Buffer::zeroed(1),
                1,
                RequestMode::RD_SYNC_BYTE_INC,
                None,
            );
            let pending = match status {
                Ok(Submitted::Complete { buffer, .. }) => buffer[0] & HOST_INT_STATUS_MBOX0 != 0,
                Ok(Submitted::Pending) | Err(_) => false,
            };
            if !pending {
                return true;
            }
            thread::yield_now();
        }
        error!("Mailbox interrupt still pending after {PENDING_POLL_ATTEMPTS} polls");
        false
    }
}

impl<C> Drop for Device<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn rejected<C>((error, descriptor): (HifError, Descriptor<C>)) -> SubmitError {
    match descriptor.payload {
        Some(Payload::Single(buffer)) => SubmitError::new(error, buffer),
        _ => SubmitError::without_buffer(error),
    }
}
