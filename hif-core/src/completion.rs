//! The two ways a request is reported complete: a private one-shot signal for a blocked
//! submitter, or the device's completion callback for a submitter that didn't wait.

use crate::error::HifError;
use crate::interrupt::{DsrContext, DsrStatus};
use crate::request::Buffer;
use crate::scatter::ScatterRequest;
use std::fmt::{Debug, Formatter};

/// Handlers a device calls into, attached once with
/// [`crate::Device::attach_notification_handlers`].
///
/// Both handlers run on the device's dispatch thread without any of the device's locks held, so
/// they may submit new asynchronous requests. They must not submit synchronous requests, which
/// would wait on the thread running them.
pub trait HifCallbacks<C>: Send + Sync {
    /// Called once for every asynchronous request, after its descriptor returned to the pool.
    ///
    /// `result` holds the number of bytes transferred, which can be less than requested in block
    /// mode.
    fn on_async_complete(&self, context: C, buffer: Buffer, result: Result<usize, HifError>);

    /// Called for each interrupt delivered through [`crate::Device::notify_interrupt`].
    ///
    /// `ctx` performs reads and writes directly on the bus, which the dispatch thread holds for
    /// the duration of the call.
    fn dsr(&self, ctx: &mut DsrContext<'_>) -> DsrStatus {
        let _ = ctx;
        DsrStatus::Ok
    }
}

/// Successful outcome of [`crate::Device::submit`].
#[derive(Debug)]
pub enum Submitted {
    /// A synchronous request ran. Holds its buffer (filled, for a read) and the number of bytes
    /// transferred.
    Complete { buffer: Buffer, transferred: usize },
    /// An asynchronous request was queued. Its outcome is delivered to
    /// [`HifCallbacks::on_async_complete`].
    Pending,
}

impl Submitted {
    /// Returns the buffer of a completed request.
    pub fn into_buffer(self) -> Option<Buffer> {
        match self {
            Submitted::Complete { buffer, .. } => Some(buffer),
            Submitted::Pending => None,
        }
    }
}

/// Result of a finished synchronous request, sent from the dispatch thread to the waiter.
#[derive(Debug)]
pub(crate) struct Finished {
    pub result: Result<usize, HifError>,
    pub buffer: Buffer,
}

pub(crate) type ScatterCompletion =
    Box<dyn FnOnce(ScatterRequest, Result<usize, HifError>) + Send + 'static>;

/// Where a descriptor's outcome goes. Fixed when the descriptor is allocated.
pub(crate) enum Completion<C> {
    Sync(oneshot::Sender<Finished>),
    Async(C),
    Scatter(ScatterCompletion),
}

impl<C> Debug for Completion<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Sync(_) => f.write_str("Sync"),
            Completion::Async(_) => f.write_str("Async"),
            Completion::Scatter(_) => f.write_str("Scatter"),
        }
    }
}
