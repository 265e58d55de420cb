use crate::bus::TransportError;
use crate::request::{Buffer, RequestMode};
use crate::scatter::ScatterRequest;
use thiserror::Error;

/// Outcome of a request that did not complete successfully.
///
/// Every error here is data: it is returned to the submitter or passed to the completion
/// callback, through the same channel as a success.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum HifError {
    /// The request was malformed and rejected before touching the bus.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentError),
    /// Every request descriptor is in flight. The caller may retry later.
    #[error("no free request descriptors")]
    ResourceExhausted,
    /// The bus driver reported a failure while performing the transfer.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A synchronous wait ended before the request completed. The request itself still runs.
    #[error("wait for completion was interrupted")]
    Interrupted,
    /// The device's dispatch thread is not running, or stopped before the request ran.
    #[error("device is not running")]
    NotRunning,
}

/// Reasons a request or configuration call is rejected at the boundary.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArgumentError {
    #[error("malformed request mode {0}")]
    Mode(RequestMode),
    #[error("length {length} exceeds buffer of {capacity} bytes")]
    Length { length: usize, capacity: usize },
    #[error("mailbox write of {length} bytes exceeds mailbox width {width}")]
    MailboxOverflow { length: usize, width: u32 },
    #[error("transfer of {length} bytes needs staging but the bounce buffer holds {capacity}")]
    BounceOverflow { length: usize, capacity: usize },
    #[error("unsupported configuration option {0}")]
    UnsupportedOption(u32),
    #[error("scatter requests are not enabled on this device")]
    ScatterDisabled,
    #[error("scatter request has {count} entries, at most {max} are supported")]
    ScatterEntries { count: usize, max: usize },
    #[error("asynchronous request without a completion handler attached")]
    NoCompletionHandler,
    #[error("completion handlers are already attached")]
    AlreadyAttached,
    #[error("synchronous request issued from the dispatch thread")]
    SyncFromDispatch,
}

/// Failure to bring a device's dispatch thread up. Aborts enabling the device.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("device is already running")]
    AlreadyRunning,
    #[error("request pool must hold at least one descriptor")]
    EmptyPool,
    #[error("block size must be non-zero")]
    ZeroBlockSize,
    #[error("failed to allocate {0} byte bounce buffer")]
    BounceAllocation(usize),
    #[error("failed to spawn dispatch thread")]
    Spawn(#[from] std::io::Error),
}

/// A [`HifError`] returned to a submitter, with the request's buffer whenever the engine still
/// held it.
///
/// The buffer is `None` only for [`HifError::Interrupted`], where the dispatch thread keeps it
/// until the abandoned request has run.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct SubmitError {
    pub error: HifError,
    pub buffer: Option<Buffer>,
}

impl SubmitError {
    pub(crate) fn new(error: impl Into<HifError>, buffer: Buffer) -> Self {
        Self {
            error: error.into(),
            buffer: Some(buffer),
        }
    }

    pub(crate) fn without_buffer(error: HifError) -> Self {
        Self {
            error,
            buffer: None,
        }
    }

    pub fn into_buffer(self) -> Option<Buffer> {
        self.buffer
    }
}

/// A scatter request that was rejected before being queued, handed back to the caller.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct ScatterSubmitError {
    pub error: HifError,
    pub request: ScatterRequest,
}

impl ScatterSubmitError {
    pub(crate) fn new(error: impl Into<HifError>, request: ScatterRequest) -> Self {
        Self {
            error: error.into(),
            request,
        }
    }
}
