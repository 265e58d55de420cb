//! Requests whose data is spread over several buffers, transferred as one bus operation.

use crate::error::ArgumentError;
use crate::request::{Buffer, Execution, RequestMode, Transaction};

/// Largest number of fragments a single [`ScatterRequest`] may have.
pub const MAX_SCATTER_ENTRIES: usize = 16;

/// Limits of the scatter path, reported when scatter support is set up through
/// [`crate::Device::configure`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ScatterInfo {
    pub max_entries: usize,
    /// Largest total length of a scatter request, in bytes.
    pub max_transfer_size: usize,
}

/// A transfer of the concatenation of `fragments`, in order.
///
/// Always executed asynchronously, through the completion handed to
/// [`crate::Device::submit_scatter`]. The fragments are handed back on completion, filled in for a
/// read.
#[derive(Debug)]
pub struct ScatterRequest {
    pub address: u32,
    pub mode: RequestMode,
    pub fragments: Vec<Buffer>,
}

impl ScatterRequest {
    pub fn new(address: u32, mode: RequestMode, fragments: Vec<Buffer>) -> Self {
        Self {
            address,
            mode,
            fragments,
        }
    }

    /// Sum of the fragment lengths.
    pub fn total_length(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    /// Check the request against the limits of the scatter path.
    pub(crate) fn validate(&self, info: &ScatterInfo) -> Result<Transaction, ArgumentError> {
        let transaction = Transaction::try_from(self.mode)?;
        if self.mode.execution() != Some(Execution::Asynchronous) {
            return Err(ArgumentError::Mode(self.mode));
        }
        if self.fragments.is_empty() || self.fragments.len() > info.max_entries {
            return Err(ArgumentError::ScatterEntries {
                count: self.fragments.len(),
                max: info.max_entries,
            });
        }
        let total = self.total_length();
        if total > info.max_transfer_size {
            return Err(ArgumentError::BounceOverflow {
                length: total,
                capacity: info.max_transfer_size,
            });
        }
        Ok(transaction)
    }

    /// Borrow every fragment as a plain byte slice.
    pub(crate) fn fragments_mut(&mut self) -> Vec<&mut [u8]> {
        self.fragments.iter_mut().map(|f| &mut f[..]).collect()
    }
}
