//! Defines the transport the engine drives: a serial bus with exclusive ownership and
//! single-buffer read and write primitives.

use crate::Alignment;
use log::warn;
use std::fmt::Debug;
use thiserror::Error;

/// How successive bytes of a multi-byte transfer are addressed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddressMode {
    /// Every byte targets the same address, FIFO-style.
    Fixed,
    /// Bytes target increasing addresses, memory-style.
    Incremental,
}

/// A generalization of the extended (multi-byte) I/O command of a serial host controller,
/// without the command encoding.
///
/// Implementors expose one function of a device on a shared bus. The bus driver permits only one
/// in-flight transaction at a time and only while the bus is claimed, so callers are expected to
/// bracket transfers with [`claim`](Self::claim) and [`release`](Self::release). In this crate,
/// only the dispatch thread of a [`crate::Device`] ever calls into a `Bus`.
///
/// Host controllers typically hand the caller's buffer straight to a DMA engine, which requires
/// some alignment and rules out memory it cannot address (such as the stack). Implementors report
/// this through [`is_dma_capable`](Self::is_dma_capable); buffers failing the check are staged
/// through an aligned bounce buffer before reaching [`read`](Self::read) or
/// [`write`](Self::write).
pub trait Bus: Debug + Send + Sync {
    /// Take exclusive ownership of the bus.
    fn claim(&self) -> Result<(), TransportError>;

    /// Give up ownership of the bus taken with [`claim`](Self::claim).
    fn release(&self) -> Result<(), TransportError>;

    /// Read `buf.len()` bytes starting at `address` into `buf`.
    fn read(&self, buf: &mut [u8], address: u32, mode: AddressMode) -> Result<(), TransportError>;

    /// Write all of `buf` starting at `address`.
    fn write(&self, address: u32, buf: &[u8], mode: AddressMode) -> Result<(), TransportError>;

    /// Alignment the transport requires of buffers it transfers from or into directly.
    fn dma_alignment(&self) -> Alignment {
        Alignment::WORD
    }

    /// Returns `true` if `buf` can be handed to the transport directly.
    fn is_dma_capable(&self, buf: &[u8]) -> bool {
        self.dma_alignment().is_aligned_ptr(buf)
    }
}

/// The bus driver reported a failed command or transfer.
///
/// `code` is the driver's own status code, kept for diagnostics only.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("bus operation failed with status {code}")]
pub struct TransportError {
    pub code: i32,
}

impl TransportError {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

/// Ownership of a claimed bus, released when dropped.
#[derive(Debug)]
pub struct BusClaim<'a> {
    bus: &'a dyn Bus,
}

impl<'a> BusClaim<'a> {
    pub fn acquire(bus: &'a dyn Bus) -> Result<Self, TransportError> {
        bus.claim()?;
        Ok(Self { bus })
    }

    pub fn bus(&self) -> &'a dyn Bus {
        self.bus
    }
}

impl Drop for BusClaim<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.bus.release() {
            warn!("Failed to release bus: {e}");
        }
    }
}
