//! Delivery of device interrupts to the attached deferred service routine (DSR).
//!
//! Interrupts are not serviced where they are raised. [`crate::Device::notify_interrupt`] queues
//! a message behind any pending requests, and the dispatch thread calls the DSR when it reaches
//! it, with the bus already claimed.

use crate::encoder::Encoder;
use crate::error::HifError;
use crate::lock;
use crate::request::{Buffer, RequestMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Register holding the host interrupt status bits of the coprocessor.
pub const HOST_INT_STATUS_ADDRESS: u32 = 0x400;

/// Bit of [`HOST_INT_STATUS_ADDRESS`] set while mailbox 0 has data for the host.
pub const HOST_INT_STATUS_MBOX0: u8 = 1 << 0;

/// Times the status register is checked before giving up on pending interrupts clearing.
pub(crate) const PENDING_POLL_ATTEMPTS: usize = 10;

/// Outcome reported by a DSR.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DsrStatus {
    Ok,
    /// The handler stopped early, for instance because the device is going away.
    Canceled,
}

/// Bus access for a DSR, performed inline on the dispatch thread.
///
/// Transfers made here bypass the submission queue: they run immediately, in the order issued,
/// before any request queued behind the interrupt.
#[derive(Debug)]
pub struct DsrContext<'a> {
    encoder: Encoder<'a>,
}

impl<'a> DsrContext<'a> {
    pub(crate) fn new(encoder: Encoder<'a>) -> Self {
        Self { encoder }
    }

    /// Perform one transfer of `buf` as described by `mode`. The execution bits of `mode` are
    /// ignored.
    pub fn transfer(
        &mut self,
        address: u32,
        buf: &mut [u8],
        mode: RequestMode,
    ) -> Result<usize, HifError> {
        self.encoder.perform(address, buf, mode)
    }

    /// Read the host interrupt status register.
    pub fn interrupt_status(&mut self) -> Result<u8, HifError> {
        let mut status = [0u8];
        self.transfer(
            HOST_INT_STATUS_ADDRESS,
            &mut status,
            RequestMode::RD_SYNC_BYTE_INC,
        )?;
        Ok(status[0])
    }

    /// Read `length` bytes into a new buffer.
    pub fn read(
        &mut self,
        address: u32,
        length: usize,
        mode: RequestMode,
    ) -> Result<Buffer, HifError> {
        let mut buffer = Buffer::zeroed(length);
        let transferred = self.transfer(address, &mut buffer, mode)?;
        let mut data = buffer.into_vec();
        data.truncate(transferred);
        Ok(Buffer::from(data))
    }
}

/// Interrupt delivery state of a device.
#[derive(Debug)]
pub(crate) struct InterruptGate {
    masked: AtomicBool,
    /// The DSR is running on the dispatch thread.
    handling: Mutex<bool>,
    idle: Condvar,
}

impl InterruptGate {
    pub fn new() -> Self {
        Self {
            masked: AtomicBool::new(true),
            handling: Mutex::new(false),
            idle: Condvar::new(),
        }
    }

    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::Acquire)
    }

    pub fn set_masked(&self, masked: bool) {
        self.masked.store(masked, Ordering::Release);
    }

    /// Record whether the DSR is running, waking [`wait_idle`](Self::wait_idle) once it stops.
    pub fn set_handling(&self, handling: bool) {
        *lock(&self.handling) = handling;
        if !handling {
            self.idle.notify_all();
        }
    }

    /// Block until the DSR is not running.
    pub fn wait_idle(&self) {
        let mut handling = lock(&self.handling);
        while *handling {
            handling = self
                .idle
                .wait(handling)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounce::BounceBuffer;
    use crate::mailbox::MailboxLayout;
    use crate::sim::SimTarget;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn status_register_reflects_mailbox_data() {
        let target = SimTarget::new();
        let layout = MailboxLayout::default();
        let mut bounce = BounceBuffer::new(64).unwrap();
        let mut ctx = DsrContext::new(Encoder::new(&target, &layout, 128, &mut bounce));
        assert_eq!(Ok(0), ctx.interrupt_status());

        target.push_rx(0, &[1, 2, 3]);
        assert_eq!(Ok(HOST_INT_STATUS_MBOX0), ctx.interrupt_status());
        let message = ctx
            .read(layout.info().addresses[0], 3, RequestMode::RD_SYNC_BYTE_FIX)
            .unwrap();
        assert_eq!(&[1, 2, 3], &message[..]);
        assert_eq!(Ok(0), ctx.interrupt_status());
    }

    #[test]
    fn gate_starts_masked() {
        let gate = InterruptGate::new();
        assert!(gate.is_masked());
        gate.set_masked(false);
        assert!(!gate.is_masked());
        gate.wait_idle();
    }

    #[test]
    fn wait_idle_wakes_when_the_dsr_returns() {
        let gate = Arc::new(InterruptGate::new());
        gate.set_handling(true);

        let (sender, woken) = mpsc::channel();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait_idle();
                let _ = sender.send(Instant::now());
            })
        };
        assert!(woken.recv_timeout(Duration::from_millis(50)).is_err());

        let cleared = Instant::now();
        gate.set_handling(false);
        let woke_at = woken.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(woke_at.duration_since(cleared) < Duration::from_millis(90));
        waiter.join().unwrap();
    }
}
