//! Translation of a request into the single bus transfer that performs it.

use crate::bounce::BounceBuffer;
use crate::bus::{AddressMode, Bus};
use crate::error::{ArgumentError, HifError};
use crate::mailbox::MailboxLayout;
use crate::request::{Direction, Granularity, RequestMode, Transaction};
use log::{error, trace};

/// The concrete transfer a request maps to, before any data moves.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Plan {
    /// Address the transfer targets, after mailbox end-of-message adjustment.
    pub address: u32,
    /// Number of bytes transferred, after block rounding.
    pub length: usize,
    pub direction: Direction,
    pub address_mode: AddressMode,
}

/// Decide how a request of `length` bytes at `address` is performed.
///
/// Fails only if `mode` is malformed. In block mode the length is rounded down to a whole number of
/// `block_size` blocks (possibly zero). Writes into a mailbox window are moved forward so that the
/// last byte lands on the window's end-of-message address.
pub fn plan(
    layout: &MailboxLayout,
    block_size: u32,
    address: u32,
    length: usize,
    mode: RequestMode,
) -> Result<Plan, ArgumentError> {
    let Transaction {
        direction,
        address_mode,
        granularity,
    } = Transaction::try_from(mode)?;

    let length = transfer_length(block_size, length, granularity);
    let address = match direction {
        Direction::Write => layout.eom_aligned(address, length),
        Direction::Read => address,
    };

    Ok(Plan {
        address,
        length,
        direction,
        address_mode,
    })
}

/// Number of bytes a request of `length` bytes actually transfers.
pub fn transfer_length(block_size: u32, length: usize, granularity: Granularity) -> usize {
    match granularity {
        Granularity::Block => {
            let block_size = block_size as usize;
            length.checked_div(block_size).map_or(0, |blocks| blocks * block_size)
        }
        Granularity::Byte => length,
    }
}

/// Performs requests on a claimed bus, one at a time.
///
/// Holds the device's only bounce buffer for as long as it lives, so no two encoders of one
/// device can exist at once.
#[derive(Debug)]
pub struct Encoder<'a> {
    bus: &'a dyn Bus,
    layout: &'a MailboxLayout,
    block_size: u32,
    bounce: &'a mut BounceBuffer,
}

impl<'a> Encoder<'a> {
    pub fn new(
        bus: &'a dyn Bus,
        layout: &'a MailboxLayout,
        block_size: u32,
        bounce: &'a mut BounceBuffer,
    ) -> Self {
        Self {
            bus,
            layout,
            block_size,
            bounce,
        }
    }

    pub fn bus(&self) -> &'a dyn Bus {
        self.bus
    }

    /// Perform one transfer of `buf` (the first `buf.len()` bytes of the request's buffer).
    ///
    /// Returns the number of bytes actually transferred, which is less than `buf.len()` only in
    /// block mode. Buffers the transport can't use directly are staged through the bounce buffer.
    pub fn perform(
        &mut self,
        address: u32,
        buf: &mut [u8],
        mode: RequestMode,
    ) -> Result<usize, HifError> {
        let plan = plan(self.layout, self.block_size, address, buf.len(), mode)?;
        let data = &mut buf[..plan.length];
        trace!(
            "Encoding {} of {} bytes at {:#x} (requested {:#x})",
            plan.direction,
            plan.length,
            plan.address,
            address
        );

        if self.bus.is_dma_capable(data) {
            return self.transfer(&plan, data).map(|()| plan.length);
        }

        let capacity = self.bounce.len();
        let staging = self
            .bounce
            .staging(plan.length)
            .ok_or(ArgumentError::BounceOverflow {
                length: plan.length,
                capacity,
            })?;
        trace!("Staging {} bytes through bounce buffer", plan.length);
        if plan.direction == Direction::Write {
            staging.copy_from_slice(data);
        }
        Self::transfer_on(self.bus, &plan, staging)?;
        if plan.direction == Direction::Read {
            data.copy_from_slice(staging);
        }
        Ok(plan.length)
    }

    /// Perform one transfer whose data is spread over `fragments`, always staging through the
    /// bounce buffer.
    ///
    /// Writes gather the fragments into the bounce buffer in order. Reads scatter the bounce buffer
    /// back out over them in the same order.
    pub fn perform_gathered(
        &mut self,
        address: u32,
        fragments: &mut [&mut [u8]],
        mode: RequestMode,
    ) -> Result<usize, HifError> {
        let total = fragments.iter().map(|f| f.len()).sum();
        let plan = plan(self.layout, self.block_size, address, total, mode)?;
        let capacity = self.bounce.len();
        let staging = self
            .bounce
            .staging(plan.length)
            .ok_or(ArgumentError::BounceOverflow {
                length: plan.length,
                capacity,
            })?;
        trace!(
            "Encoding gathered {} of {} bytes in {} fragments at {:#x}",
            plan.direction,
            plan.length,
            fragments.len(),
            plan.address
        );

        if plan.direction == Direction::Write {
            copy_fragments(fragments, staging, |fragment, chunk| {
                chunk.copy_from_slice(fragment)
            });
        }
        Self::transfer_on(self.bus, &plan, staging)?;
        if plan.direction == Direction::Read {
            copy_fragments(fragments, staging, |fragment, chunk| {
                fragment.copy_from_slice(chunk)
            });
        }
        Ok(plan.length)
    }

    fn transfer(&self, plan: &Plan, data: &mut [u8]) -> Result<(), HifError> {
        Self::transfer_on(self.bus, plan, data)
    }

    fn transfer_on(bus: &dyn Bus, plan: &Plan, data: &mut [u8]) -> Result<(), HifError> {
        let result = match plan.direction {
            Direction::Write => bus.write(plan.address, data, plan.address_mode),
            Direction::Read => bus.read(data, plan.address, plan.address_mode),
        };
        result.map_err(|e| {
            error!(
                "Bus {} of {} bytes at {:#x} failed: {e}",
                plan.direction, plan.length, plan.address
            );
            HifError::Transport(e)
        })
    }
}

/// Walk `fragments` and the matching consecutive chunks of `staging`, stopping when `staging` is
/// used up. The last fragment visited may be paired with a shorter chunk.
fn copy_fragments(
    fragments: &mut [&mut [u8]],
    staging: &mut [u8],
    mut copy: impl FnMut(&mut [u8], &mut [u8]),
) {
    let mut rest = staging;
    for fragment in fragments.iter_mut() {
        if rest.is_empty() {
            break;
        }
        let n = fragment.len().min(rest.len());
        let (chunk, tail) = rest.split_at_mut(n);
        copy(&mut fragment[..n], chunk);
        rest = tail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MBOX_BASE_ADDRESS;
    use crate::sim::{SimTarget, RAM_BASE_ADDRESS};
    use crate::Buffer;

    fn layout() -> MailboxLayout {
        MailboxLayout::default()
    }

    fn plan_fn(address: u32, length: usize, mode: RequestMode) -> Plan {
        plan(&layout(), 128, address, length, mode).unwrap()
    }

    #[test]
    fn block_mode_rounds_down() {
        let rounded = plan(&layout(), 64, RAM_BASE_ADDRESS, 130, RequestMode::RD_SYNC_BLOCK_INC);
        assert_eq!(128, rounded.unwrap().length);
        assert_eq!(
            130,
            plan_fn(RAM_BASE_ADDRESS, 130, RequestMode::RD_SYNC_BYTE_INC).length
        );
        assert_eq!(
            0,
            plan_fn(RAM_BASE_ADDRESS, 100, RequestMode::RD_SYNC_BLOCK_INC).length
        );
    }

    #[test]
    fn mailbox_write_targets_end_of_message() {
        let mailbox = plan_fn(MBOX_BASE_ADDRESS, 512, RequestMode::WR_SYNC_BYTE_INC);
        assert_eq!(MBOX_BASE_ADDRESS + 1536, mailbox.address);
        assert_eq!(AddressMode::Incremental, mailbox.address_mode);

        // Rounding happens before the adjustment.
        let mailbox = plan_fn(MBOX_BASE_ADDRESS + 0x800, 200, RequestMode::WR_ASYNC_BLOCK_INC);
        assert_eq!(128, mailbox.length);
        assert_eq!(0x1000 + 0x800 - 128, mailbox.address);
    }

    #[test]
    fn mailbox_read_is_not_adjusted() {
        let plan = plan_fn(MBOX_BASE_ADDRESS, 4, RequestMode::RD_SYNC_BYTE_FIX);
        assert_eq!(MBOX_BASE_ADDRESS, plan.address);
        assert_eq!(AddressMode::Fixed, plan.address_mode);
    }

    #[test]
    fn malformed_mode_never_reaches_the_bus() {
        let target = SimTarget::new();
        let layout = layout();
        let mut bounce = BounceBuffer::new(1024).unwrap();
        let mut encoder = Encoder::new(&target, &layout, 128, &mut bounce);
        let mode = RequestMode::RD_SYNC_BYTE_INC | RequestMode::WRITE;
        let mut buf = [0u8; 4];
        assert_eq!(
            Err(HifError::InvalidArgument(ArgumentError::Mode(mode))),
            encoder.perform(RAM_BASE_ADDRESS, &mut buf, mode)
        );
        assert!(target.transfers().is_empty());
    }

    #[test]
    fn misaligned_write_is_staged_unchanged() {
        let target = SimTarget::new();
        let layout = layout();
        let mut bounce = BounceBuffer::new(1024).unwrap();
        let mut encoder = Encoder::new(&target, &layout, 128, &mut bounce);

        let data: Vec<u8> = (0..=255).collect();
        let mut buffer = Buffer::with_headroom(1, &data);
        assert!(!target.is_dma_capable(&buffer));
        let written = encoder
            .perform(RAM_BASE_ADDRESS, &mut buffer, RequestMode::WR_SYNC_BYTE_INC)
            .unwrap();
        assert_eq!(256, written);

        let transfers = target.transfers();
        assert_eq!(1, transfers.len());
        assert!(transfers[0].dma_aligned);
        assert_eq!(data, transfers[0].data);
        assert_eq!(data, target.peek(RAM_BASE_ADDRESS, 256));
    }

    #[test]
    fn misaligned_read_is_copied_back() {
        let target = SimTarget::new();
        let contents: Vec<u8> = (0..64).map(|i| i * 3).collect();
        target.poke(RAM_BASE_ADDRESS + 8, &contents);
        let layout = layout();
        let mut bounce = BounceBuffer::new(1024).unwrap();
        let mut encoder = Encoder::new(&target, &layout, 128, &mut bounce);

        let mut buffer = Buffer::with_headroom(3, &[0xEE; 64]);
        encoder
            .perform(RAM_BASE_ADDRESS + 8, &mut buffer, RequestMode::RD_SYNC_BYTE_INC)
            .unwrap();
        assert_eq!(contents, &buffer[..]);
        assert!(target.transfers()[0].dma_aligned);
    }

    #[test]
    fn aligned_buffer_is_used_directly() {
        let target = SimTarget::new();
        let layout = layout();
        let mut bounce = BounceBuffer::new(4).unwrap();
        let mut encoder = Encoder::new(&target, &layout, 128, &mut bounce);

        // Larger than the bounce buffer, so it can only succeed without staging.
        let mut staging = BounceBuffer::new(64).unwrap();
        let buf = staging.as_bytes_mut();
        buf.fill(0x5A);
        assert_eq!(
            Ok(64),
            encoder.perform(RAM_BASE_ADDRESS, buf, RequestMode::WR_SYNC_BYTE_INC)
        );
        assert_eq!(vec![0x5A; 64], target.peek(RAM_BASE_ADDRESS, 64));
    }

    #[test]
    fn oversized_staging_is_rejected() {
        let target = SimTarget::new();
        let layout = layout();
        let mut bounce = BounceBuffer::new(16).unwrap();
        let mut encoder = Encoder::new(&target, &layout, 128, &mut bounce);
        let mut buffer = Buffer::with_headroom(1, &[0; 32]);
        assert_eq!(
            Err(HifError::InvalidArgument(ArgumentError::BounceOverflow {
                length: 32,
                capacity: 16
            })),
            encoder.perform(RAM_BASE_ADDRESS, &mut buffer, RequestMode::WR_SYNC_BYTE_INC)
        );
    }

    #[test]
    fn transport_failure_is_reported() {
        let target = SimTarget::new();
        target.fail_next(-110);
        let layout = layout();
        let mut bounce = BounceBuffer::new(16).unwrap();
        let mut encoder = Encoder::new(&target, &layout, 128, &mut bounce);
        let mut buf = [0u8; 4];
        assert!(matches!(
            encoder.perform(RAM_BASE_ADDRESS, &mut buf, RequestMode::RD_SYNC_BYTE_INC),
            Err(HifError::Transport(e)) if e.code == -110
        ));
    }

    #[test]
    fn fragments_are_gathered_and_scattered() {
        let target = SimTarget::new();
        let layout = layout();
        let mut bounce = BounceBuffer::new(64).unwrap();
        let mut encoder = Encoder::new(&target, &layout, 128, &mut bounce);

        let mut a = [1u8, 2, 3];
        let mut b = [4u8, 5];
        encoder
            .perform_gathered(
                RAM_BASE_ADDRESS,
                &mut [&mut a[..], &mut b[..]],
                RequestMode::WR_SYNC_BYTE_INC,
            )
            .unwrap();
        assert_eq!(vec![1, 2, 3, 4, 5], target.peek(RAM_BASE_ADDRESS, 5));

        let mut c = [0u8; 2];
        let mut d = [0u8; 3];
        encoder
            .perform_gathered(
                RAM_BASE_ADDRESS,
                &mut [&mut c[..], &mut d[..]],
                RequestMode::RD_SYNC_BYTE_INC,
            )
            .unwrap();
        assert_eq!([1, 2], c);
        assert_eq!([3, 4, 5], d);
    }
}
