//! Layout of the coprocessor's hardware mailboxes.
//!
//! A mailbox is a fixed window of addresses the host writes messages into. The hardware drains a
//! mailbox from a fixed tail address, so a message must be placed such that its last byte lands
//! on the window's end-of-message (EOM) address, whatever its length.

use crate::address_map::{AddressMap, AddressMapError};
use crate::{address_range, AddressRange};

/// Number of mailboxes the coprocessor exposes.
pub const MAILBOX_COUNT: usize = 4;

/// First address of mailbox 0.
pub const MBOX_BASE_ADDRESS: u32 = 0x800;

/// Size in bytes of each mailbox window.
pub const MBOX_WIDTH: u32 = 0x800;

/// Default bus block size used for mailbox transfers in block mode.
pub const MBOX_BLOCK_SIZE: u32 = 128;

/// Extended window aliasing mailbox 0, used for large single transfers.
pub const MBOX0_EXTENDED_BASE_ADDRESS: u32 = 0x2800;
pub const MBOX0_EXTENDED_WIDTH: u32 = 18 * 1024;

const_assert!(MBOX_WIDTH as usize % MBOX_BLOCK_SIZE as usize == 0);

/// Identifies one of the [`MAILBOX_COUNT`] mailboxes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MailboxId(u8);

impl MailboxId {
    /// The mailbox carrying control traffic, and the one with an extended window.
    pub const MBOX0: Self = Self(0);

    /// Returns the id of mailbox `index`, or `None` if there is no such mailbox.
    pub fn new(index: usize) -> Option<Self> {
        (index < MAILBOX_COUNT).then_some(Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Iterate over all mailboxes in order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..MAILBOX_COUNT as u8).map(Self)
    }
}

/// Mailbox addresses as reported through the configuration interface.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MailboxInfo {
    /// Start address of every mailbox.
    pub addresses: [u32; MAILBOX_COUNT],
    /// Extended window for mailbox 0, as `(base, width)`.
    pub extended: (u32, u32),
}

/// Address windows and block sizes of the mailboxes.
#[derive(Debug, Clone)]
pub struct MailboxLayout {
    windows: AddressMap<MailboxId>,
    block_sizes: [u32; MAILBOX_COUNT],
    extended: AddressRange,
}

impl Default for MailboxLayout {
    fn default() -> Self {
        let windows = MailboxId::all()
            .map(|mbox| {
                let start = MBOX_BASE_ADDRESS + mbox.index() as u32 * MBOX_WIDTH;
                (address_range!(start, start + MBOX_WIDTH - 1), mbox)
            })
            .collect::<Vec<_>>();

        Self {
            windows: AddressMap::try_from(windows)
                .unwrap_or_else(|_| unreachable!("default mailbox windows are disjoint")),
            // Mailbox 0 carries byte-sized control traffic, the others full blocks.
            block_sizes: [1, MBOX_BLOCK_SIZE, MBOX_BLOCK_SIZE, MBOX_BLOCK_SIZE],
            extended: address_range!(
                MBOX0_EXTENDED_BASE_ADDRESS,
                MBOX0_EXTENDED_BASE_ADDRESS + MBOX0_EXTENDED_WIDTH - 1
            ),
        }
    }
}

impl MailboxLayout {
    /// Create a layout from one window per mailbox.
    ///
    /// Fails if any two windows overlap.
    pub fn new(
        windows: [AddressRange; MAILBOX_COUNT],
        block_sizes: [u32; MAILBOX_COUNT],
        extended: AddressRange,
    ) -> Result<Self, AddressMapError> {
        let windows = AddressMap::try_from(
            windows
                .into_iter()
                .zip(MailboxId::all())
                .collect::<Vec<_>>(),
        )?;
        Ok(Self {
            windows,
            block_sizes,
            extended,
        })
    }

    /// Returns the mailbox whose window contains `address`, together with that window.
    pub fn window_of(&self, address: u32) -> Option<(MailboxId, AddressRange)> {
        self.windows
            .lookup(address)
            .map(|(range, &mbox)| (mbox, range))
    }

    /// Returns the window of `mbox`.
    pub fn window(&self, mbox: MailboxId) -> AddressRange {
        self.windows
            .iter()
            .find_map(|(range, &id)| (id == mbox).then_some(range))
            .unwrap_or_else(|| unreachable!("every mailbox has a window"))
    }

    /// Width of the window containing `address`, or `None` outside every mailbox.
    pub fn width_at(&self, address: u32) -> Option<u32> {
        self.window_of(address).map(|(_, range)| range.delta() + 1)
    }

    /// Returns the address a write of `length` bytes to `address` must actually target, so that
    /// its last byte lands on the end-of-message address of the mailbox.
    ///
    /// Addresses outside every mailbox are returned unchanged. `length` must not exceed the width
    /// of the mailbox.
    pub fn eom_aligned(&self, address: u32, length: usize) -> u32 {
        match self.width_at(address) {
            Some(width) => {
                debug_assert!(length <= width as usize, "mailbox write exceeds mailbox width");
                address + width.saturating_sub(length as u32)
            }
            None => address,
        }
    }

    pub fn block_sizes(&self) -> [u32; MAILBOX_COUNT] {
        self.block_sizes
    }

    pub fn extended_window(&self) -> AddressRange {
        self.extended
    }

    pub fn info(&self) -> MailboxInfo {
        let mut addresses = [0; MAILBOX_COUNT];
        for mbox in MailboxId::all() {
            addresses[mbox.index()] = self.window(mbox).start();
        }
        MailboxInfo {
            addresses,
            extended: (self.extended.start(), self.extended.delta() + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_windows_are_contiguous() {
        let layout = MailboxLayout::default();
        let info = layout.info();
        assert_eq!([0x800, 0x1000, 0x1800, 0x2000], info.addresses);
        assert_eq!(
            Some((MailboxId::new(3).unwrap(), address_range![0x2000, 0x27FF])),
            layout.window_of(0x27FF)
        );
        assert_eq!(None, layout.window_of(0x2800));
        assert_eq!(None, layout.window_of(0x7FF));
    }

    #[test]
    fn write_lands_on_end_of_message() {
        let layout = MailboxLayout::default();
        let start = MBOX_BASE_ADDRESS;
        assert_eq!(start + 1536, layout.eom_aligned(start, 512));
        assert_eq!(start, layout.eom_aligned(start, MBOX_WIDTH as usize));
        assert_eq!(0x1000 + 0x800 - 1, layout.eom_aligned(0x1000, 1));
    }

    #[test]
    fn addresses_outside_mailboxes_are_untouched() {
        let layout = MailboxLayout::default();
        assert_eq!(0x400, layout.eom_aligned(0x400, 4));
        assert_eq!(0x0054_0000, layout.eom_aligned(0x0054_0000, 4096));
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        let window = address_range![0x800, 0xFFF];
        assert!(MailboxLayout::new(
            [window, window, address_range![0x1800, 0x1FFF], address_range![0x2000, 0x27FF]],
            [1; MAILBOX_COUNT],
            address_range![0x2800, 0x2FFF],
        )
        .is_err());
    }
}
