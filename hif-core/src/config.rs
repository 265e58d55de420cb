use crate::bus::Bus;
use crate::error::ArgumentError;
use crate::mailbox::{MailboxInfo, MailboxLayout, MAILBOX_COUNT, MBOX_BLOCK_SIZE};
use crate::scatter::ScatterInfo;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default number of request descriptors per device.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default size of the bounce buffer, which is also the largest staged transfer.
pub const DEFAULT_BOUNCE_SIZE: usize = 32 * 1024;

/// Static configuration of a [`crate::Device`], fixed when the device is created.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Number of request descriptors, so the number of requests that can be in flight at once.
    pub pool_capacity: usize,
    /// Bus block size in bytes. Block mode lengths are rounded down to a multiple of this.
    pub block_size: u32,
    /// Size of the bounce buffer in bytes.
    pub bounce_size: usize,
    pub mailboxes: MailboxLayout,
    /// Whether the scatter path may be set up through [`ConfigOption::ScatterSetup`].
    pub scatter_supported: bool,
    /// Largest number of requests executed per bus claim. Unbounded if `None`, in which case the
    /// bus is held until the queue runs empty.
    pub max_batch: Option<NonZeroUsize>,
    /// Name given to the dispatch thread.
    pub thread_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            block_size: MBOX_BLOCK_SIZE,
            bounce_size: DEFAULT_BOUNCE_SIZE,
            mailboxes: MailboxLayout::default(),
            scatter_supported: true,
            max_batch: None,
            thread_name: String::from("hif-dispatch"),
        }
    }
}

/// How the device expects interrupts to be processed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IrqProcessingMode {
    /// The DSR does all of its bus access synchronously.
    SyncOnly,
}

/// Configuration queries and settings accepted by [`crate::Device::configure`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConfigOption {
    MailboxBlockSizes,
    MailboxAddresses,
    IrqProcessingMode,
    /// Query scatter support, enabling the scatter path if it is available.
    ScatterSetup,
    OsDevice,
}

impl ConfigOption {
    /// Wire code of the option.
    pub fn code(self) -> u32 {
        match self {
            ConfigOption::MailboxBlockSizes => 1,
            ConfigOption::MailboxAddresses => 2,
            ConfigOption::IrqProcessingMode => 4,
            ConfigOption::ScatterSetup => 8,
            ConfigOption::OsDevice => 9,
        }
    }
}

impl TryFrom<u32> for ConfigOption {
    type Error = ArgumentError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => ConfigOption::MailboxBlockSizes,
            2 => ConfigOption::MailboxAddresses,
            4 => ConfigOption::IrqProcessingMode,
            8 => ConfigOption::ScatterSetup,
            9 => ConfigOption::OsDevice,
            // 3, 5 and 7 are handled a layer up, 6 is power management.
            _ => return Err(ArgumentError::UnsupportedOption(code)),
        })
    }
}

/// Answer to a [`ConfigOption`].
#[derive(Debug, Clone)]
pub enum ConfigValue {
    MailboxBlockSizes([u32; MAILBOX_COUNT]),
    MailboxAddresses(MailboxInfo),
    IrqProcessingMode(IrqProcessingMode),
    Scatter(ScatterInfo),
    /// The bus the device sits on.
    OsDevice(Arc<dyn Bus>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for option in [
            ConfigOption::MailboxBlockSizes,
            ConfigOption::MailboxAddresses,
            ConfigOption::IrqProcessingMode,
            ConfigOption::ScatterSetup,
            ConfigOption::OsDevice,
        ] {
            assert_eq!(Ok(option), ConfigOption::try_from(option.code()));
        }
    }

    #[test]
    fn unknown_codes_are_unsupported() {
        for code in [0, 3, 5, 6, 7, 10, 0xFFFF_FFFF] {
            assert_eq!(
                Err(ArgumentError::UnsupportedOption(code)),
                ConfigOption::try_from(code)
            );
        }
    }

    #[test]
    fn defaults() {
        let config = DeviceConfig::default();
        assert_eq!(64, config.pool_capacity);
        assert_eq!(128, config.block_size);
        assert_eq!(32 * 1024, config.bounce_size);
        assert_eq!([1, 128, 128, 128], config.mailboxes.block_sizes());
        assert!(config.max_batch.is_none());
    }
}
