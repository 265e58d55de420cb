//! Host interconnect layer between a wireless network coprocessor and its host.
//!
//! Callers issue byte or block addressed reads and writes through a [`Device`]. Every request is
//! serialized through a single dispatch thread which owns the bus while it drains the submission
//! queue, so the underlying bus driver never sees more than one transaction at a time.

#[macro_use]
extern crate static_assertions;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod address_map;
pub mod address_range;
pub mod bounce;
pub mod bus;
pub mod completion;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod host;
pub mod interrupt;
pub mod mailbox;
pub mod pool;
pub mod queue;
pub mod request;
pub mod scatter;
pub mod sim;

/// Re-export of [`AddressRange`] for convenience.
pub use address_range::AddressRange;
pub use bus::{AddressMode, Bus, TransportError};
pub use completion::{HifCallbacks, Submitted};
pub use config::DeviceConfig;
pub use device::Device;
pub use error::{ArgumentError, HifError, SetupError, SubmitError};
pub use host::{DeviceHandlers, HostDriver};
pub use request::{Buffer, Request, RequestMode};

/// Buffer alignment ranging from no alignment (`1`) up to the largest power of two a `usize` can
/// hold.
// Maintains the invariant that self.0 is a power of two.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Alignment(usize);

impl Alignment {
    /// Byte alignment is equivalent to no alignment.
    pub const BYTE: Self = Self(1);

    /// Halfword alignment means the address is a multiple of 2 (`address & 0b1 == 0`).
    pub const HALFWORD: Self = Self(2);

    /// Word alignment means the address is a multiple of 4 (`address & 0b11 == 0`).
    ///
    /// This is what most host controllers expect of a buffer they hand to their DMA engine.
    pub const WORD: Self = Self(4);

    /// Doubleword alignment means the address is a multiple of 8 (`address & 0b111 == 0`).
    pub const DOUBLEWORD: Self = Self(8);

    /// Returns the alignment corresponding to the power of two passed in, or `None` if
    /// `power_of_two` is not a power of two.
    pub fn from_power_of_two(power_of_two: usize) -> Option<Self> {
        power_of_two.is_power_of_two().then_some(Self(power_of_two))
    }

    pub fn as_power_of_two(self) -> usize {
        self.0
    }

    /// Returns `true` if `address` is aligned to this alignment.
    pub fn is_aligned(self, address: usize) -> bool {
        address & (self.0 - 1) == 0
    }

    /// Returns `true` if the first byte of `buf` sits at an aligned address.
    pub fn is_aligned_ptr(self, buf: &[u8]) -> bool {
        self.is_aligned(buf.as_ptr() as usize)
    }
}

/// Lock `mutex`, recovering the guard if another thread panicked while holding it.
///
/// None of the state guarded in this crate can be left half-updated by a panic: every critical
/// section is a single push, pop, or field update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::Alignment;

    #[test]
    fn alignment_checks_low_bits() {
        assert!(Alignment::WORD.is_aligned(0x1000));
        assert!(!Alignment::WORD.is_aligned(0x1002));
        assert!(Alignment::HALFWORD.is_aligned(0x1002));
        assert!(Alignment::BYTE.is_aligned(0x1003));
        assert_eq!(None, Alignment::from_power_of_two(12));
        assert_eq!(Some(Alignment::DOUBLEWORD), Alignment::from_power_of_two(8));
    }

    #[test]
    fn pointer_alignment() {
        let words = [0u32; 4];
        // SAFETY: reinterpreting initialized `u32`s as bytes is always valid.
        let bytes = unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, 16) };
        assert!(Alignment::WORD.is_aligned_ptr(bytes));
        assert!(!Alignment::WORD.is_aligned_ptr(&bytes[1..]));
    }
}
