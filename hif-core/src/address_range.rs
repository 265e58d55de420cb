use std::fmt;
use std::fmt::{Display, Formatter};
use std::ops::RangeInclusive;
use thiserror::Error;

/// A non-empty window of the target's 32-bit address space, bounded inclusively below and above.
///
/// Enforces the invariant that `self.start() <= self.end()`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl Display for AddressRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}]", self.start, self.end)
    }
}

impl AddressRange {
    pub fn new(start: u32, end: u32) -> Result<Self, InvalidBoundsError> {
        (start <= end)
            .then_some(Self { start, end })
            .ok_or(InvalidBoundsError { start, end })
    }

    /// Create the range of `size` bytes starting at `start`.
    ///
    /// Fails if `size` is zero or the range would run past the end of the address space.
    pub fn from_start_size(start: u32, size: u32) -> Result<Self, InvalidBoundsError> {
        size.checked_sub(1)
            .and_then(|delta| start.checked_add(delta))
            .map(|end| Self { start, end })
            .ok_or(InvalidBoundsError {
                start,
                end: start.wrapping_add(size),
            })
    }

    pub fn start(self) -> u32 {
        self.start
    }

    pub fn end(self) -> u32 {
        self.end
    }

    /// Check if an address is contained within this address range.
    pub fn contains(self, address: u32) -> bool {
        self.start <= address && address <= self.end
    }

    /// Check if the `len` bytes starting at `address` all fall within this range.
    ///
    /// An empty access is contained if its `address` is.
    pub fn contains_access(self, address: u32, len: usize) -> bool {
        if !self.contains(address) {
            return false;
        }
        match len.checked_sub(1) {
            None => true,
            Some(delta) => {
                u32::try_from(delta).map_or(false, |delta| self.end - address >= delta)
            }
        }
    }

    /// Returns `self.end() - self.start()`, which is the size minus 1.
    pub fn delta(self) -> u32 {
        self.end - self.start
    }

    /// Returns the number of bytes covered, or `None` for the full 32-bit space on a target where
    /// that does not fit a `usize`.
    pub fn size(self) -> Option<usize> {
        usize::try_from(self.delta())
            .ok()
            .and_then(|n| n.checked_add(1))
    }

    /// Returns `true` if the two ranges share at least one address.
    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl TryFrom<RangeInclusive<u32>> for AddressRange {
    type Error = InvalidBoundsError;

    fn try_from(value: RangeInclusive<u32>) -> Result<Self, Self::Error> {
        Self::new(*value.start(), *value.end())
    }
}

impl From<AddressRange> for RangeInclusive<u32> {
    fn from(value: AddressRange) -> Self {
        value.start..=value.end
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bounds [{start:#x}, {end:#x}] do not form a valid 32-bit address range")]
pub struct InvalidBoundsError {
    start: u32,
    end: u32,
}

#[macro_export]
macro_rules! address_range {
    ($start:expr, $end:expr) => {
        $crate::address_range::AddressRange::new($start, $end).unwrap()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_bounds() {
        assert!(AddressRange::new(0x10, 0x0F).is_err());
        assert!(AddressRange::new(0x10, 0x10).is_ok());
    }

    #[test]
    fn start_size() {
        let range = AddressRange::from_start_size(0x800, 0x800).unwrap();
        assert_eq!(0xFFF, range.end());
        assert_eq!(Some(0x800), range.size());
        assert!(AddressRange::from_start_size(0x800, 0).is_err());
        assert!(AddressRange::from_start_size(u32::MAX, 2).is_err());
    }

    #[test]
    fn access_containment() {
        let range = address_range![0x800, 0xFFF];
        assert!(range.contains_access(0x800, 0x800));
        assert!(!range.contains_access(0x801, 0x800));
        assert!(range.contains_access(0xFFF, 0));
        assert!(!range.contains_access(0x7FF, 1));
    }
}
