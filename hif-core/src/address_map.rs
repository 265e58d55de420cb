use crate::AddressRange;
use std::cmp::Ordering;
use thiserror::Error;

/// Map of non-overlapping 32-bit address ranges to values of type `T`.
///
/// Addresses outside every range are vacant.
#[derive(Debug, Clone)]
pub struct AddressMap<T> {
    ordered_ranges: Vec<(AddressRange, T)>,
}

impl<T> Default for AddressMap<T> {
    fn default() -> Self {
        Self {
            ordered_ranges: Vec::new(),
        }
    }
}

impl<T> AddressMap<T> {
    /// Returns the range containing `address` and the value it maps to, or `None` if `address`
    /// is vacant.
    pub fn lookup(&self, address: u32) -> Option<(AddressRange, &T)> {
        self.ordered_ranges
            .binary_search_by(|(range, _)| {
                if address < range.start() {
                    Ordering::Greater
                } else if address <= range.end() {
                    Ordering::Equal
                } else {
                    Ordering::Less
                }
            })
            .ok()
            .map(|index| {
                let (range, value) = &self.ordered_ranges[index];
                (*range, value)
            })
    }

    /// Iterate over the mapped ranges in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (AddressRange, &T)> {
        self.ordered_ranges.iter().map(|(range, value)| (*range, value))
    }

    pub fn len(&self) -> usize {
        self.ordered_ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_ranges.is_empty()
    }
}

impl<T> TryFrom<Vec<(AddressRange, T)>> for AddressMap<T> {
    type Error = AddressMapError;

    fn try_from(mut value: Vec<(AddressRange, T)>) -> Result<Self, Self::Error> {
        value.sort_by_key(|(range, _)| range.start());

        if value
            .windows(2)
            .any(|pair| pair[0].0.overlaps(pair[1].0))
        {
            return Err(AddressMapError::OverlappingAddressRanges);
        }

        Ok(Self {
            ordered_ranges: value,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressMapError {
    /// Attempt to add an address range that overlaps with a previously added address range.
    #[error("address range overlaps with previously added address range")]
    OverlappingAddressRanges,
}

#[macro_export]
macro_rules! addr_map {
    ($([$start:expr, $end:expr] => $value:expr,)*) => {
        $crate::address_map::AddressMap::try_from(vec![
            $(($crate::address_range![$start, $end], $value)),*
        ]).unwrap()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_range;

    #[test]
    fn lookup_finds_containing_range() {
        let map = addr_map! {
            [0x2000, 0x2FFF] => 'b',
            [0x0800, 0x0FFF] => 'a',
        };
        assert_eq!(Some((address_range![0x800, 0xFFF], &'a')), map.lookup(0x800));
        assert_eq!(Some((address_range![0x2000, 0x2FFF], &'b')), map.lookup(0x2FFF));
        assert_eq!(None, map.lookup(0x1000));
        assert_eq!(None, map.lookup(0));
    }

    #[test]
    fn overlap_is_rejected() {
        let result = AddressMap::try_from(vec![
            (address_range![0x0, 0x10], 1),
            (address_range![0x10, 0x20], 2),
        ]);
        assert_eq!(
            Some(AddressMapError::OverlappingAddressRanges),
            result.err()
        );
    }
}
