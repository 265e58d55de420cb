use crate::AddressRange;

/// Byte-addressed target memory, zero initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    /// Create a new zero-initialized RAM that can hold `size` bytes.
    ///
    /// `size` must be at least one, and at most `1 << 32` (since it must be addressable by `u32`).
    /// If `size` does not satisfy these conditions, `None` is returned and nothing is allocated.
    pub fn new(size: usize) -> Option<Self> {
        if size == 0 || (usize::BITS > 32 && size > (1 << 32)) {
            None
        } else {
            Some(Self {
                data: vec![0; size],
            })
        }
    }

    /// Returns the size expressed in bytes. Guaranteed to be at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns the range of offsets covered, always starting at `0`.
    pub fn range(&self) -> AddressRange {
        AddressRange::new(0, (self.len() - 1) as u32)
            .unwrap_or_else(|_| unreachable!("RAM is never empty"))
    }

    /// Reads the bytes at `offset..offset + buf.len()` into `buf`.
    ///
    /// Bytes past the end of the RAM are left untouched in `buf`.
    pub fn read(&self, buf: &mut [u8], offset: u32) {
        let Some(available) = self.data.get(offset as usize..) else {
            return;
        };
        let size = buf.len().min(available.len());
        buf[..size].copy_from_slice(&available[..size]);
    }

    /// Writes `buf` to `offset..offset + buf.len()`.
    ///
    /// Bytes that would land past the end of the RAM are ignored.
    pub fn write(&mut self, offset: u32, buf: &[u8]) {
        let Some(available) = self.data.get_mut(offset as usize..) else {
            return;
        };
        let size = buf.len().min(available.len());
        available[..size].copy_from_slice(&buf[..size]);
    }

    /// Force RAM back to its reset state, which is all-zeros.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }
}
