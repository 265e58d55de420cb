use crate::error::SetupError;
use crate::Alignment;
use std::fmt::{Debug, Formatter};

/// Word-aligned staging memory for transfers whose caller buffer the transport can't use directly.
///
/// Backed by `u32`s so the first byte is always word aligned, whatever the allocator returns for
/// byte buffers.
pub struct BounceBuffer {
    words: Box<[u32]>,
    /// Usable size in bytes. At most `words.len() * 4`.
    len: usize,
}

const_assert!(std::mem::align_of::<u32>() >= 4);

impl BounceBuffer {
    /// Allocate a zeroed bounce buffer of `size` bytes.
    ///
    /// Fails with [`SetupError::BounceAllocation`] if the memory can't be reserved.
    pub fn new(size: usize) -> Result<Self, SetupError> {
        let word_count = size.div_ceil(4);
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| SetupError::BounceAllocation(size))?;
        words.resize(word_count, 0);
        Ok(Self {
            words: words.into_boxed_slice(),
            len: size,
        })
    }

    /// Size in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn alignment(&self) -> Alignment {
        Alignment::WORD
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `words` holds `words.len() * 4 >= self.len` initialized bytes, and `u8` has no
        // alignment or validity requirements.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_bytes`; the borrow of `self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) }
    }

    /// Returns the first `len` bytes, or `None` if the buffer is smaller than that.
    pub fn staging(&mut self, len: usize) -> Option<&mut [u8]> {
        self.as_bytes_mut().get_mut(..len)
    }
}

impl Debug for BounceBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BounceBuffer")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_word_aligned() {
        let mut bounce = BounceBuffer::new(10).unwrap();
        assert_eq!(10, bounce.len());
        assert!(Alignment::WORD.is_aligned_ptr(bounce.as_bytes()));
        assert_eq!(10, bounce.as_bytes_mut().len());
    }

    #[test]
    fn staging_is_bounded() {
        let mut bounce = BounceBuffer::new(32 * 1024).unwrap();
        assert_eq!(Some(512), bounce.staging(512).map(|s| s.len()));
        assert!(bounce.staging(32 * 1024).is_some());
        assert!(bounce.staging(32 * 1024 + 1).is_none());
    }
}
