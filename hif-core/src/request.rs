//! Request parameters as supplied by callers, and their decoding into a concrete transaction.

use crate::bus::AddressMode;
use crate::error::ArgumentError;
use bitvec::order::Lsb0;
use bitvec::view::BitView;
use std::fmt;
use std::ops::{BitOr, Deref, DerefMut};

/// Bitmask describing how a request is to be performed.
///
/// A well-formed mode has exactly one bit set in each of the direction, addressing,
/// granularity, and execution groups, plus the extended I/O command bit. The named combinations
/// (such as [`RequestMode::RD_SYNC_BYTE_INC`]) cover the common cases.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RequestMode(u32);

impl RequestMode {
    pub const READ: Self = Self(1 << Self::BIT_READ);
    pub const WRITE: Self = Self(1 << Self::BIT_WRITE);
    /// Single-byte command type. Never valid for requests handled here.
    pub const BASIC_IO: Self = Self(1 << Self::BIT_BASIC_IO);
    /// Multi-byte command type, required on every request.
    pub const EXTENDED_IO: Self = Self(1 << Self::BIT_EXTENDED_IO);
    pub const SYNCHRONOUS: Self = Self(1 << Self::BIT_SYNCHRONOUS);
    pub const ASYNCHRONOUS: Self = Self(1 << Self::BIT_ASYNCHRONOUS);
    pub const BYTE_BASIS: Self = Self(1 << Self::BIT_BYTE_BASIS);
    pub const BLOCK_BASIS: Self = Self(1 << Self::BIT_BLOCK_BASIS);
    pub const FIXED_ADDRESS: Self = Self(1 << Self::BIT_FIXED_ADDRESS);
    pub const INCREMENTAL_ADDRESS: Self = Self(1 << Self::BIT_INCREMENTAL_ADDRESS);

    const BIT_READ: usize = 0;
    const BIT_WRITE: usize = 1;
    const BIT_BASIC_IO: usize = 2;
    const BIT_EXTENDED_IO: usize = 3;
    const BIT_SYNCHRONOUS: usize = 4;
    const BIT_ASYNCHRONOUS: usize = 5;
    const BIT_BYTE_BASIS: usize = 6;
    const BIT_BLOCK_BASIS: usize = 7;
    const BIT_FIXED_ADDRESS: usize = 8;
    const BIT_INCREMENTAL_ADDRESS: usize = 9;

    pub const WR_SYNC_BLOCK_INC: Self = Self::combine(&[
        Self::WRITE,
        Self::EXTENDED_IO,
        Self::SYNCHRONOUS,
        Self::BLOCK_BASIS,
        Self::INCREMENTAL_ADDRESS,
    ]);
    pub const WR_ASYNC_BLOCK_INC: Self = Self::combine(&[
        Self::WRITE,
        Self::EXTENDED_IO,
        Self::ASYNCHRONOUS,
        Self::BLOCK_BASIS,
        Self::INCREMENTAL_ADDRESS,
    ]);
    pub const WR_SYNC_BYTE_INC: Self = Self::combine(&[
        Self::WRITE,
        Self::EXTENDED_IO,
        Self::SYNCHRONOUS,
        Self::BYTE_BASIS,
        Self::INCREMENTAL_ADDRESS,
    ]);
    pub const WR_ASYNC_BYTE_INC: Self = Self::combine(&[
        Self::WRITE,
        Self::EXTENDED_IO,
        Self::ASYNCHRONOUS,
        Self::BYTE_BASIS,
        Self::INCREMENTAL_ADDRESS,
    ]);
    pub const WR_SYNC_BYTE_FIX: Self = Self::combine(&[
        Self::WRITE,
        Self::EXTENDED_IO,
        Self::SYNCHRONOUS,
        Self::BYTE_BASIS,
        Self::FIXED_ADDRESS,
    ]);
    pub const RD_SYNC_BLOCK_INC: Self = Self::combine(&[
        Self::READ,
        Self::EXTENDED_IO,
        Self::SYNCHRONOUS,
        Self::BLOCK_BASIS,
        Self::INCREMENTAL_ADDRESS,
    ]);
    pub const RD_ASYNC_BLOCK_INC: Self = Self::combine(&[
        Self::READ,
        Self::EXTENDED_IO,
        Self::ASYNCHRONOUS,
        Self::BLOCK_BASIS,
        Self::INCREMENTAL_ADDRESS,
    ]);
    pub const RD_SYNC_BLOCK_FIX: Self = Self::combine(&[
        Self::READ,
        Self::EXTENDED_IO,
        Self::SYNCHRONOUS,
        Self::BLOCK_BASIS,
        Self::FIXED_ADDRESS,
    ]);
    pub const RD_ASYNC_BLOCK_FIX: Self = Self::combine(&[
        Self::READ,
        Self::EXTENDED_IO,
        Self::ASYNCHRONOUS,
        Self::BLOCK_BASIS,
        Self::FIXED_ADDRESS,
    ]);
    pub const RD_SYNC_BYTE_INC: Self = Self::combine(&[
        Self::READ,
        Self::EXTENDED_IO,
        Self::SYNCHRONOUS,
        Self::BYTE_BASIS,
        Self::INCREMENTAL_ADDRESS,
    ]);
    pub const RD_SYNC_BYTE_FIX: Self = Self::combine(&[
        Self::READ,
        Self::EXTENDED_IO,
        Self::SYNCHRONOUS,
        Self::BYTE_BASIS,
        Self::FIXED_ADDRESS,
    ]);

    const fn combine(parts: &[Self]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < parts.len() {
            bits |= parts[i].0;
            i += 1;
        }
        Self(bits)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `self` with the bits of `other` cleared.
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    fn bit(self, index: usize) -> bool {
        self.0.view_bits::<Lsb0>()[index]
    }

    /// Picks whichever of the two bits is set, failing if neither or both are.
    fn exactly_one<T>(self, (bit_a, a): (usize, T), (bit_b, b): (usize, T)) -> Option<T> {
        match (self.bit(bit_a), self.bit(bit_b)) {
            (true, false) => Some(a),
            (false, true) => Some(b),
            _ => None,
        }
    }

    pub fn direction(self) -> Option<Direction> {
        self.exactly_one(
            (Self::BIT_READ, Direction::Read),
            (Self::BIT_WRITE, Direction::Write),
        )
    }

    pub fn address_mode(self) -> Option<AddressMode> {
        self.exactly_one(
            (Self::BIT_FIXED_ADDRESS, AddressMode::Fixed),
            (Self::BIT_INCREMENTAL_ADDRESS, AddressMode::Incremental),
        )
    }

    pub fn granularity(self) -> Option<Granularity> {
        self.exactly_one(
            (Self::BIT_BYTE_BASIS, Granularity::Byte),
            (Self::BIT_BLOCK_BASIS, Granularity::Block),
        )
    }

    pub fn execution(self) -> Option<Execution> {
        self.exactly_one(
            (Self::BIT_SYNCHRONOUS, Execution::Synchronous),
            (Self::BIT_ASYNCHRONOUS, Execution::Asynchronous),
        )
    }

    /// Returns `true` if the extended (multi-byte) I/O command bit is set.
    pub fn is_extended_io(self) -> bool {
        self.bit(Self::BIT_EXTENDED_IO)
    }
}

impl BitOr for RequestMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Read => "READ",
            Direction::Write => "WRITE",
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Granularity {
    /// Length is rounded down to a whole number of bus blocks.
    Block,
    /// Length is used as given.
    Byte,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Execution {
    /// The submitter blocks until the request completes.
    Synchronous,
    /// Submission returns immediately; completion is reported through the device's callback.
    Asynchronous,
}

/// The bus-level shape of a request, decoded from a [`RequestMode`].
///
/// Execution mode is not part of a transaction: by the time a transaction is encoded, the request
/// has already been serialized through the dispatch thread.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Transaction {
    pub direction: Direction,
    pub address_mode: AddressMode,
    pub granularity: Granularity,
}

impl TryFrom<RequestMode> for Transaction {
    type Error = ArgumentError;

    fn try_from(mode: RequestMode) -> Result<Self, Self::Error> {
        if !mode.is_extended_io() {
            return Err(ArgumentError::Mode(mode));
        }
        let invalid = || ArgumentError::Mode(mode);
        Ok(Self {
            direction: mode.direction().ok_or_else(invalid)?,
            address_mode: mode.address_mode().ok_or_else(invalid)?,
            granularity: mode.granularity().ok_or_else(invalid)?,
        })
    }
}

/// Owned data buffer carried by a request from submission until completion.
///
/// The data may start some bytes into the backing storage (`headroom`), as it does for packets
/// whose header was stripped or that are built in place behind a header. Such buffers are
/// frequently not aligned the way a DMA engine needs, which is what the bounce buffer is for.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    storage: Vec<u8>,
    offset: usize,
}

impl Buffer {
    /// Create a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from(vec![0; len])
    }

    /// Create a buffer holding `data`, placed `headroom` bytes into its storage.
    pub fn with_headroom(headroom: usize, data: &[u8]) -> Self {
        let mut storage = Vec::with_capacity(headroom + data.len());
        storage.resize(headroom, 0);
        storage.extend_from_slice(data);
        Self {
            storage,
            offset: headroom,
        }
    }

    pub fn headroom(&self) -> usize {
        self.offset
    }

    /// Returns the data, dropping any headroom.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.storage.drain(..self.offset);
        self.storage
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(storage: Vec<u8>) -> Self {
        Self { storage, offset: 0 }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[self.offset..]
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..]
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("headroom", &self.offset)
            .finish_non_exhaustive()
    }
}

/// A read or write as handed to [`crate::Device::submit`].
#[derive(Debug)]
pub struct Request<C> {
    /// Target address on the coprocessor.
    pub address: u32,
    /// Source of a write, destination of a read.
    pub buffer: Buffer,
    /// Number of bytes to transfer. At most `buffer.len()`.
    pub length: usize,
    pub mode: RequestMode,
    /// Handed back to the completion callback of an asynchronous request.
    pub context: C,
}

impl<C> Request<C> {
    /// Create a request transferring the whole of `buffer`.
    pub fn new(address: u32, buffer: Buffer, mode: RequestMode, context: C) -> Self {
        Self {
            address,
            length: buffer.len(),
            buffer,
            mode,
            context,
        }
    }

    /// Transfer only the first `length` bytes of the buffer.
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }
}

impl Request<()> {
    /// Create a synchronous read of `length` bytes.
    pub fn read(address: u32, length: usize, mode: RequestMode) -> Self {
        Self::new(address, Buffer::zeroed(length), mode, ())
    }

    /// Create a write of `data`.
    pub fn write(address: u32, data: &[u8], mode: RequestMode) -> Self {
        Self::new(address, Buffer::from(data.to_vec()), mode, ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_modes_decode() {
        let tx = Transaction::try_from(RequestMode::WR_ASYNC_BLOCK_INC).unwrap();
        assert_eq!(Direction::Write, tx.direction);
        assert_eq!(AddressMode::Incremental, tx.address_mode);
        assert_eq!(Granularity::Block, tx.granularity);
        assert_eq!(
            Some(Execution::Asynchronous),
            RequestMode::WR_ASYNC_BLOCK_INC.execution()
        );

        let tx = Transaction::try_from(RequestMode::RD_SYNC_BYTE_FIX).unwrap();
        assert_eq!(Direction::Read, tx.direction);
        assert_eq!(AddressMode::Fixed, tx.address_mode);
        assert_eq!(Granularity::Byte, tx.granularity);
    }

    #[test]
    fn both_directions_is_invalid() {
        let mode = RequestMode::RD_SYNC_BYTE_INC | RequestMode::WRITE;
        assert_eq!(None, mode.direction());
        assert_eq!(Err(ArgumentError::Mode(mode)), Transaction::try_from(mode));
    }

    #[test]
    fn missing_group_is_invalid() {
        let no_granularity = RequestMode::RD_SYNC_BYTE_INC.without(RequestMode::BYTE_BASIS);
        assert!(Transaction::try_from(no_granularity).is_err());

        let no_address_mode =
            RequestMode::RD_SYNC_BYTE_INC.without(RequestMode::INCREMENTAL_ADDRESS);
        assert!(Transaction::try_from(no_address_mode).is_err());

        let no_execution = RequestMode::RD_SYNC_BYTE_INC.without(RequestMode::SYNCHRONOUS);
        assert_eq!(None, no_execution.execution());
        assert!(Transaction::try_from(no_execution).is_ok());
    }

    #[test]
    fn extended_io_is_required() {
        let mode = RequestMode::WR_SYNC_BYTE_INC.without(RequestMode::EXTENDED_IO);
        assert!(Transaction::try_from(mode).is_err());
        let mode = mode | RequestMode::BASIC_IO;
        assert!(Transaction::try_from(mode).is_err());
    }

    #[test]
    fn buffer_headroom_is_hidden() {
        let buffer = Buffer::with_headroom(3, &[1, 2, 3]);
        assert_eq!(&[1, 2, 3], &buffer[..]);
        assert_eq!(3, buffer.headroom());
        assert_eq!(vec![1, 2, 3], buffer.into_vec());
    }
}
