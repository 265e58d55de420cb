//! In-process stand-in for the coprocessor at the other end of the bus.
//!
//! [`SimTarget`] implements [`Bus`] over a small memory map: the interrupt status register, the
//! four mailboxes (plus the extended window of mailbox 0) and a block of RAM. It keeps a log of
//! every transfer and can be told to fail or stall transfers, which is what the tests and the
//! soak runner drive the engine with.

pub mod mailbox;
pub mod ram;

use crate::address_map::{AddressMap, AddressMapError};
use crate::bus::{AddressMode, Bus, TransportError};
use crate::interrupt::HOST_INT_STATUS_ADDRESS;
use crate::mailbox::{MailboxId, MailboxLayout, MAILBOX_COUNT};
use crate::request::Direction;
use crate::{lock, AddressRange, Alignment};
use log::trace;
use mailbox::MailboxFifo;
use ram::Ram;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// First address of the target's RAM.
pub const RAM_BASE_ADDRESS: u32 = 0x0054_0000;

/// Size of the target's RAM in bytes.
pub const RAM_SIZE: usize = 0x4_0000;

/// Size of the register block starting at [`HOST_INT_STATUS_ADDRESS`].
const REGISTER_BLOCK_SIZE: usize = 0x400;

/// Status code of a transfer to an address nothing is mapped at.
pub const EIO: i32 = -5;
/// Status code of a mailbox write that doesn't end on the end-of-message address.
pub const EINVAL: i32 = -22;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Resource {
    Registers,
    Mailbox(MailboxId),
    Ram,
}

/// One transfer as seen by the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub direction: Direction,
    pub address: u32,
    pub address_mode: AddressMode,
    /// Data written, or returned by a read.
    pub data: Vec<u8>,
    /// The buffer handed to the bus met its DMA alignment.
    pub dma_aligned: bool,
    /// The bus was claimed while the transfer ran.
    pub claimed: bool,
}

#[derive(Debug)]
struct State {
    memory_map: AddressMap<Resource>,
    registers: Ram,
    mailboxes: [MailboxFifo; MAILBOX_COUNT],
    ram: Ram,
    transfers: Vec<Transfer>,
    fail_transfers: Vec<i32>,
    fail_claims: Vec<i32>,
}

#[derive(Debug, Default)]
struct Gate {
    closed: bool,
    /// Number of transfers currently stalled at the gate.
    held: usize,
}

/// Simulated coprocessor. See the [module documentation](self).
#[derive(Debug)]
pub struct SimTarget {
    layout: MailboxLayout,
    alignment: Alignment,
    state: Mutex<State>,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
    claimed: AtomicBool,
    claims: AtomicUsize,
    releases: AtomicUsize,
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTarget {
    /// Create a target with the default mailbox layout and word-aligned DMA.
    pub fn new() -> Self {
        Self::with_dma_alignment(Alignment::WORD)
    }

    pub fn with_dma_alignment(alignment: Alignment) -> Self {
        Self::with_layout(MailboxLayout::default(), alignment)
            .unwrap_or_else(|_| unreachable!("default mailbox layout fits the memory map"))
    }

    /// Create a target whose mailboxes sit where `layout` puts them.
    ///
    /// Fails if a mailbox window overlaps target RAM, the register block, or another window.
    pub fn with_layout(
        layout: MailboxLayout,
        alignment: Alignment,
    ) -> Result<Self, AddressMapError> {
        let mut regions = vec![
            (
                AddressRange::from_start_size(HOST_INT_STATUS_ADDRESS, REGISTER_BLOCK_SIZE as u32)
                    .unwrap_or_else(|_| unreachable!()),
                Resource::Registers,
            ),
            (
                AddressRange::from_start_size(RAM_BASE_ADDRESS, RAM_SIZE as u32)
                    .unwrap_or_else(|_| unreachable!()),
                Resource::Ram,
            ),
            (layout.extended_window(), Resource::Mailbox(MailboxId::MBOX0)),
        ];
        regions.extend(
            MailboxId::all().map(|mbox| (layout.window(mbox), Resource::Mailbox(mbox))),
        );

        let memory_map = AddressMap::try_from(regions)?;

        Ok(Self {
            layout,
            alignment,
            state: Mutex::new(State {
                memory_map,
                registers: Ram::new(REGISTER_BLOCK_SIZE).unwrap_or_else(|| unreachable!()),
                mailboxes: Default::default(),
                ram: Ram::new(RAM_SIZE).unwrap_or_else(|| unreachable!()),
                transfers: Vec::new(),
                fail_transfers: Vec::new(),
                fail_claims: Vec::new(),
            }),
            gate: Mutex::new(Gate::default()),
            gate_changed: Condvar::new(),
            claimed: AtomicBool::new(false),
            claims: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    /// Copy of the target RAM at `address..address + len`. Bytes outside the RAM read as zero.
    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        if let Some(offset) = address.checked_sub(RAM_BASE_ADDRESS) {
            lock(&self.state).ram.read(&mut buf, offset);
        }
        buf
    }

    /// Store `data` in target RAM without going through the bus.
    pub fn poke(&self, address: u32, data: &[u8]) {
        if let Some(offset) = address.checked_sub(RAM_BASE_ADDRESS) {
            lock(&self.state).ram.write(offset, data);
        }
    }

    /// Queue `data` for the host to read from mailbox `index`.
    pub fn push_rx(&self, index: usize, data: &[u8]) {
        lock(&self.state).mailboxes[index].push_rx(data);
    }

    /// Take every message the host wrote to mailbox `index`.
    pub fn take_tx(&self, index: usize) -> Vec<Vec<u8>> {
        lock(&self.state).mailboxes[index].take_tx()
    }

    /// Log of all transfers so far, oldest first.
    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.state).transfers.clone()
    }

    /// Make the next transfer fail with status `code`. Calls stack up, one per transfer.
    pub fn fail_next(&self, code: i32) {
        lock(&self.state).fail_transfers.push(code);
    }

    /// Make the next claim of the bus fail with status `code`.
    pub fn fail_next_claim(&self, code: i32) {
        lock(&self.state).fail_claims.push(code);
    }

    /// Number of successful claims so far.
    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    /// Number of releases so far.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Stall every transfer from now on until [`release_hold`](Self::release_hold) is called.
    pub fn hold(&self) {
        lock(&self.gate).closed = true;
    }

    /// Let stalled and future transfers through.
    pub fn release_hold(&self) {
        lock(&self.gate).closed = false;
        self.gate_changed.notify_all();
    }

    /// Wait until at least `count` transfers are stalled at the gate, or `timeout` passes.
    ///
    /// Returns `true` if the count was reached.
    pub fn wait_until_held(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = lock(&self.gate);
        while gate.held < count {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            gate = match self.gate_changed.wait_timeout(gate, remaining) {
                Ok((gate, _)) => gate,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn pass_gate(&self) {
        let mut gate = lock(&self.gate);
        if !gate.closed {
            return;
        }
        gate.held += 1;
        self.gate_changed.notify_all();
        while gate.closed {
            gate = match self.gate_changed.wait(gate) {
                Ok(gate) => gate,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        gate.held -= 1;
    }

    fn transfer(
        &self,
        direction: Direction,
        address: u32,
        buf: &mut [u8],
        address_mode: AddressMode,
        dma_aligned: bool,
    ) -> Result<(), TransportError> {
        self.pass_gate();
        let mut state = lock(&self.state);
        if !state.fail_transfers.is_empty() {
            return Err(TransportError::new(state.fail_transfers.remove(0)));
        }

        let (range, resource) = state
            .memory_map
            .lookup(address)
            .map(|(range, &resource)| (range, resource))
            .ok_or(TransportError::new(EIO))?;
        let len = match address_mode {
            AddressMode::Incremental => buf.len(),
            AddressMode::Fixed => buf.len().min(1),
        };
        if !range.contains_access(address, len) {
            return Err(TransportError::new(EIO));
        }
        let offset = address - range.start();
        trace!("Target {direction} of {} bytes at {address:#x}", buf.len());

        match (resource, direction) {
            (Resource::Registers, Direction::Read) => {
                state.registers.read(buf, offset);
                if offset == 0 {
                    if let Some(status) = buf.first_mut() {
                        *status = interrupt_status(&state.mailboxes);
                    }
                }
            }
            (Resource::Registers, Direction::Write) => state.registers.write(offset, buf),
            (Resource::Mailbox(mbox), Direction::Read) => {
                state.mailboxes[mbox.index()].read(buf)
            }
            (Resource::Mailbox(mbox), Direction::Write) => {
                if address_mode == AddressMode::Incremental && !ends_on_eom(range, address, buf) {
                    return Err(TransportError::new(EINVAL));
                }
                state.mailboxes[mbox.index()].write(buf)
            }
            (Resource::Ram, Direction::Read) => state.ram.read(buf, offset),
            (Resource::Ram, Direction::Write) => state.ram.write(offset, buf),
        }

        let claimed = self.claimed.load(Ordering::SeqCst);
        state.transfers.push(Transfer {
            direction,
            address,
            address_mode,
            data: buf.to_vec(),
            dma_aligned,
            claimed,
        });
        Ok(())
    }

    pub fn layout(&self) -> &MailboxLayout {
        &self.layout
    }
}

fn ends_on_eom(window: AddressRange, address: u32, buf: &[u8]) -> bool {
    u32::try_from(buf.len())
        .ok()
        .and_then(|len| address.checked_add(len))
        .map_or(false, |end| end == window.end().wrapping_add(1))
}

fn interrupt_status(mailboxes: &[MailboxFifo; MAILBOX_COUNT]) -> u8 {
    mailboxes
        .iter()
        .enumerate()
        .filter(|(_, fifo)| fifo.has_rx())
        .fold(0, |status, (index, _)| status | 1 << index)
}

impl Bus for SimTarget {
    fn claim(&self) -> Result<(), TransportError> {
        let failure = {
            let mut state = lock(&self.state);
            (!state.fail_claims.is_empty()).then(|| state.fail_claims.remove(0))
        };
        if let Some(code) = failure {
            return Err(TransportError::new(code));
        }
        self.claimed.store(true, Ordering::SeqCst);
        self.claims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<(), TransportError> {
        self.claimed.store(false, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, buf: &mut [u8], address: u32, mode: AddressMode) -> Result<(), TransportError> {
        let dma_aligned = self.is_dma_capable(buf);
        self.transfer(Direction::Read, address, buf, mode, dma_aligned)
    }

    fn write(&self, address: u32, buf: &[u8], mode: AddressMode) -> Result<(), TransportError> {
        let dma_aligned = self.is_dma_capable(buf);
        let mut data = buf.to_vec();
        self.transfer(Direction::Write, address, &mut data, mode, dma_aligned)
    }

    fn dma_alignment(&self) -> Alignment {
        self.alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MBOX_BASE_ADDRESS;
    use std::sync::Arc;
    use std::thread;

    fn layout_at(bases: [u32; MAILBOX_COUNT], extended: u32) -> MailboxLayout {
        let width = crate::mailbox::MBOX_WIDTH;
        MailboxLayout::new(
            bases.map(|base| crate::address_range!(base, base + width - 1)),
            MailboxLayout::default().block_sizes(),
            crate::address_range!(extended, extended + width - 1),
        )
        .unwrap()
    }

    #[test]
    fn mailboxes_may_not_shadow_other_resources() {
        let over_ram = layout_at([0x800, 0x1000, 0x1800, RAM_BASE_ADDRESS], 0x2800);
        assert!(matches!(
            SimTarget::with_layout(over_ram, Alignment::WORD),
            Err(AddressMapError::OverlappingAddressRanges)
        ));

        let over_registers = layout_at([0x800, 0x1000, 0x1800, 0x2000], HOST_INT_STATUS_ADDRESS);
        assert!(SimTarget::with_layout(over_registers, Alignment::WORD).is_err());

        let moved = layout_at([0x1_0000, 0x1_0800, 0x1_1000, 0x1_1800], 0x2_0000);
        let target = SimTarget::with_layout(moved, Alignment::WORD).unwrap();
        target
            .write(0x1_0800 + 0x7FE, &[5, 6], AddressMode::Incremental)
            .unwrap();
        assert_eq!(vec![vec![5, 6]], target.take_tx(1));
    }

    #[test]
    fn ram_round_trip_through_bus() {
        let target = SimTarget::new();
        target
            .write(RAM_BASE_ADDRESS + 4, &[1, 2, 3], AddressMode::Incremental)
            .unwrap();
        let mut buf = [0; 3];
        target
            .read(&mut buf, RAM_BASE_ADDRESS + 4, AddressMode::Incremental)
            .unwrap();
        assert_eq!([1, 2, 3], buf);
        assert_eq!(2, target.transfers().len());
    }

    #[test]
    fn unmapped_and_straddling_accesses_fail() {
        let target = SimTarget::new();
        let mut buf = [0; 4];
        assert_eq!(
            Err(TransportError::new(EIO)),
            target.read(&mut buf, 0x10, AddressMode::Incremental)
        );
        let last = RAM_BASE_ADDRESS + RAM_SIZE as u32 - 2;
        assert_eq!(
            Err(TransportError::new(EIO)),
            target.read(&mut buf, last, AddressMode::Incremental)
        );
    }

    #[test]
    fn mailbox_writes_must_end_on_eom() {
        let target = SimTarget::new();
        let end = MBOX_BASE_ADDRESS + 0x800;
        assert_eq!(
            Err(TransportError::new(EINVAL)),
            target.write(MBOX_BASE_ADDRESS, &[1, 2], AddressMode::Incremental)
        );
        target
            .write(end - 2, &[1, 2], AddressMode::Incremental)
            .unwrap();
        assert_eq!(vec![vec![1, 2]], target.take_tx(0));
    }

    #[test]
    fn extended_window_aliases_mailbox_zero() {
        let target = SimTarget::new();
        let window = target.layout().extended_window();
        target
            .write(window.end() - 3, &[9; 4], AddressMode::Incremental)
            .unwrap();
        assert_eq!(vec![vec![9; 4]], target.take_tx(0));
    }

    #[test]
    fn failures_are_injected_once() {
        let target = SimTarget::new();
        target.fail_next(-110);
        target.fail_next_claim(-16);
        let mut buf = [0; 1];
        assert_eq!(
            Err(TransportError::new(-110)),
            target.read(&mut buf, RAM_BASE_ADDRESS, AddressMode::Incremental)
        );
        assert!(target
            .read(&mut buf, RAM_BASE_ADDRESS, AddressMode::Incremental)
            .is_ok());
        assert_eq!(Err(TransportError::new(-16)), target.claim());
        assert_eq!(Ok(()), target.claim());
        assert_eq!(1, target.claims());
    }

    #[test]
    fn hold_stalls_transfers() {
        let target = Arc::new(SimTarget::new());
        target.hold();
        let writer = {
            let target = Arc::clone(&target);
            thread::spawn(move || target.write(RAM_BASE_ADDRESS, &[5], AddressMode::Incremental))
        };
        assert!(target.wait_until_held(1, Duration::from_secs(5)));
        assert!(target.transfers().is_empty());
        target.release_hold();
        assert_eq!(Ok(()), writer.join().unwrap());
        assert_eq!(vec![5], target.peek(RAM_BASE_ADDRESS, 1));
    }
}
