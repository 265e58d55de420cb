use std::collections::VecDeque;

/// Both directions of one simulated mailbox.
///
/// The host reads the receive FIFO a byte at a time (with fixed addressing, usually), and every
/// write to the mailbox window is one complete message.
#[derive(Debug, Default, Clone)]
pub struct MailboxFifo {
    rx: VecDeque<u8>,
    tx: Vec<Vec<u8>>,
}

impl MailboxFifo {
    /// Make `data` available to the host.
    pub fn push_rx(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    /// Returns `true` if the host has data waiting.
    pub fn has_rx(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Pop received bytes into `buf`. Once the FIFO runs dry, the rest of `buf` reads as zero.
    pub fn read(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.rx.pop_front().unwrap_or(0);
        }
    }

    /// Record a message written by the host.
    pub fn write(&mut self, message: &[u8]) {
        self.tx.push(message.to_vec());
    }

    /// Take every message written so far, oldest first.
    pub fn take_tx(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_drains_then_reads_zero() {
        let mut fifo = MailboxFifo::default();
        fifo.push_rx(&[7, 8]);
        assert!(fifo.has_rx());
        let mut buf = [0xFF; 3];
        fifo.read(&mut buf);
        assert_eq!([7, 8, 0], buf);
        assert!(!fifo.has_rx());
    }

    #[test]
    fn tx_keeps_message_boundaries() {
        let mut fifo = MailboxFifo::default();
        fifo.write(&[1]);
        fifo.write(&[2, 3]);
        assert_eq!(vec![vec![1], vec![2, 3]], fifo.take_tx());
        assert!(fifo.take_tx().is_empty());
    }
}
