//! Outbound notification queue
//!
//! One queue per session. Entries hold fully encoded PDUs and leave in FIFO
//! order. The queue pauses when the transport reports `WouldBlock` and
//! resumes on the drain signal. At most one indication is unconfirmed at a
//! time; everything behind it waits for the confirmation.

use crate::error::{GattError, GattResult};
use crate::transport::SendError;
use log::{debug, trace};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Notification or indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    Notification,
    Indication,
}

/// A queued value update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Characteristic value handle
    pub handle: u16,
    /// Notification or indication
    pub kind: OutboundKind,
    /// Encoded ATT PDU
    pub pdu: Vec<u8>,
}

/// The indication awaiting a Handle Value Confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingIndication {
    /// Characteristic value handle
    pub handle: u16,
    /// When the session is torn down if still unconfirmed
    pub deadline: Instant,
}

/// What a [`NotificationQueue::pump`] call achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// PDUs handed to the transport
    pub sent: usize,
    /// An indication went out and is now awaiting confirmation
    pub indication_sent: bool,
}

/// Per-session FIFO of outbound notifications and indications
#[derive(Debug)]
pub struct NotificationQueue {
    pending: VecDeque<Outbound>,
    capacity: usize,
    paused: bool,
    awaiting: Option<PendingIndication>,
}

impl NotificationQueue {
    /// Create a queue holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity,
            paused: false,
            awaiting: None,
        }
    }

    /// Append an entry
    pub fn enqueue(&mut self, outbound: Outbound) -> GattResult<()> {
        if self.pending.len() >= self.capacity {
            return Err(GattError::QueueFull);
        }
        self.pending.push_back(outbound);
        Ok(())
    }

    /// Hand queued PDUs to `send` until the queue is empty, paused, or
    /// blocked behind an unconfirmed indication.
    ///
    /// `SendError::Disconnected` is returned to the caller; the entry stays
    /// queued.
    pub fn pump<F>(&mut self, indication_timeout: Duration, mut send: F) -> GattResult<PumpReport>
    where
        F: FnMut(&[u8]) -> Result<(), SendError>,
    {
        let mut report = PumpReport::default();

        while !self.paused {
            let Some(front) = self.pending.front() else {
                break;
            };
            if front.kind == OutboundKind::Indication && self.awaiting.is_some() {
                break;
            }

            match send(&front.pdu) {
                Ok(()) => {}
                Err(SendError::WouldBlock) => {
                    debug!("Transport full, pausing queue");
                    self.paused = true;
                    break;
                }
                Err(err) => return Err(GattError::Transport(err)),
            }

            let Some(sent) = self.pending.pop_front() else {
                break;
            };
            trace!("Sent {:?} for handle {:#06x}", sent.kind, sent.handle);
            report.sent += 1;
            if sent.kind == OutboundKind::Indication {
                self.awaiting = Some(PendingIndication {
                    handle: sent.handle,
                    deadline: Instant::now() + indication_timeout,
                });
                report.indication_sent = true;
            }
        }

        Ok(report)
    }

    /// Transport has room again
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Whether the queue is waiting for the drain signal
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Release the outstanding indication. Returns false if none was outstanding.
    pub fn confirm(&mut self) -> bool {
        self.awaiting.take().is_some()
    }

    /// The unconfirmed indication, if any
    pub fn awaiting(&self) -> Option<PendingIndication> {
        self.awaiting
    }

    /// Deadline of the unconfirmed indication
    pub fn deadline(&self) -> Option<Instant> {
        self.awaiting.map(|pending| pending.deadline)
    }

    /// Fails with `IndicationTimeout` once the deadline has passed
    pub fn check_deadline(&self, now: Instant) -> GattResult<()> {
        match self.awaiting {
            Some(pending) if now >= pending.deadline => Err(GattError::IndicationTimeout),
            _ => Ok(()),
        }
    }

    /// Entries not yet sent
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting to be sent
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything, used on teardown
    pub fn clear(&mut self) {
        self.pending.clear();
        self.awaiting = None;
        self.paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(handle: u16, kind: OutboundKind) -> Outbound {
        Outbound {
            handle,
            kind,
            pdu: vec![0x1B, handle as u8, 0x00, 0xAB],
        }
    }

    #[test]
    fn test_notifications_drain_in_order() {
        let mut queue = NotificationQueue::new(8);
        for handle in 1..=3 {
            queue.enqueue(entry(handle, OutboundKind::Notification)).unwrap();
        }

        let mut sent = Vec::new();
        let report = queue
            .pump(Duration::from_secs(30), |pdu| {
                sent.push(pdu[1]);
                Ok(())
            })
            .unwrap();

        assert_eq!(report.sent, 3);
        assert_eq!(sent, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_would_block_pauses_until_resumed() {
        let mut queue = NotificationQueue::new(8);
        queue.enqueue(entry(1, OutboundKind::Notification)).unwrap();
        queue.enqueue(entry(2, OutboundKind::Notification)).unwrap();

        let report = queue
            .pump(Duration::from_secs(30), |_| Err(SendError::WouldBlock))
            .unwrap();
        assert_eq!(report.sent, 0);
        assert!(queue.is_paused());

        // Paused queue does not even try to send
        let report = queue
            .pump(Duration::from_secs(30), |_| panic!("sent while paused"))
            .unwrap();
        assert_eq!(report.sent, 0);

        queue.resume();
        let report = queue.pump(Duration::from_secs(30), |_| Ok(())).unwrap();
        assert_eq!(report.sent, 2);
    }

    #[test]
    fn test_one_indication_outstanding() {
        let mut queue = NotificationQueue::new(8);
        queue.enqueue(entry(1, OutboundKind::Indication)).unwrap();
        queue.enqueue(entry(2, OutboundKind::Indication)).unwrap();

        let report = queue.pump(Duration::from_secs(30), |_| Ok(())).unwrap();
        assert_eq!(report.sent, 1);
        assert!(report.indication_sent);
        assert_eq!(queue.awaiting().map(|p| p.handle), Some(1));

        // Nothing moves until the confirmation
        let report = queue.pump(Duration::from_secs(30), |_| Ok(())).unwrap();
        assert_eq!(report.sent, 0);

        assert!(queue.confirm());
        let report = queue.pump(Duration::from_secs(30), |_| Ok(())).unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(queue.awaiting().map(|p| p.handle), Some(2));

        // A stray confirmation is reported
        assert!(queue.confirm());
        assert!(!queue.confirm());
    }

    #[test]
    fn test_capacity_and_deadline() {
        let mut queue = NotificationQueue::new(1);
        queue.enqueue(entry(1, OutboundKind::Indication)).unwrap();
        assert_eq!(
            queue.enqueue(entry(2, OutboundKind::Notification)),
            Err(GattError::QueueFull)
        );

        queue.pump(Duration::from_millis(10), |_| Ok(())).unwrap();
        let deadline = queue.deadline().unwrap();
        assert!(queue.check_deadline(deadline - Duration::from_millis(5)).is_ok());
        assert_eq!(
            queue.check_deadline(deadline),
            Err(GattError::IndicationTimeout)
        );
    }
}
