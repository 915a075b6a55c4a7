//! # Latest-Value Mailbox
//!
//! Single-slot, overwrite-on-write handoff between the telemetry receiver
//! and the video frame thread.
//!
//! The slot holds an immutable [`Bytes`] copy of the last valid datagram.
//! The writer builds the copy before taking the lock and the reader only
//! bumps a reference count under it, so neither side ever holds the lock
//! while parsing or logging. A reader sees either nothing or exactly one
//! complete datagram.

use bytes::Bytes;
use std::sync::{Mutex, MutexGuard};

use super::packet::MAX_DATAGRAM_SIZE;

/// Shared latest-value slot
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<Bytes>>,
}

impl Mailbox {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current value
    ///
    /// Last write wins: the previous value is dropped whether or not it was
    /// ever read. Datagrams longer than [`MAX_DATAGRAM_SIZE`] are truncated.
    pub fn publish(&self, datagram: &[u8]) {
        let len = datagram.len().min(MAX_DATAGRAM_SIZE);
        let value = Bytes::copy_from_slice(&datagram[..len]);

        let previous = self.lock().replace(value);
        // Release the old buffer outside the lock
        drop(previous);
    }

    /// Copy of the current value, or `None` if nothing was ever published
    pub fn snapshot(&self) -> Option<Bytes> {
        self.lock().clone()
    }

    /// Whether a value has been published
    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    // The slot only ever holds a complete value, so a poisoned lock is safe
    // to recover.
    fn lock(&self) -> MutexGuard<'_, Option<Bytes>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_mailbox_is_empty() {
        let mailbox = Mailbox::new();
        assert!(mailbox.is_empty());
        assert!(mailbox.snapshot().is_none());
    }

    #[test]
    fn test_publish_then_snapshot() {
        let mailbox = Mailbox::new();
        mailbox.publish(b"ts,abcd");

        assert!(!mailbox.is_empty());
        assert_eq!(mailbox.snapshot().unwrap().as_ref(), b"ts,abcd");
    }

    #[test]
    fn test_last_write_wins() {
        let mailbox = Mailbox::new();
        mailbox.publish(b"first");
        mailbox.publish(b"second");
        mailbox.publish(b"third");

        assert_eq!(mailbox.snapshot().unwrap().as_ref(), b"third");
    }

    #[test]
    fn test_repeated_snapshot_returns_same_value() {
        let mailbox = Mailbox::new();
        mailbox.publish(b"only");

        let a = mailbox.snapshot().unwrap();
        let b = mailbox.snapshot().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_snapshot_is_detached_from_later_writes() {
        let mailbox = Mailbox::new();
        mailbox.publish(b"before");
        let snapshot = mailbox.snapshot().unwrap();

        mailbox.publish(b"after!");
        assert_eq!(snapshot.as_ref(), b"before");
    }

    #[test]
    fn test_publish_truncates_oversized_datagram() {
        let mailbox = Mailbox::new();
        mailbox.publish(&vec![7u8; MAX_DATAGRAM_SIZE + 100]);

        assert_eq!(mailbox.snapshot().unwrap().len(), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_concurrent_snapshots_are_never_torn() {
        const WRITES: usize = 20_000;
        const LEN: usize = 256;

        let mailbox = Arc::new(Mailbox::new());

        // Each published value is LEN copies of one byte; a torn read would
        // mix two different bytes.
        let writer = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || {
                for i in 0..WRITES {
                    mailbox.publish(&[(i % 251) as u8; LEN]);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mailbox = Arc::clone(&mailbox);
                thread::spawn(move || {
                    for _ in 0..WRITES {
                        if let Some(value) = mailbox.snapshot() {
                            assert_eq!(value.len(), LEN);
                            let first = value[0];
                            assert!(value.iter().all(|&b| b == first), "torn snapshot");
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(
            mailbox.snapshot().unwrap().as_ref(),
            &[((WRITES - 1) % 251) as u8; LEN][..]
        );
    }
}
