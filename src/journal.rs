//! Fixed capacity ring of 32 bit samples.
//!
//! Producers never block: the write cursor is a single atomic and each claimed slot is written by
//! exactly one producer. When more than `capacity` samples are appended the oldest are overwritten.
//! The host only reads the journal after the device reported completion.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct Journal {
    slots: Box<[AtomicU32]>,
    mask: u64,
    head: AtomicU64,
}

impl Journal {
    /// Create a journal of `capacity` samples. `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "journal capacity must be a power of two");
        Journal {
            slots: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
        }
    }

    /// Append a sample, overwriting the oldest one once the ring is full
    #[inline]
    pub fn append(&self, sample: u32) {
        let pos = self.head.fetch_add(1, Ordering::Relaxed);
        self.slots[(pos & self.mask) as usize].store(sample, Ordering::Relaxed);
    }

    /// Rewind the write cursor to slot 0
    pub fn reset(&self) {
        self.head.store(0, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Samples appended since the last reset, including overwritten ones
    pub fn appended(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Samples currently held
    pub fn len(&self) -> usize {
        self.appended().min(self.slots.len() as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.appended() == 0
    }

    /// Copy the first `count` slots, as the host sees the journal memory
    pub fn read(&self, count: usize) -> Vec<u32> {
        self.slots
            .iter()
            .take(count)
            .map(|s| s.load(Ordering::Acquire))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn appends_in_order() {
        let journal = Journal::new(8);
        for i in 0..5 {
            journal.append(i * 10);
        }
        assert_eq!(journal.len(), 5);
        assert_eq!(journal.read(5), vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn wraps_and_keeps_most_recent() {
        let journal = Journal::new(4);
        for i in 0..10 {
            journal.append(i);
        }
        assert_eq!(journal.appended(), 10);
        assert_eq!(journal.len(), 4);
        // slots hold 8, 9, 6, 7
        assert_eq!(journal.read(4), vec![8, 9, 6, 7]);
    }

    #[test]
    fn reset_rewinds() {
        let journal = Journal::new(4);
        journal.append(1);
        journal.append(2);
        journal.reset();
        assert!(journal.is_empty());
        journal.append(7);
        assert_eq!(journal.read(1), vec![7]);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let journal = Arc::new(Journal::new(1 << 14));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let journal = journal.clone();
                thread::spawn(move || {
                    for i in 0..1000 {
                        journal.append(t * 1000 + i + 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut samples = journal.read(4000);
        samples.sort_unstable();
        assert_eq!(samples, (1..=4000).collect::<Vec<u32>>());
    }
}
