//! Shared count of outstanding bandwidth transactions.
use std::sync::atomic::{AtomicU32, Ordering};

/// Remaining transactions, claimed by atomic test-and-decrement
#[derive(Debug, Default)]
pub struct WorkQueue {
    remaining: AtomicU32,
}

impl WorkQueue {
    pub fn new() -> Self {
        WorkQueue {
            remaining: AtomicU32::new(0),
        }
    }

    /// Set the number of transactions. Called by the coordinator before the start signal.
    pub fn reset(&self, transactions: u32) {
        self.remaining.store(transactions, Ordering::Release);
    }

    /// Claim one transaction.
    ///
    /// Returns the value before the decrement, which doubles as the transaction index. The
    /// counter saturates at 0, so a drained queue keeps returning 0. Exactly one caller ever sees
    /// `1`: that caller handled the last transaction and owns completion signalling.
    #[inline]
    pub fn claim(&self) -> u32 {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        {
            Ok(prev) => prev,
            Err(_) => 0,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }
}
