//! Point to point signalling between execution contexts.
//!
//! Three primitives are used by the orchestration code:
//! - [`edge`]: single producer, single consumer link with room for one pending message. Used for
//!   the start/stop ripple along the worker chain.
//! - [`Mailbox`]: many producers, one consumer counting doorbell. Used for completion fan-in to
//!   the coordinator.
//! - [`Completion`]: handle returned by the transport for an enqueued DMA.
use log::warn;
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Busy-poll iterations before a waiting context parks
const SPIN_LIMIT: u32 = 256;

#[derive(Default)]
struct Waker {
    thread: Mutex<Option<Thread>>,
}

impl Waker {
    fn register(&self) {
        let mut slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        let current = thread::current();
        if slot.as_ref().map(Thread::id) != Some(current.id()) {
            *slot = Some(current);
        }
    }

    fn wake(&self) {
        if let Some(thread) = self.thread.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            thread.unpark();
        }
    }
}

/// Sending half of an edge
pub struct SignalTx<T> {
    tx: Producer<T>,
    waker: Arc<Waker>,
}

/// Receiving half of an edge
pub struct SignalRx<T> {
    rx: Consumer<T>,
    waker: Arc<Waker>,
}

/// Create a one-slot edge between two contexts
pub fn edge<T>() -> (SignalTx<T>, SignalRx<T>) {
    let (tx, rx) = RingBuffer::new(1);
    let waker = Arc::new(Waker::default());
    (
        SignalTx {
            tx,
            waker: waker.clone(),
        },
        SignalRx { rx, waker },
    )
}

impl<T> SignalTx<T> {
    /// Deliver `msg` to the other end. Fails, returning the message, if the previous one has not
    /// been consumed yet.
    pub fn notify(&mut self, msg: T) -> Result<(), T> {
        match self.tx.push(msg) {
            Ok(()) => {
                self.waker.wake();
                Ok(())
            }
            Err(PushError::Full(msg)) => Err(msg),
        }
    }
}

impl<T> SignalRx<T> {
    /// Take a pending message without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.pop().ok()
    }

    /// Wait for the next message. Returns `None` once the sender is gone and nothing is pending.
    pub fn wait(&mut self) -> Option<T> {
        let mut spins = 0;
        loop {
            if let Ok(msg) = self.rx.pop() {
                return Some(msg);
            }
            if self.rx.is_abandoned() {
                return self.rx.pop().ok();
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }
            self.waker.register();
            // re-check after registering so a notify racing the registration is not lost
            if let Ok(msg) = self.rx.pop() {
                return Some(msg);
            }
            thread::park_timeout(Duration::from_millis(10));
        }
    }
}

/// Counting doorbell with any number of posters and a single waiter
#[derive(Debug, Default)]
pub struct Mailbox {
    pending: Mutex<u32>,
    ready: Condvar,
    posted: AtomicU64,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring the doorbell once
    pub fn post(&self) {
        self.posted.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending += 1;
        if *pending > 1 {
            warn!("Mailbox holds {} unconsumed signals", *pending);
        }
        self.ready.notify_one();
    }

    /// Block until a signal is pending and consume it
    pub fn wait(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while *pending == 0 {
            pending = self.ready.wait(pending).unwrap_or_else(PoisonError::into_inner);
        }
        *pending -= 1;
    }

    /// Like [`Mailbox::wait`] but gives up after `timeout`. Returns whether a signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while *pending == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            pending = self
                .ready
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *pending -= 1;
        true
    }

    /// Consume a pending signal if there is one
    pub fn try_take(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if *pending == 0 {
            return false;
        }
        *pending -= 1;
        true
    }

    /// Signals posted over the lifetime of the mailbox
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }
}

/// Completion handle of an asynchronous transport operation
#[must_use = "a DMA is only finished once its completion has been waited on"]
pub struct Completion(Option<Arc<Mailbox>>);

impl Completion {
    /// Already completed operation
    pub fn done() -> Self {
        Completion(None)
    }

    /// Operation completed later by posting to the returned mailbox
    pub fn pending() -> (Self, Arc<Mailbox>) {
        let mailbox = Arc::new(Mailbox::new());
        (Completion(Some(mailbox.clone())), mailbox)
    }

    /// Block until the operation finished
    pub fn wait(self) {
        if let Some(mailbox) = self.0 {
            mailbox.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_holds_one_message() {
        let (mut tx, mut rx) = edge::<u32>();
        assert!(tx.notify(1).is_ok());
        assert_eq!(tx.notify(2), Err(2));
        assert_eq!(rx.try_recv(), Some(1));
        assert_eq!(rx.try_recv(), None);
        assert!(tx.notify(3).is_ok());
        assert_eq!(rx.wait(), Some(3));
    }

    #[test]
    fn edge_wakes_parked_receiver() {
        let (mut tx, mut rx) = edge::<&'static str>();
        let handle = thread::spawn(move || rx.wait());
        thread::sleep(Duration::from_millis(20));
        tx.notify("start").unwrap();
        assert_eq!(handle.join().unwrap(), Some("start"));
    }

    #[test]
    fn edge_reports_abandoned_sender() {
        let (tx, mut rx) = edge::<u8>();
        drop(tx);
        assert_eq!(rx.wait(), None);
    }

    #[test]
    fn mailbox_counts_posts() {
        let mailbox = Arc::new(Mailbox::new());
        let poster = mailbox.clone();
        let handle = thread::spawn(move || poster.post());
        mailbox.wait();
        handle.join().unwrap();
        assert_eq!(mailbox.posted(), 1);
        assert!(!mailbox.try_take());
        assert!(!mailbox.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn completion_roundtrip() {
        Completion::done().wait();
        let (completion, mailbox) = Completion::pending();
        let handle = thread::spawn(move || mailbox.post());
        completion.wait();
        handle.join().unwrap();
    }
}
