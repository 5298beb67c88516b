//! # Worker context
//!
//! A worker context is one execution context of the bandwidth worker chain, run on a dedicated OS
//! thread. It sits in a loop waiting for a signal on its single input edge. On a start signal it
//! forwards the signal to the next context in the chain *before* doing any work of its own, then
//! claims transactions from the run's [`WorkQueue`] until it runs dry. Forwarding first bounds
//! the start-up ripple to the chain length no matter how long individual transfers take, and
//! keeps the ripple going even if the queue is already empty.
//!
//! Context 0 of every unit but the first is that unit's parameter loader: it copies the test id
//! and parameters from the control channel into the [`UnitRegisters`] shared by all contexts of
//! the unit before passing the start signal on. On unit 0 the coordinator does the loading.
use crate::address::AddressTable;
use crate::clock;
use crate::control::{ControlChannel, TestKind, TestParams};
use crate::format_size;
use crate::journal::Journal;
use crate::queue::WorkQueue;
use crate::signal::{Mailbox, SignalRx, SignalTx};
use crate::transport::{Direction, DmaDescriptor, DmaQueue, Transport};
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::thread;

/// Location of a context in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub unit: usize,
    pub context: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit{}.ctx{}", self.unit, self.context)
    }
}

/// Everything a bandwidth run shares between its contexts.
///
/// Each run carries its own [`WorkQueue`]: a context still busy with an earlier run only ever
/// drains that run's queue, never the one of the run being started.
pub struct BandwidthRun {
    pub table: Arc<AddressTable>,
    pub journal: Arc<Journal>,
    pub queue: WorkQueue,
    /// Coordinator doorbell, rung by whoever claims the last transaction
    pub done: Arc<Mailbox>,
    transactions: u32,
    /// Transactions whose sample is in the journal
    retired: AtomicU32,
    /// Rung once `retired` reaches `transactions`
    settled: Mailbox,
}

impl BandwidthRun {
    pub fn new(
        table: Arc<AddressTable>,
        journal: Arc<Journal>,
        transactions: u32,
        done: Arc<Mailbox>,
    ) -> Self {
        let queue = WorkQueue::new();
        queue.reset(transactions);
        BandwidthRun {
            table,
            journal,
            queue,
            done,
            transactions,
            retired: AtomicU32::new(0),
            settled: Mailbox::new(),
        }
    }

    pub fn transactions(&self) -> u32 {
        self.transactions
    }

    pub fn retired(&self) -> u32 {
        self.retired.load(Ordering::Acquire)
    }

    /// Count one journaled transaction, ringing `settled` for the final one
    fn retire(&self) {
        if self.retired.fetch_add(1, Ordering::AcqRel) + 1 == self.transactions {
            self.settled.post();
        }
    }

    /// Block until every transaction of the run has been journaled. Contexts that were still
    /// transferring when the last claimer reported completion have finished once this returns.
    pub fn settle(&self) {
        if self.transactions > 0 {
            self.settled.wait();
        }
    }
}

/// Message travelling along the chain
pub enum Signal {
    Start(Arc<BandwidthRun>),
    Stop,
}

/// Test parameters visible to all contexts of one unit
#[derive(Debug, Default)]
pub struct UnitRegisters {
    test: AtomicI32,
    flags: AtomicU32,
    transfer_size: AtomicU32,
    window_size: AtomicU32,
    host_offset: AtomicU32,
    device_offset: AtomicU32,
    starts: AtomicU64,
}

impl UnitRegisters {
    /// Copy a test id and its parameters in. Publication to the other contexts of the unit
    /// happens through the start signal that follows.
    pub fn load(&self, test: i32, params: &TestParams) {
        self.test.store(test, Ordering::Relaxed);
        self.flags.store(params.p0, Ordering::Relaxed);
        self.transfer_size.store(params.p1, Ordering::Relaxed);
        self.window_size.store(params.p2, Ordering::Relaxed);
        self.host_offset.store(params.p3, Ordering::Relaxed);
        self.device_offset.store(params.p4, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (i32, TestParams) {
        (
            self.test.load(Ordering::Relaxed),
            TestParams {
                p0: self.flags.load(Ordering::Relaxed),
                p1: self.transfer_size.load(Ordering::Relaxed),
                p2: self.window_size.load(Ordering::Relaxed),
                p3: self.host_offset.load(Ordering::Relaxed),
                p4: self.device_offset.load(Ordering::Relaxed),
            },
        )
    }

    /// Start signals received by contexts of this unit
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Acquire)
    }

    fn note_start(&self) {
        self.starts.fetch_add(1, Ordering::AcqRel);
    }
}

/// Push `msg` down an edge, waiting for the receiver to drain a previous message if needed
pub(crate) fn forward(tx: &mut SignalTx<Signal>, mut msg: Signal, from: &str) {
    let mut warned = false;
    while let Err(back) = tx.notify(msg) {
        if !warned {
            warn!("'{}': next context has not consumed its last signal yet", from);
            warned = true;
        }
        msg = back;
        thread::yield_now();
    }
}

/// A worker context with its chain edges
pub struct WorkerContext<T: Transport> {
    /// Receiving side of the edge from the previous context
    start_rx: Option<SignalRx<Signal>>,
    /// Sending side of the edge to the next context, `None` at the end of the chain
    next_tx: Option<SignalTx<Signal>>,
    /// Context name, used in naming OS thread
    name: String,
    position: Position,
    /// Loads the unit registers on start
    loader: bool,
    unit: Arc<UnitRegisters>,
    control: Arc<ControlChannel>,
    transport: Arc<T>,
    /// Optional CPU core to pin spawned thread to
    cpu_core: Option<usize>,
    boost_priority: bool,
}

impl<T: Transport> WorkerContext<T> {
    pub fn new(
        position: Position,
        loader: bool,
        unit: Arc<UnitRegisters>,
        control: Arc<ControlChannel>,
        transport: Arc<T>,
        cpu_core: Option<usize>,
        boost_priority: bool,
    ) -> Self {
        WorkerContext {
            start_rx: None,
            next_tx: None,
            name: position.to_string(),
            position,
            loader,
            unit,
            control,
            transport,
            cpu_core,
            boost_priority,
        }
    }

    /// Set input receiver edge
    pub fn set_receiver(&mut self, rx: SignalRx<Signal>) {
        self.start_rx = Some(rx);
    }

    /// Set output transmitter edge
    pub fn set_sender(&mut self, tx: SignalTx<Signal>) {
        self.next_tx = Some(tx);
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Spawn and start new OS thread with the context loop, returning handle to thread
    pub fn spawn(mut self) -> Result<thread::JoinHandle<()>, std::io::Error> {
        let Some(mut start_rx) = self.start_rx.take() else {
            error!(
                "No start edge connected to context '{}'! It would never run.",
                self.name
            );
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("context '{}' has no start edge", self.name),
            ));
        };
        if self.next_tx.is_none() {
            debug!("Context '{}' ends the chain", self.name);
        }

        thread::Builder::new().name(self.name.clone()).spawn(move || {
            if let Some(cpu_num) = self.cpu_core {
                let core_num = core_affinity::CoreId { id: cpu_num };
                if !core_affinity::set_for_current(core_num) {
                    warn!("Couldn't pin context '{}' to CPU core {} (NOTE: this is expected on macOS)", self.name, cpu_num);
                }
            }

            if self.boost_priority
                && thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max).is_err()
            {
                warn!("Couldn't set context '{}' to maximum thread priority", self.name);
            }

            info!("Context '{}' starting", self.name);

            // The only suspension point of a worker: its incoming edge
            while let Some(signal) = start_rx.wait() {
                let run = match signal {
                    Signal::Start(run) => run,
                    Signal::Stop => {
                        if let Some(tx) = self.next_tx.as_mut() {
                            forward(tx, Signal::Stop, &self.name);
                        }
                        break;
                    }
                };
                self.unit.note_start();

                if self.loader {
                    let (test, params) = self.control.registers();
                    self.unit.load(test, &params);
                    trace!("Context '{}' loaded test {} {:?}", self.name, test, params);
                }

                if let Some(tx) = self.next_tx.as_mut() {
                    forward(tx, Signal::Start(run.clone()), &self.name);
                }

                let (done, bytes) = self.transfer(&run);
                debug!(
                    "Context '{}' moved {} in {} transactions",
                    self.name,
                    format_size(bytes as f32),
                    done
                );
            }

            info!("Context '{}' stopping", self.name);
        })
    }

    /// Claim and perform DMAs until the queue is drained. Returns transactions and bytes moved.
    fn transfer(&self, run: &BandwidthRun) -> (u32, u64) {
        let (test, params) = self.unit.snapshot();
        let kind = TestKind::try_from(test).ok();
        let mut descriptor = DmaDescriptor {
            host_address: 0,
            device_offset: params.device_offset(),
            length: params.transfer_size(),
            direction: Direction::FromHost,
        };

        let mut done = 0;
        loop {
            let trans = run.queue.claim();
            if trans == 0 {
                break;
            }

            descriptor.host_address = run.table.lookup(trans).address();
            // mixed tests: odd transactions read, even ones write
            descriptor.direction = match kind {
                Some(TestKind::BwDmaRd) => Direction::FromHost,
                Some(TestKind::BwDmaWr) => Direction::ToHost,
                _ if trans & 1 == 1 => Direction::FromHost,
                _ => Direction::ToHost,
            };

            let t0 = clock::now();
            self.transport.enqueue_dma(&descriptor, DmaQueue::Low).wait();
            let t1 = clock::now();
            run.journal.append(clock::sample(t0, t1));
            run.retire();
            done += 1;

            if trans == 1 {
                trace!("Context '{}' finished the last transaction", self.name);
                run.done.post();
                break;
            }
        }
        (done, u64::from(done) * u64::from(params.transfer_size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchConfig;
    use std::time::{Duration, Instant};

    fn run(transactions: u32) -> Arc<BandwidthRun> {
        let table = Arc::new(AddressTable::new(&BenchConfig::default()));
        Arc::new(BandwidthRun::new(
            table,
            Arc::new(Journal::new(64)),
            transactions,
            Arc::new(Mailbox::new()),
        ))
    }

    #[test]
    fn run_owns_a_fresh_queue() {
        let first = run(3);
        let second = run(2);
        assert_eq!(first.queue.claim(), 3);
        assert_eq!(second.queue.claim(), 2);
        assert_eq!(first.queue.remaining(), 2);
        assert_eq!(second.queue.remaining(), 1);
    }

    #[test]
    fn settle_waits_for_the_final_retire() {
        let run = run(3);
        run.retire();
        run.retire();

        let late = run.clone();
        let retirer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            late.retire();
        });
        let started = Instant::now();
        run.settle();
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(run.retired(), 3);
        retirer.join().unwrap();
    }

    #[test]
    fn empty_run_is_already_settled() {
        let run = run(0);
        run.settle();
        assert_eq!(run.retired(), 0);
    }
}
