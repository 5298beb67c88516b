//! # Control channel
//!
//! The only state shared between the host and the device. The host writes the test parameters
//! and the chunk table, then writes a positive test selector to `command`. The device picks the
//! command up, runs the test, writes the result and finally stores the return code in `command`
//! (0 on success, negative on error). The host polls until `command <= 0`.
use crate::address::ChunkDescriptor;
use crate::clock;
use crate::error::BenchError;
use bitflags::bitflags;
use log::{debug, warn};
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Benchmarks understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TestKind {
    /// PCIe command read latency
    LatCmdRd = 1,
    /// PCIe command write followed by a read of the same location
    LatCmdWrRd = 2,
    /// DMA read latency
    LatDmaRd = 3,
    /// DMA write followed by a DMA read
    LatDmaWrRd = 4,
    /// DMA read bandwidth
    BwDmaRd = 5,
    /// DMA write bandwidth
    BwDmaWr = 6,
    /// Alternating DMA read/write bandwidth
    BwDmaRw = 7,
}

impl TestKind {
    pub const ALL: [TestKind; 7] = [
        TestKind::LatCmdRd,
        TestKind::LatCmdWrRd,
        TestKind::LatDmaRd,
        TestKind::LatDmaWrRd,
        TestKind::BwDmaRd,
        TestKind::BwDmaWr,
        TestKind::BwDmaRw,
    ];

    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn is_latency(self) -> bool {
        matches!(
            self,
            TestKind::LatCmdRd | TestKind::LatCmdWrRd | TestKind::LatDmaRd | TestKind::LatDmaWrRd
        )
    }

    pub fn is_bandwidth(self) -> bool {
        !self.is_latency()
    }

    /// Command path (as opposed to DMA) test
    pub fn is_command(self) -> bool {
        matches!(self, TestKind::LatCmdRd | TestKind::LatCmdWrRd)
    }

    pub fn name(self) -> &'static str {
        match self {
            TestKind::LatCmdRd => "LAT_CMD_RD",
            TestKind::LatCmdWrRd => "LAT_CMD_WRRD",
            TestKind::LatDmaRd => "LAT_DMA_RD",
            TestKind::LatDmaWrRd => "LAT_DMA_WRRD",
            TestKind::BwDmaRd => "BW_DMA_RD",
            TestKind::BwDmaWr => "BW_DMA_WR",
            TestKind::BwDmaRw => "BW_DMA_RW",
        }
    }
}

impl TryFrom<i32> for TestKind {
    type Error = BenchError;

    fn try_from(command: i32) -> Result<Self, Self::Error> {
        TestKind::ALL
            .into_iter()
            .find(|k| k.id() == command)
            .ok_or(BenchError::UnsupportedTest { command })
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Test modifiers carried in `p0`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TestFlags: u32 {
        /// Sequentially write the window before the test
        const WARM = 1 << 0;
        /// Randomly write all host memory before the test
        const THRASH = 1 << 1;
        /// Random instead of sequential addresses
        const RANDOM = 1 << 2;
        /// Run a full journal worth of transactions
        const LONG = 1 << 3;
        /// Host primes the window itself. Not interpreted by the device.
        const HOST_WARM = 1 << 31;
    }
}

impl TestFlags {
    /// Flags that select a cache preparation. At most one may be set.
    pub const CACHE: TestFlags = TestFlags::WARM.union(TestFlags::THRASH).union(TestFlags::HOST_WARM);
}

/// Raw test parameters. Meaning is shared by all tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TestParams {
    pub p0: u32,
    pub p1: u32,
    pub p2: u32,
    pub p3: u32,
    pub p4: u32,
}

impl TestParams {
    pub fn new(
        flags: TestFlags,
        transfer_size: u32,
        window_size: u32,
        host_offset: u32,
        device_offset: u32,
    ) -> Self {
        TestParams {
            p0: flags.bits(),
            p1: transfer_size,
            p2: window_size,
            p3: host_offset,
            p4: device_offset,
        }
    }

    pub fn flags(&self) -> TestFlags {
        TestFlags::from_bits_retain(self.p0)
    }

    pub fn transfer_size(&self) -> u32 {
        self.p1
    }

    pub fn window_size(&self) -> u32 {
        self.p2
    }

    /// Offset from the start of a host cache line
    pub fn host_offset(&self) -> u32 {
        self.p3
    }

    /// Offset into the device DMA buffer
    pub fn device_offset(&self) -> u32 {
        self.p4
    }
}

/// Result record. `r0` holds the number of transactions for every test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TestResult {
    pub start_hi: u32,
    pub start_lo: u32,
    pub end_hi: u32,
    pub end_lo: u32,
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
}

impl TestResult {
    pub fn set_start(&mut self, ts: u64) {
        (self.start_hi, self.start_lo) = clock::split(ts);
    }

    pub fn set_end(&mut self, ts: u64) {
        (self.end_hi, self.end_lo) = clock::split(ts);
    }

    pub fn start(&self) -> u64 {
        clock::join(self.start_hi, self.start_lo)
    }

    pub fn end(&self) -> u64 {
        clock::join(self.end_hi, self.end_lo)
    }

    /// Ticks between start and end timestamps
    pub fn elapsed(&self) -> u64 {
        self.end().saturating_sub(self.start())
    }
}

/// A command picked up by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command: i32,
    pub params: TestParams,
    pub chunk_table: Vec<u64>,
}

impl Command {
    /// Chunk descriptors for the chunk table, ids in table order
    pub fn chunks(&self) -> Vec<ChunkDescriptor> {
        self.chunk_table
            .iter()
            .enumerate()
            .map(|(idx, &base_address)| ChunkDescriptor {
                chunk_id: idx as u16,
                base_address,
            })
            .collect()
    }
}

struct Registers {
    command: i32,
    params: TestParams,
    result: TestResult,
    chunk_table: Vec<u64>,
    shutdown: bool,
}

/// Host/device shared control registers
pub struct ControlChannel {
    regs: Mutex<Registers>,
    changed: Condvar,
    max_chunks: usize,
}

impl ControlChannel {
    /// Create an idle channel with room for `max_chunks` chunk table entries
    pub fn new(max_chunks: usize) -> Self {
        ControlChannel {
            regs: Mutex::new(Registers {
                command: 0,
                params: TestParams::default(),
                result: TestResult::default(),
                chunk_table: Vec::new(),
                shutdown: false,
            }),
            changed: Condvar::new(),
            max_chunks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registers> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host: write the test parameters
    pub fn set_params(&self, params: TestParams) {
        self.lock().params = params;
    }

    /// Host: write the chunk base addresses. Entries beyond the table size are dropped.
    pub fn set_chunk_table(&self, bases: &[u64]) {
        if bases.len() > self.max_chunks {
            warn!(
                "Chunk table holds {} entries, dropping {}",
                self.max_chunks,
                bases.len() - self.max_chunks
            );
        }
        let mut regs = self.lock();
        regs.chunk_table.clear();
        regs.chunk_table
            .extend(bases.iter().take(self.max_chunks).copied());
    }

    /// Host: kick off test `test`. Parameters must be written first.
    pub fn start(&self, test: i32) {
        debug!("Control: start test {}", test);
        self.lock().command = test;
        self.changed.notify_all();
    }

    /// Current value of the command/status field
    pub fn command(&self) -> i32 {
        self.lock().command
    }

    /// Command field and parameters as one consistent snapshot
    pub fn registers(&self) -> (i32, TestParams) {
        let regs = self.lock();
        (regs.command, regs.params)
    }

    pub fn params(&self) -> TestParams {
        self.lock().params
    }

    pub fn result(&self) -> TestResult {
        self.lock().result
    }

    /// Host: block until the device reports completion, returning the code
    pub fn wait_done(&self) -> i32 {
        let mut regs = self.lock();
        while regs.command > 0 {
            regs = self.changed.wait(regs).unwrap_or_else(PoisonError::into_inner);
        }
        regs.command
    }

    /// Host: like [`ControlChannel::wait_done`], `None` if `timeout` expires first
    pub fn wait_done_timeout(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut regs = self.lock();
        while regs.command > 0 {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            regs = self
                .changed
                .wait_timeout(regs, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(regs.command)
    }

    /// Device: block until a positive command is present. `None` after [`ControlChannel::shutdown`].
    pub fn wait_for_command(&self) -> Option<Command> {
        let mut regs = self.lock();
        loop {
            if regs.shutdown {
                return None;
            }
            if regs.command > 0 {
                return Some(Command {
                    command: regs.command,
                    params: regs.params,
                    chunk_table: regs.chunk_table.clone(),
                });
            }
            regs = self.changed.wait(regs).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Device: publish the result, then the return code
    pub fn complete(&self, code: i32, result: TestResult) {
        let code = if code > 0 {
            warn!("Positive return code {} reported as success", code);
            0
        } else {
            code
        };
        let mut regs = self.lock();
        regs.result = result;
        regs.command = code;
        drop(regs);
        self.changed.notify_all();
    }

    /// Release a device blocked in [`ControlChannel::wait_for_command`]
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.changed.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_kind_selectors() {
        for kind in TestKind::ALL {
            assert_eq!(TestKind::try_from(kind.id()).unwrap(), kind);
        }
        assert!(matches!(
            TestKind::try_from(0),
            Err(BenchError::UnsupportedTest { command: 0 })
        ));
        assert!(TestKind::try_from(8).is_err());
        assert!(TestKind::LatDmaWrRd.is_latency());
        assert!(TestKind::BwDmaRw.is_bandwidth());
        assert!(TestKind::LatCmdWrRd.is_command());
        assert!(!TestKind::LatDmaRd.is_command());
    }

    #[test]
    fn params_accessors() {
        let p = TestParams::new(TestFlags::RANDOM | TestFlags::LONG, 64, 8192, 8, 16);
        assert_eq!(p.p0, 0b1100);
        assert!(p.flags().contains(TestFlags::RANDOM));
        assert_eq!(p.transfer_size(), 64);
        assert_eq!(p.window_size(), 8192);
        assert_eq!(p.host_offset(), 8);
        assert_eq!(p.device_offset(), 16);
        assert_eq!(std::mem::size_of::<TestParams>(), 20);
        assert_eq!(std::mem::size_of::<TestResult>(), 32);
    }

    #[test]
    fn result_timestamps() {
        let mut r = TestResult::default();
        r.set_start(0x1_0000_0010);
        r.set_end(0x1_0000_0110);
        assert_eq!(r.start_hi, 1);
        assert_eq!(r.start_lo, 0x10);
        assert_eq!(r.elapsed(), 0x100);
    }

    #[test]
    fn command_lifecycle() {
        let ctrl = Arc::new(ControlChannel::new(4));
        ctrl.set_params(TestParams::new(TestFlags::empty(), 64, 4096, 0, 0));
        ctrl.set_chunk_table(&[0x1000, 0x2000, 0x3000, 0x4000, 0x5000]);

        let device = {
            let ctrl = ctrl.clone();
            thread::spawn(move || {
                let cmd = ctrl.wait_for_command().unwrap();
                let mut result = TestResult::default();
                result.r0 = cmd.params.transfer_size();
                ctrl.complete(0, result);
                cmd
            })
        };

        ctrl.start(TestKind::LatDmaRd.id());
        assert_eq!(ctrl.wait_done(), 0);
        let cmd = device.join().unwrap();
        assert_eq!(cmd.command, 3);
        assert_eq!(cmd.chunk_table.len(), 4);
        assert_eq!(cmd.chunks()[3].chunk_id, 3);
        assert_eq!(cmd.chunks()[3].base_address, 0x4000);
        assert_eq!(ctrl.result().r0, 64);
    }

    #[test]
    fn shutdown_releases_device() {
        let ctrl = Arc::new(ControlChannel::new(1));
        let device = {
            let ctrl = ctrl.clone();
            thread::spawn(move || ctrl.wait_for_command())
        };
        ctrl.shutdown();
        assert!(device.join().unwrap().is_none());
    }

    #[test]
    fn wait_done_times_out_while_busy() {
        let ctrl = ControlChannel::new(1);
        ctrl.start(5);
        assert_eq!(ctrl.wait_done_timeout(Duration::from_millis(5)), None);
        ctrl.complete(-1, TestResult::default());
        assert_eq!(ctrl.wait_done_timeout(Duration::from_millis(5)), Some(-1));
    }
}
