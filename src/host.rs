//! # Host side
//!
//! [`HostMemoryProvider`] describes the DMA-able host memory handed to the device. [`TestDriver`]
//! is the controller end of the control channel: it checks a request, publishes the chunk table
//! and parameters, optionally primes the host buffer, starts the test and waits for the return
//! code. [`TestOutcome`] turns the result record into the figures the benchmark reports.
use crate::address::ChunkDescriptor;
use crate::config::BenchConfig;
use crate::control::{ControlChannel, TestFlags, TestKind, TestParams, TestResult};
use crate::error::{BenchError, Result};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// Host pages are primed and chunks must be aligned at this granularity
const PAGE_SIZE: usize = 4096;
/// A chunk must be reachable through one window mapping, which covers this many address bits
const WINDOW_APERTURE_SHIFT: u32 = 29;
/// Passes over the window when priming host caches
const HOST_WARM_PASSES: usize = 4;
const HOST_WARM_PATTERN: u32 = 0xf00d_0000;

/// DMA-able host memory made of equally sized, individually contiguous chunks
pub trait HostMemoryProvider: Send + Sync {
    /// Chunk descriptors with ids `0..n` in linear order
    fn chunks(&self) -> Vec<ChunkDescriptor>;

    fn chunk_size(&self) -> u64;

    /// Bytes of host memory behind all chunks
    fn total_size(&self) -> u64 {
        self.chunks().len() as u64 * self.chunk_size()
    }

    /// Read through the linear view of the buffer
    fn read_linear(&self, offset: u64, buf: &mut [u8]);

    /// Write through the linear view of the buffer
    fn write_linear(&self, offset: u64, data: &[u8]);
}

/// A finished test and its raw result record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestOutcome {
    pub kind: TestKind,
    pub params: TestParams,
    pub result: TestResult,
}

impl TestOutcome {
    /// Device ticks (ns) between the start and end timestamps
    pub fn elapsed(&self) -> u64 {
        self.result.elapsed()
    }

    pub fn transactions(&self) -> u32 {
        self.result.r0
    }

    /// Whole-loop time per transaction, lookups and window remaps included
    pub fn avg_per_transaction(&self) -> f64 {
        match self.transactions() {
            0 => 0.0,
            n => self.elapsed() as f64 / f64::from(n),
        }
    }

    /// Transactions counted for throughput. A read/write pair counts once.
    pub fn counted_transactions(&self) -> u64 {
        let trans = u64::from(self.transactions());
        if self.kind == TestKind::BwDmaRw { trans / 2 } else { trans }
    }

    /// Payload bytes moved
    pub fn bytes(&self) -> u64 {
        self.counted_transactions() * u64::from(self.params.transfer_size())
    }

    /// Throughput in Gb/s
    pub fn gbps(&self) -> f64 {
        match self.elapsed() {
            0 => 0.0,
            ns => 8.0 * self.bytes() as f64 / ns as f64,
        }
    }

    /// Transactions per second
    pub fn rate(&self) -> f64 {
        match self.elapsed() {
            0 => 0.0,
            ns => self.counted_transactions() as f64 / (ns as f64 / 1e9),
        }
    }

    /// Cache preparation label as printed in result tables
    pub fn cache_label(&self) -> &'static str {
        let flags = self.params.flags();
        if flags.contains(TestFlags::HOST_WARM) {
            "HWarm"
        } else if flags.contains(TestFlags::THRASH) {
            "DThrash"
        } else if flags.contains(TestFlags::WARM) {
            "DWarm"
        } else {
            "Cold"
        }
    }

    pub fn pattern_label(&self) -> &'static str {
        if self.params.flags().contains(TestFlags::RANDOM) {
            "Rand"
        } else {
            "Seq"
        }
    }
}

/// Controller end of the control channel
pub struct TestDriver<P: HostMemoryProvider> {
    control: Arc<ControlChannel>,
    provider: Arc<P>,
    max_cmd_size: u32,
    max_dma_size: u32,
    timeout: Option<Duration>,
}

impl<P: HostMemoryProvider> TestDriver<P> {
    pub fn new(control: Arc<ControlChannel>, provider: Arc<P>, cfg: &BenchConfig) -> Self {
        TestDriver {
            control,
            provider,
            max_cmd_size: cfg.max_cmd_size,
            max_dma_size: cfg.burst_boundary,
            timeout: None,
        }
    }

    /// Give up waiting for completion after `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Host side sanity checks on a request
    pub fn check(&self, kind: TestKind, params: &TestParams) -> Result<()> {
        let transfer = params.transfer_size();
        if transfer == 0 {
            return Err(BenchError::invalid_parameters("transfer size is zero"));
        }
        if kind.is_command() {
            if transfer % 4 != 0 || transfer > self.max_cmd_size {
                return Err(BenchError::invalid_parameters(format!(
                    "command transfers must be a multiple of 4 up to {}, got {}",
                    self.max_cmd_size, transfer
                )));
            }
        } else if transfer > self.max_dma_size {
            return Err(BenchError::invalid_parameters(format!(
                "DMA transfers are limited to {}, got {}",
                self.max_dma_size, transfer
            )));
        }
        if params.window_size() % 64 != 0 {
            return Err(BenchError::invalid_parameters(format!(
                "window size must be a multiple of 64, got {}",
                params.window_size()
            )));
        }
        if u64::from(params.window_size()) > self.provider.total_size() {
            return Err(BenchError::invalid_parameters(format!(
                "window {:#x} exceeds {:#x} bytes of host memory",
                params.window_size(),
                self.provider.total_size()
            )));
        }
        let Some(flags) = TestFlags::from_bits(params.p0) else {
            return Err(BenchError::invalid_parameters(format!(
                "illegal flags {:#010x} (valid {:#010x})",
                params.p0,
                TestFlags::all().bits()
            )));
        };
        if flags.intersection(TestFlags::CACHE).bits().count_ones() > 1 {
            return Err(BenchError::invalid_parameters(
                "only one cache related flag may be set",
            ));
        }
        Ok(())
    }

    /// Check the provider's chunks and write their bases to the chunk table
    pub fn publish_chunks(&self) -> Result<()> {
        let chunks = self.provider.chunks();
        let chunk_size = self.provider.chunk_size();
        debug!("Host memory: {} chunks of {:#x}", chunks.len(), chunk_size);

        for (idx, chunk) in chunks.iter().enumerate() {
            let start = chunk.base_address;
            let end = start + chunk_size - 1;
            debug!("chunk {}: {:#x}-{:#x}", chunk.chunk_id, start, end);
            if usize::from(chunk.chunk_id) != idx {
                return Err(BenchError::invalid_parameters(format!(
                    "chunk {} listed at position {}",
                    chunk.chunk_id, idx
                )));
            }
            if start & (PAGE_SIZE as u64 - 1) != 0 {
                return Err(BenchError::invalid_parameters(format!(
                    "start address {:#x} is not page aligned",
                    start
                )));
            }
            if start >> WINDOW_APERTURE_SHIFT != end >> WINDOW_APERTURE_SHIFT {
                return Err(BenchError::invalid_parameters(format!(
                    "chunk {:#x} can't be addressed with a single window",
                    start
                )));
            }
        }

        let bases: Vec<u64> = chunks.iter().map(|c| c.base_address).collect();
        self.control.set_chunk_table(&bases);
        Ok(())
    }

    /// Write the window a page at a time so it is resident in the host caches
    pub fn warm_host(&self, window: u32) {
        let num_pages = (window as usize).div_ceil(PAGE_SIZE);
        let mut page = vec![0u8; PAGE_SIZE];
        for line in page.chunks_exact_mut(64) {
            for (i, word) in line.chunks_exact_mut(4).enumerate() {
                word.copy_from_slice(&(HOST_WARM_PATTERN + i as u32).to_le_bytes());
            }
        }
        for _ in 0..HOST_WARM_PASSES {
            for idx in 0..num_pages {
                self.provider.write_linear((idx * PAGE_SIZE) as u64, &page);
            }
        }
    }

    /// Run one test end to end and return its result
    pub fn run_test(&self, kind: TestKind, params: TestParams) -> Result<TestOutcome> {
        self.check(kind, &params)?;
        debug!(
            "Test: {} p0={:#x} p1={} p2={} p3={} p4={}",
            kind.id(),
            params.p0,
            params.p1,
            params.p2,
            params.p3,
            params.p4
        );

        self.publish_chunks()?;
        self.control.set_params(params);
        if params.flags().contains(TestFlags::HOST_WARM) {
            self.warm_host(params.window_size());
        }

        let code = self.start_and_wait(kind.id())?;
        if code < 0 {
            return Err(BenchError::TestFailed {
                test: kind.id(),
                code,
            });
        }

        let outcome = TestOutcome {
            kind,
            params,
            result: self.control.result(),
        };
        info!(
            "Finished {}: ticks={} transactions={}",
            kind,
            outcome.elapsed(),
            outcome.transactions()
        );
        Ok(outcome)
    }

    /// Write a raw selector and wait for the return code, without any host side checks
    pub fn start_and_wait(&self, test: i32) -> Result<i32> {
        self.control.start(test);
        match self.timeout {
            Some(timeout) => self
                .control
                .wait_done_timeout(timeout)
                .ok_or(BenchError::Timeout {
                    test,
                    duration_ms: timeout.as_millis() as u64,
                }),
            None => Ok(self.control.wait_done()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHostMemory;

    const CHUNK: u64 = 64 * 1024;

    fn driver() -> TestDriver<SimHostMemory> {
        let cfg = BenchConfig {
            max_mem: 4 * CHUNK,
            chunk_size: CHUNK,
            ..BenchConfig::default()
        };
        TestDriver::new(
            Arc::new(ControlChannel::new(16)),
            Arc::new(SimHostMemory::from_config(&cfg)),
            &cfg,
        )
    }

    #[test]
    fn request_checks() {
        let driver = driver();
        let ok = TestParams::new(TestFlags::RANDOM, 64, 8192, 0, 0);
        assert!(driver.check(TestKind::LatCmdRd, &ok).is_ok());

        let odd = TestParams::new(TestFlags::empty(), 62, 8192, 0, 0);
        assert!(driver.check(TestKind::LatCmdWrRd, &odd).is_err());
        assert!(driver.check(TestKind::LatDmaRd, &odd).is_ok());

        let big = TestParams::new(TestFlags::empty(), 8192, 8192, 0, 0);
        assert!(driver.check(TestKind::BwDmaRd, &big).is_err());

        let window = TestParams::new(TestFlags::empty(), 64, 8000, 0, 0);
        assert!(driver.check(TestKind::BwDmaRd, &window).is_err());

        let beyond = TestParams::new(TestFlags::empty(), 64, 8 * CHUNK as u32, 0, 0);
        assert!(driver.check(TestKind::BwDmaRd, &beyond).is_err());

        let both = TestParams::new(TestFlags::WARM | TestFlags::HOST_WARM, 64, 8192, 0, 0);
        assert!(driver.check(TestKind::BwDmaRd, &both).is_err());

        let unknown = TestParams {
            p0: 1 << 5,
            ..ok
        };
        assert!(driver.check(TestKind::BwDmaRd, &unknown).is_err());
    }

    #[test]
    fn publishes_chunk_table() {
        let driver = driver();
        driver.publish_chunks().unwrap();
        let expected: Vec<u64> = driver.provider.chunks().iter().map(|c| c.base_address).collect();
        driver.control.start(TestKind::LatCmdRd.id());
        let cmd = driver.control.wait_for_command().unwrap();
        assert_eq!(cmd.chunk_table, expected);
    }

    #[test]
    fn host_warm_fills_pattern() {
        let driver = driver();
        driver.warm_host(100);
        let mut line = [0u8; 64];
        driver.provider.read_linear(4096 - 64, &mut line);
        assert_eq!(line[0..4], 0xf00d_0000u32.to_le_bytes());
        assert_eq!(line[60..64], 0xf00d_000fu32.to_le_bytes());
        let mut next = [0u8; 4];
        driver.provider.read_linear(4096, &mut next);
        assert_eq!(next, [0; 4]);
    }

    #[test]
    fn outcome_figures() {
        let mut result = TestResult::default();
        result.set_start(1_000);
        result.set_end(1_000 + 1_000_000);
        result.r0 = 1000;
        let outcome = TestOutcome {
            kind: TestKind::BwDmaRw,
            params: TestParams::new(TestFlags::THRASH, 1000, 8192, 0, 0),
            result,
        };
        assert_eq!(outcome.counted_transactions(), 500);
        assert_eq!(outcome.bytes(), 500_000);
        assert!((outcome.gbps() - 4.0).abs() < 1e-9);
        assert!((outcome.rate() - 500_000.0).abs() < 1e-6);
        assert!((outcome.avg_per_transaction() - 1000.0).abs() < 1e-9);
        assert_eq!(outcome.cache_label(), "DThrash");
        assert_eq!(outcome.pattern_label(), "Seq");
    }
}
