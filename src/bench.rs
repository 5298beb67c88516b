//! Test bodies.
//!
//! The latency tests run as a closed loop on the coordinating context: one transaction at a time,
//! each timed individually and journaled, with the address window re-pointed only when the chunk
//! changes. The bandwidth tests hand the transactions to the worker chain and only time the run
//! as a whole. Start and end timestamps in the result always cover the entire loop, so
//! `(end - start) / r0` includes address lookups and window reprogramming on top of the journaled
//! per-transaction cost.
use crate::address::AddressTable;
use crate::chain::WorkerChain;
use crate::clock;
use crate::config::BenchConfig;
use crate::control::{TestFlags, TestKind, TestParams, TestResult};
use crate::error::{BenchError, Result};
use crate::journal::Journal;
use crate::transport::{Direction, DmaDescriptor, DmaQueue, Transport};
use std::sync::Arc;

/// Journals written during a test
#[derive(Clone)]
pub struct Journals {
    /// Per transaction timing samples
    pub test: Arc<Journal>,
    /// Address high/low words of each latency transaction
    pub debug: Arc<Journal>,
}

impl Journals {
    pub fn new(capacity: usize) -> Self {
        Journals {
            test: Arc::new(Journal::new(capacity)),
            debug: Arc::new(Journal::new(capacity)),
        }
    }

    pub fn reset(&self) {
        self.test.reset();
        self.debug.reset();
    }
}

/// Parameter sanity checks done before anything touches the transport
pub fn validate(kind: TestKind, params: &TestParams, cfg: &BenchConfig) -> Result<()> {
    let transfer = u64::from(params.transfer_size());
    let span = transfer + u64::from(params.host_offset());
    if span > u64::from(cfg.burst_boundary) || span > u64::from(params.window_size()) {
        return Err(BenchError::invalid_parameters(format!(
            "transfer {} + host offset {} must fit both {} and the {} byte window",
            params.transfer_size(),
            params.host_offset(),
            cfg.burst_boundary,
            params.window_size()
        )));
    }
    if kind.is_command() {
        if params.transfer_size() > cfg.max_cmd_size {
            return Err(BenchError::invalid_parameters(format!(
                "command transfer {} exceeds {}",
                params.transfer_size(),
                cfg.max_cmd_size
            )));
        }
    } else if transfer + u64::from(params.device_offset()) > cfg.device_buffer_size as u64 {
        return Err(BenchError::invalid_parameters(format!(
            "device offset {} + transfer {} exceeds the {} byte device buffer",
            params.device_offset(),
            params.transfer_size(),
            cfg.device_buffer_size
        )));
    }
    Ok(())
}

/// Number of transactions a test performs
pub fn transactions(cfg: &BenchConfig, kind: TestKind, flags: TestFlags) -> u32 {
    if flags.contains(TestFlags::LONG) {
        u32::try_from(cfg.journal_size).unwrap_or(u32::MAX)
    } else if kind.is_latency() {
        cfg.lat_transactions
    } else {
        cfg.bw_transactions
    }
}

/// `LatCmdRd`/`LatCmdWrRd`: time PCIe command reads, or writes followed by a read of the same
/// location. Writes carry a per-transaction pattern.
pub fn cmd_lat<T: Transport + ?Sized>(
    transport: &T,
    table: &AddressTable,
    journals: &Journals,
    kind: TestKind,
    params: &TestParams,
    transactions: u32,
) -> TestResult {
    let size = params.transfer_size() as usize;
    let mut w_data = vec![0u8; size];
    let mut r_data = vec![0u8; size];

    let mut entry = table.lookup(0);
    let mut mapped_chunk = entry.chunk_id();
    transport.map_window(entry.address());

    let mut result = TestResult::default();
    result.set_start(clock::now());

    for trans in 0..transactions {
        if kind == TestKind::LatCmdWrRd {
            let word = 0x0000_beef | (0xffff_u32.wrapping_sub(trans) << 16);
            for chunk in w_data.chunks_mut(4) {
                chunk.copy_from_slice(&word.to_le_bytes()[..chunk.len()]);
            }
        }

        let t0 = clock::now();
        match kind {
            TestKind::LatCmdRd => transport.read(entry.address(), &mut r_data),
            _ => {
                transport.write(entry.address(), &w_data);
                transport.read(entry.address(), &mut r_data);
            }
        }
        let t1 = clock::now();
        journals.test.append(clock::sample(t0, t1));
        journals.debug.append(entry.address_hi());
        journals.debug.append(entry.address_lo());

        entry = table.lookup(trans.wrapping_add(1));
        if entry.chunk_id() != mapped_chunk {
            transport.map_window(entry.address());
            mapped_chunk = entry.chunk_id();
        }
    }

    result.set_end(clock::now());
    result.r0 = transactions;
    result
}

/// `LatDmaRd`/`LatDmaWrRd`: like [`cmd_lat`] but through the DMA engines
pub fn dma_lat<T: Transport + ?Sized>(
    transport: &T,
    table: &AddressTable,
    journals: &Journals,
    kind: TestKind,
    params: &TestParams,
    transactions: u32,
) -> TestResult {
    let mut entry = table.lookup(0);
    let mut descriptor = DmaDescriptor {
        host_address: entry.address(),
        device_offset: params.device_offset(),
        length: params.transfer_size(),
        direction: Direction::FromHost,
    };

    let mut result = TestResult::default();
    result.set_start(clock::now());

    for trans in 0..transactions {
        descriptor.host_address = entry.address();

        let t0 = clock::now();
        if kind == TestKind::LatDmaWrRd {
            descriptor.direction = Direction::ToHost;
            transport.enqueue_dma(&descriptor, DmaQueue::High).wait();
        }
        descriptor.direction = Direction::FromHost;
        transport.enqueue_dma(&descriptor, DmaQueue::High).wait();
        let t1 = clock::now();

        journals.test.append(clock::sample(t0, t1));
        journals.debug.append(entry.address_hi());
        journals.debug.append(entry.address_lo());

        entry = table.lookup(trans.wrapping_add(1));
    }

    result.set_end(clock::now());
    result.r0 = transactions;
    result
}

/// `BwDmaRd`/`BwDmaWr`/`BwDmaRw`: fan `transactions` DMAs out over the worker chain
pub fn dma_bw(
    chain: &mut WorkerChain,
    kind: TestKind,
    params: &TestParams,
    table: Arc<AddressTable>,
    journal: Arc<Journal>,
    transactions: u32,
) -> TestResult {
    let mut result = TestResult::default();
    result.set_start(clock::now());
    chain.run(kind.id(), params, table, journal, transactions);
    result.set_end(clock::now());
    // late contexts finish their samples before the host gets to read the journal
    chain.quiesce();
    result.r0 = transactions;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BenchConfig {
        BenchConfig::default()
    }

    #[test]
    fn validates_sizes() {
        let ok = TestParams::new(TestFlags::empty(), 64, 8192, 0, 0);
        assert!(validate(TestKind::LatCmdRd, &ok, &cfg()).is_ok());

        let too_big_cmd = TestParams::new(TestFlags::empty(), 128, 8192, 0, 0);
        assert!(validate(TestKind::LatCmdRd, &too_big_cmd, &cfg()).is_err());
        assert!(validate(TestKind::LatDmaRd, &too_big_cmd, &cfg()).is_ok());

        let crosses = TestParams::new(TestFlags::empty(), 4000, 8192, 100, 0);
        assert!(validate(TestKind::BwDmaRd, &crosses, &cfg()).is_err());

        let small_window = TestParams::new(TestFlags::empty(), 64, 32, 0, 0);
        assert!(validate(TestKind::LatDmaRd, &small_window, &cfg()).is_err());

        let device_overflow = TestParams::new(TestFlags::empty(), 4096, 8192, 0, 4097);
        assert!(validate(TestKind::BwDmaWr, &device_overflow, &cfg()).is_err());
    }

    #[test]
    fn transaction_counts() {
        let cfg = cfg();
        assert_eq!(transactions(&cfg, TestKind::LatCmdRd, TestFlags::empty()), cfg.lat_transactions);
        assert_eq!(transactions(&cfg, TestKind::BwDmaRw, TestFlags::RANDOM), cfg.bw_transactions);
        assert_eq!(
            transactions(&cfg, TestKind::LatDmaRd, TestFlags::LONG),
            cfg.journal_size as u32
        );
    }
}
