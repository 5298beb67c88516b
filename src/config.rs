//! Benchmark sizing and topology.
//!
//! Defaults match the reference card setup: 64 MiB of host memory handed out in 4 MiB chunks,
//! 4 KiB bursts, a 1 Mi entry address table and a 16 Mi entry journal.
use crate::error::{BenchError, Result};

/// Total host memory exercised by the benchmarks
pub const DEFAULT_MAX_MEM: u64 = 64 * 1024 * 1024;
/// Host memory chunk size. Must be a power of two.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
/// Transfers may not straddle this alignment
pub const DEFAULT_BURST_BOUNDARY: u32 = 4096;
/// Largest single PCIe command transfer
pub const DEFAULT_MAX_CMD_SIZE: u32 = 64;
/// Device side DMA buffer
pub const DEFAULT_DEVICE_BUFFER_SIZE: usize = 8 * 1024;
/// Transactions per latency test
pub const DEFAULT_LAT_TRANSACTIONS: u32 = 2 * 1024 * 1024;
/// Transactions per bandwidth test
pub const DEFAULT_BW_TRANSACTIONS: u32 = 8 * 1024 * 1024;
/// Journal capacity in 32 bit samples
pub const DEFAULT_JOURNAL_SIZE: usize = 16 * 1024 * 1024;
/// Seed of the address generator
pub const DEFAULT_RANDOM_SEED: u64 = 0xdead_beef;
/// Redraws allowed per address table slot. One more rejected candidate fails the table setup.
pub const DEFAULT_ADDR_RETRY_LIMIT: u32 = 4096;

/// Static sizing of one benchmark instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub max_mem: u64,
    pub chunk_size: u64,
    pub burst_boundary: u32,
    pub max_cmd_size: u32,
    pub device_buffer_size: usize,
    /// Entries in the address table, power of two
    pub addr_table_size: usize,
    /// Entries per journal, power of two
    pub journal_size: usize,
    pub lat_transactions: u32,
    pub bw_transactions: u32,
    pub random_seed: u64,
    pub addr_retry_limit: u32,
    /// Execution units in the worker chain (unit 0 hosts the coordinator)
    pub units: usize,
    /// Contexts per execution unit
    pub contexts_per_unit: usize,
    /// Pin each worker context to a CPU core
    pub pin_cores: bool,
    /// Raise worker threads to maximum priority
    pub boost_priority: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            max_mem: DEFAULT_MAX_MEM,
            chunk_size: DEFAULT_CHUNK_SIZE,
            burst_boundary: DEFAULT_BURST_BOUNDARY,
            max_cmd_size: DEFAULT_MAX_CMD_SIZE,
            device_buffer_size: DEFAULT_DEVICE_BUFFER_SIZE,
            addr_table_size: (DEFAULT_MAX_MEM / 64) as usize,
            journal_size: DEFAULT_JOURNAL_SIZE,
            lat_transactions: DEFAULT_LAT_TRANSACTIONS,
            bw_transactions: DEFAULT_BW_TRANSACTIONS,
            random_seed: DEFAULT_RANDOM_SEED,
            addr_retry_limit: DEFAULT_ADDR_RETRY_LIMIT,
            units: 2,
            contexts_per_unit: 8,
            pin_cores: true,
            boost_priority: true,
        }
    }
}

impl BenchConfig {
    /// Number of host memory chunks
    pub fn num_chunks(&self) -> usize {
        (self.max_mem / self.chunk_size) as usize
    }

    /// Worker contexts in the chain, i.e. every position except the coordinator
    pub fn workers(&self) -> usize {
        self.units * self.contexts_per_unit - 1
    }

    /// Check the invariants the orchestration code relies on
    pub fn validate(&self) -> Result<()> {
        if !self.chunk_size.is_power_of_two() {
            return Err(BenchError::config(format!(
                "chunk size {:#x} is not a power of two",
                self.chunk_size
            )));
        }
        if self.max_mem < self.chunk_size || self.max_mem % self.chunk_size != 0 {
            return Err(BenchError::config(format!(
                "host memory {:#x} is not a whole number of {:#x} chunks",
                self.max_mem, self.chunk_size
            )));
        }
        // chunk ids are packed into one byte of the address entry
        if self.num_chunks() > 256 {
            return Err(BenchError::config(format!(
                "{} chunks do not fit an 8 bit chunk id",
                self.num_chunks()
            )));
        }
        if !self.burst_boundary.is_power_of_two() || u64::from(self.burst_boundary) > self.chunk_size {
            return Err(BenchError::config(format!(
                "burst boundary {} must be a power of two no larger than a chunk",
                self.burst_boundary
            )));
        }
        if !self.addr_table_size.is_power_of_two() {
            return Err(BenchError::config("address table size must be a power of two"));
        }
        if !self.journal_size.is_power_of_two() {
            return Err(BenchError::config("journal size must be a power of two"));
        }
        if self.units == 0 || self.contexts_per_unit == 0 || self.workers() == 0 {
            return Err(BenchError::config(
                "worker chain needs at least one context besides the coordinator",
            ));
        }
        if self.max_cmd_size == 0 || self.max_cmd_size % 4 != 0 {
            return Err(BenchError::config("command size must be a non-zero multiple of 4"));
        }
        if self.addr_retry_limit == 0 {
            return Err(BenchError::config("address retry limit must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_card_layout() {
        let cfg = BenchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_chunks(), 16);
        assert_eq!(cfg.addr_table_size, 1024 * 1024);
        assert_eq!(cfg.workers(), 15);
    }

    #[test]
    fn rejects_bad_geometry() {
        let cfg = BenchConfig {
            chunk_size: 3 * 1024 * 1024,
            ..BenchConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = BenchConfig {
            units: 1,
            contexts_per_unit: 1,
            ..BenchConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = BenchConfig {
            addr_table_size: 1000,
            ..BenchConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
