//! Run a PCIe latency or bandwidth benchmark against the simulated host memory and transport.
//!
//! ```text
//! pciebench lat-cmd-rd --window 8192 --size 64
//! pciebench bw-dma-rw --window 8388608 --size 512 --random --cache thrash
//! ```
use clap::{Parser, ValueEnum};
use log::info;
use pcie_bench_rs::dispatcher::TestDispatcher;
use pcie_bench_rs::host::{TestDriver, TestOutcome};
use pcie_bench_rs::sim::{SimHostMemory, SimTransport};
use pcie_bench_rs::{
    BenchConfig, ControlChannel, Result, TestFlags, TestKind, TestParams, format_size,
    format_size_fixed_int,
};
use std::sync::Arc;
use std::time::Duration;

// use faster/smaller `mimalloc` allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TestArg {
    LatCmdRd,
    LatCmdWrRd,
    LatDmaRd,
    LatDmaWrRd,
    BwDmaRd,
    BwDmaWr,
    BwDmaRw,
}

impl From<TestArg> for TestKind {
    fn from(arg: TestArg) -> Self {
        match arg {
            TestArg::LatCmdRd => TestKind::LatCmdRd,
            TestArg::LatCmdWrRd => TestKind::LatCmdWrRd,
            TestArg::LatDmaRd => TestKind::LatDmaRd,
            TestArg::LatDmaWrRd => TestKind::LatDmaWrRd,
            TestArg::BwDmaRd => TestKind::BwDmaRd,
            TestArg::BwDmaWr => TestKind::BwDmaWr,
            TestArg::BwDmaRw => TestKind::BwDmaRw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CacheArg {
    /// No cache preparation
    Cold,
    /// Device writes the window sequentially
    Warm,
    /// Device writes all host memory randomly
    Thrash,
    /// Host writes the window before starting
    HostWarm,
}

#[derive(Parser)]
#[command(name = "pciebench", about = "PCIe latency and bandwidth benchmarks", version)]
struct Cli {
    /// Benchmark to run
    #[arg(value_enum)]
    test: TestArg,

    /// Bytes of host memory exercised
    #[arg(short, long, default_value_t = 8192)]
    window: u32,

    /// Bytes per transaction
    #[arg(short, long, default_value_t = 64)]
    size: u32,

    /// Offset from the start of a host cache line
    #[arg(long, default_value_t = 0)]
    host_offset: u32,

    /// Offset into the device buffer
    #[arg(long, default_value_t = 0)]
    device_offset: u32,

    /// Pseudo-random instead of sequential addresses
    #[arg(short, long)]
    random: bool,

    #[arg(short, long, value_enum, default_value_t = CacheArg::Cold)]
    cache: CacheArg,

    /// Run a full journal worth of transactions
    #[arg(long)]
    long: bool,

    /// Transactions per test (overrides the defaults)
    #[arg(short = 'n', long)]
    transactions: Option<u32>,

    /// Journal entries (power of two)
    #[arg(long, default_value_t = 1 << 20)]
    journal: usize,

    /// Host memory in MiB
    #[arg(long, default_value_t = 64)]
    mem_mib: u64,

    /// Execution units in the worker chain
    #[arg(long, default_value_t = 2)]
    units: usize,

    /// Contexts per execution unit
    #[arg(long, default_value_t = 8)]
    contexts: usize,

    /// Don't pin worker contexts to cores or raise their priority
    #[arg(long)]
    no_pin: bool,

    /// Simulated DMA engine latency in nanoseconds
    #[arg(long)]
    dma_delay_ns: Option<u64>,

    /// Signal simulated DMA completions from a separate thread after this many nanoseconds
    #[arg(long)]
    async_completion_ns: Option<u64>,

    /// Print this many journal samples after the test
    #[arg(long, default_value_t = 0)]
    samples: usize,

    /// Give up waiting for the test after this many seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,
}

impl Cli {
    fn config(&self) -> BenchConfig {
        let mut cfg = BenchConfig {
            max_mem: self.mem_mib * 1024 * 1024,
            journal_size: self.journal,
            units: self.units,
            contexts_per_unit: self.contexts,
            pin_cores: !self.no_pin,
            boost_priority: !self.no_pin,
            ..BenchConfig::default()
        };
        cfg.addr_table_size = ((cfg.max_mem / 64) as usize).next_power_of_two();
        if let Some(n) = self.transactions {
            cfg.lat_transactions = n;
            cfg.bw_transactions = n;
        }
        cfg
    }

    fn flags(&self) -> TestFlags {
        let mut flags = TestFlags::empty();
        flags.set(TestFlags::RANDOM, self.random);
        flags.set(TestFlags::LONG, self.long);
        match self.cache {
            CacheArg::Cold => {}
            CacheArg::Warm => flags |= TestFlags::WARM,
            CacheArg::Thrash => flags |= TestFlags::THRASH,
            CacheArg::HostWarm => flags |= TestFlags::HOST_WARM,
        }
        flags
    }
}

fn report(outcome: &TestOutcome) {
    let params = &outcome.params;
    println!(
        "{:<10} {:>4} {:>7} HO={:<2} DO={:<2} WIN={} SZ={}",
        outcome.kind.name(),
        outcome.pattern_label(),
        outcome.cache_label(),
        params.host_offset(),
        params.device_offset(),
        format_size_fixed_int(u64::from(params.window_size())),
        params.transfer_size()
    );
    println!(
        "  {} transactions in {:.3} ms, {:.1} ns per transaction",
        outcome.transactions(),
        outcome.elapsed() as f64 / 1e6,
        outcome.avg_per_transaction()
    );
    if outcome.kind.is_bandwidth() {
        println!(
            "  {} moved, {:.3} Gb/s, {:.0} transactions/s",
            format_size(outcome.bytes() as f32),
            outcome.gbps(),
            outcome.rate()
        );
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = cli.config();
    cfg.validate()?;

    let memory = Arc::new(SimHostMemory::from_config(&cfg));
    let mut transport = SimTransport::new(memory.clone(), cfg.device_buffer_size);
    if let Some(ns) = cli.dma_delay_ns {
        transport = transport.with_dma_delay(Duration::from_nanos(ns));
    }
    if let Some(ns) = cli.async_completion_ns {
        transport = transport.with_async_completion(Duration::from_nanos(ns))?;
    }
    let transport = Arc::new(transport);
    let control = Arc::new(ControlChannel::new(cfg.num_chunks()));

    let dispatcher = TestDispatcher::new(cfg.clone(), control.clone(), transport.clone())?;
    let journals = dispatcher.journals();
    let device = dispatcher.spawn()?;

    let driver = TestDriver::new(control.clone(), memory, &cfg)
        .with_timeout(Duration::from_secs(cli.timeout));
    let kind = TestKind::from(cli.test);
    let params = TestParams::new(
        cli.flags(),
        cli.size,
        cli.window,
        cli.host_offset,
        cli.device_offset,
    );
    let outcome = driver.run_test(kind, params);

    control.shutdown();
    if device.join().is_err() {
        log::error!("Dispatcher thread panicked");
    }

    let outcome = outcome?;
    report(&outcome);
    if cli.samples > 0 {
        let count = cli.samples.min(outcome.transactions() as usize);
        let samples = journals.test.read(count);
        info!("First {} journal samples (ns): {:?}", samples.len(), samples);
    }
    Ok(())
}
