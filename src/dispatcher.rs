use crate::address::{AddressTable, ChunkDescriptor};
use crate::bench::{self, Journals};
use crate::cache;
use crate::chain::WorkerChain;
use crate::config::BenchConfig;
use crate::control::{Command, ControlChannel, TestFlags, TestKind, TestParams, TestResult};
use crate::error::{BenchError, Result};
use crate::transport::Transport;
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::thread;

/// Where the dispatcher is in serving a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    WaitingForCommand,
    Dispatching,
    Running,
    Finalizing,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatcherState::WaitingForCommand => "waiting for command",
            DispatcherState::Dispatching => "dispatching",
            DispatcherState::Running => "running",
            DispatcherState::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

/// Device side command loop. Owns the address table, the journals and the worker chain, and
/// serves one test at a time from the control channel.
pub struct TestDispatcher<T: Transport> {
    cfg: BenchConfig,
    control: Arc<ControlChannel>,
    transport: Arc<T>,
    table: Arc<AddressTable>,
    journals: Journals,
    chain: WorkerChain,
    state: DispatcherState,
    served: u64,
}

impl<T: Transport> TestDispatcher<T> {
    /// Validate `cfg`, allocate the tables and bring up the worker chain
    pub fn new(cfg: BenchConfig, control: Arc<ControlChannel>, transport: Arc<T>) -> Result<Self> {
        cfg.validate()?;
        let chain = WorkerChain::spawn(&cfg, control.clone(), transport.clone())?;
        Ok(TestDispatcher {
            table: Arc::new(AddressTable::new(&cfg)),
            journals: Journals::new(cfg.journal_size),
            cfg,
            control,
            transport,
            chain,
            state: DispatcherState::WaitingForCommand,
            served: 0,
        })
    }

    /// Handles to the test and debug journals, for reading samples after completion
    pub fn journals(&self) -> Journals {
        self.journals.clone()
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Commands completed so far, failed ones included
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn chain(&self) -> &WorkerChain {
        &self.chain
    }

    /// Address table of the last test
    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    fn set_state(&mut self, state: DispatcherState) {
        debug!("Dispatcher: {} -> {}", self.state, state);
        self.state = state;
    }

    /// Wait for one command, run it and report the outcome. Returns `false` once the control
    /// channel has been shut down.
    pub fn serve_one(&mut self) -> bool {
        self.set_state(DispatcherState::WaitingForCommand);
        let Some(cmd) = self.control.wait_for_command() else {
            return false;
        };

        let (code, result) = match self.execute(&cmd) {
            Ok(result) => {
                info!(
                    "Test {} done: {} transactions in {} ticks",
                    cmd.command,
                    result.r0,
                    result.elapsed()
                );
                (0, result)
            }
            Err(err) => {
                warn!("Test {} aborted: {}", cmd.command, err);
                (err.code(), TestResult::default())
            }
        };

        self.set_state(DispatcherState::Finalizing);
        self.control.complete(code, result);
        self.served += 1;
        true
    }

    /// Serve commands until the control channel is shut down
    pub fn run(mut self) {
        info!("Dispatcher ready");
        while self.serve_one() {}
        info!("Dispatcher stopping after {} commands", self.served);
    }

    /// Run the command loop on a background thread
    pub fn spawn(self) -> Result<thread::JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn execute(&mut self, cmd: &Command) -> Result<TestResult> {
        let kind = TestKind::try_from(cmd.command)?;
        self.set_state(DispatcherState::Dispatching);

        let params = cmd.params;
        let flags = params.flags();
        debug!("Dispatching {} with {:?}", kind, params);
        bench::validate(kind, &params, &self.cfg)?;

        self.chain.quiesce();
        self.journals.reset();
        self.prepare_table(&cmd.chunks(), &params)?;

        if flags.contains(TestFlags::THRASH) {
            cache::thrash(&*self.transport, &self.table, self.cfg.max_mem, self.cfg.random_seed);
        }
        if flags.contains(TestFlags::WARM) {
            cache::warm(&*self.transport, &self.table, u64::from(params.window_size()));
        }

        let transactions = bench::transactions(&self.cfg, kind, flags);
        self.set_state(DispatcherState::Running);

        let result = match kind {
            TestKind::LatCmdRd | TestKind::LatCmdWrRd => bench::cmd_lat(
                &*self.transport,
                &self.table,
                &self.journals,
                kind,
                &params,
                transactions,
            ),
            TestKind::LatDmaRd | TestKind::LatDmaWrRd => bench::dma_lat(
                &*self.transport,
                &self.table,
                &self.journals,
                kind,
                &params,
                transactions,
            ),
            TestKind::BwDmaRd | TestKind::BwDmaWr | TestKind::BwDmaRw => bench::dma_bw(
                &mut self.chain,
                kind,
                &params,
                self.table.clone(),
                self.journals.test.clone(),
                transactions,
            ),
        };
        Ok(result)
    }

    /// Rebuild the address table in place, or in a fresh allocation if a straggling worker
    /// still holds the previous one
    fn prepare_table(&mut self, chunks: &[ChunkDescriptor], params: &TestParams) -> Result<()> {
        if Arc::get_mut(&mut self.table).is_none() {
            debug!("Address table still shared, allocating a new one");
            self.table = Arc::new(AddressTable::new(&self.cfg));
        }
        let Some(table) = Arc::get_mut(&mut self.table) else {
            return Err(BenchError::internal("address table is shared"));
        };
        table.set_chunks(chunks)?;
        table.init(
            params.window_size(),
            params.transfer_size(),
            params.host_offset(),
            params.flags(),
        )
    }
}
