use crate::address::AddressTable;
use crate::config::BenchConfig;
use crate::connect_contexts;
use crate::control::{ControlChannel, TestParams};
use crate::error::Result;
use crate::journal::Journal;
use crate::signal::{self, Mailbox, SignalTx};
use crate::transport::Transport;
use crate::worker::{BandwidthRun, Position, Signal, UnitRegisters, WorkerContext, forward};
use log::{debug, info};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Shape of the chain: `units` execution units with `contexts_per_unit` contexts each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainLayout {
    pub units: usize,
    pub contexts_per_unit: usize,
}

impl ChainLayout {
    pub fn from_config(cfg: &BenchConfig) -> Self {
        ChainLayout {
            units: cfg.units,
            contexts_per_unit: cfg.contexts_per_unit,
        }
    }

    /// The coordinator's well known position
    pub fn coordinator(&self) -> Position {
        Position { unit: 0, context: 0 }
    }

    /// Worker positions in start signal order
    pub fn workers(&self) -> impl Iterator<Item = Position> + '_ {
        (0..self.units)
            .flat_map(move |unit| (0..self.contexts_per_unit).map(move |context| Position { unit, context }))
            .skip(1)
    }

    pub fn len(&self) -> usize {
        self.units * self.contexts_per_unit - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Context 0 of every unit except the coordinator's loads that unit's registers
    pub fn is_loader(&self, position: Position) -> bool {
        position.context == 0 && position.unit != 0
    }
}

/// Worker contexts linked into a daisy chain, driven by the coordinator
pub struct WorkerChain {
    layout: ChainLayout,
    /// Edge from the coordinator to the first worker
    head: SignalTx<Signal>,
    handles: Vec<JoinHandle<()>>,
    units: Vec<Arc<UnitRegisters>>,
    done: Arc<Mailbox>,
    /// Runs started since the last [`WorkerChain::quiesce`]
    unsettled: Vec<Arc<BandwidthRun>>,
}

impl WorkerChain {
    /// Spawn one thread per worker context and link them up
    pub fn spawn<T: Transport>(
        cfg: &BenchConfig,
        control: Arc<ControlChannel>,
        transport: Arc<T>,
    ) -> Result<Self> {
        cfg.validate()?;
        let layout = ChainLayout::from_config(cfg);
        let units: Vec<Arc<UnitRegisters>> = (0..layout.units)
            .map(|_| Arc::new(UnitRegisters::default()))
            .collect();

        let cores = if cfg.pin_cores {
            core_affinity::get_core_ids().map_or(0, |ids| ids.len())
        } else {
            0
        };

        let mut contexts: Vec<WorkerContext<T>> = layout
            .workers()
            .map(|pos| {
                let slot = pos.unit * layout.contexts_per_unit + pos.context;
                WorkerContext::new(
                    pos,
                    layout.is_loader(pos),
                    units[pos.unit].clone(),
                    control.clone(),
                    transport.clone(),
                    (cores > 0).then(|| slot % cores),
                    cfg.boost_priority,
                )
            })
            .collect();

        let (head, first_rx) = signal::edge();
        contexts[0].set_receiver(first_rx);
        for idx in 1..contexts.len() {
            let (prev, next) = contexts.split_at_mut(idx);
            connect_contexts!(prev[idx - 1], next[0]);
        }

        let mut handles = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            handles.push(ctx.spawn()?);
        }
        info!(
            "Worker chain up: {} units x {} contexts, {} workers",
            layout.units,
            layout.contexts_per_unit,
            handles.len()
        );

        Ok(WorkerChain {
            layout,
            head,
            handles,
            units,
            done: Arc::new(Mailbox::new()),
            unsettled: Vec::new(),
        })
    }

    /// Run `transactions` DMAs across the chain and block until the last one completed.
    ///
    /// `test` and `params` are loaded into unit 0's registers; the loaders of the other units
    /// fetch them from the control channel.
    pub fn run(
        &mut self,
        test: i32,
        params: &TestParams,
        table: Arc<AddressTable>,
        journal: Arc<Journal>,
        transactions: u32,
    ) {
        self.units[0].load(test, params);

        let run = Arc::new(BandwidthRun::new(table, journal, transactions, self.done.clone()));
        self.unsettled.push(run.clone());
        debug!("Coordinator: starting chain with {} transactions", transactions);
        forward(&mut self.head, Signal::Start(run), "coordinator");

        // nobody will claim transaction 1 of an empty queue
        if transactions > 0 {
            self.done.wait();
        }
        debug!("Coordinator: chain reported completion");
    }

    pub fn layout(&self) -> ChainLayout {
        self.layout
    }

    pub fn units(&self) -> &[Arc<UnitRegisters>] {
        &self.units
    }

    /// The run most recently started, if it has not been quiesced yet
    pub fn last_run(&self) -> Option<&BandwidthRun> {
        self.unsettled.last().map(|run| &**run)
    }

    /// Wait until no context of any earlier run can still append to its journal.
    ///
    /// [`WorkerChain::run`] returns as soon as the last transaction has been claimed and
    /// performed, while other contexts may still be finishing the ones they claimed earlier.
    pub fn quiesce(&mut self) {
        for run in self.unsettled.drain(..) {
            run.settle();
            debug!("Coordinator: {} transactions retired", run.retired());
        }
    }

    /// Completion signals received over the chain's lifetime
    pub fn completions(&self) -> u64 {
        self.done.posted()
    }

    /// Send the stop signal down the chain and join all worker threads
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        forward(&mut self.head, Signal::Stop, "coordinator");
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Worker context panicked");
            }
        }
        self.unsettled.clear();
        info!("Worker chain stopped");
    }
}

impl Drop for WorkerChain {
    fn drop(&mut self) {
        self.shutdown();
    }
}
