//! Software stand-ins for the host memory provider and the accelerator transport.
//!
//! [`SimHostMemory`] hands out chunks at descending, non-adjacent DMA addresses so that linear
//! to DMA address translation is actually exercised. [`SimTransport`] moves bytes between those
//! chunks and a device side buffer, and counts every access it sees. Command path accesses
//! outside the currently mapped window are counted as window faults.
use crate::address::ChunkDescriptor;
use crate::config::BenchConfig;
use crate::error::Result;
use crate::host::HostMemoryProvider;
use crate::signal::{Completion, Mailbox};
use crate::transport::{Direction, DmaDescriptor, DmaQueue, Transport};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// DMA address the simulated chunks are laid out below
pub const SIM_DMA_BASE: u64 = 0x0000_0040_0000_0000;

struct SimChunk {
    base: u64,
    data: Mutex<Box<[u8]>>,
}

impl SimChunk {
    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Host memory made of equally sized chunks
pub struct SimHostMemory {
    chunk_size: u64,
    chunks: Vec<SimChunk>,
}

impl SimHostMemory {
    /// `num_chunks` zeroed chunks of `chunk_size` bytes. Chunk 0 gets the highest address and
    /// every chunk is followed by an unmapped gap of the same size.
    pub fn new(num_chunks: usize, chunk_size: u64) -> Self {
        let chunks = (0..num_chunks)
            .map(|idx| SimChunk {
                base: SIM_DMA_BASE + (num_chunks - idx) as u64 * 2 * chunk_size,
                data: Mutex::new(vec![0u8; chunk_size as usize].into_boxed_slice()),
            })
            .collect();
        SimHostMemory { chunk_size, chunks }
    }

    pub fn from_config(cfg: &BenchConfig) -> Self {
        Self::new(cfg.num_chunks(), cfg.chunk_size)
    }

    /// Chunk index and offset of a DMA address range, if it lies within one chunk
    fn locate(&self, address: u64, len: usize) -> Option<(usize, usize)> {
        self.chunks.iter().enumerate().find_map(|(idx, chunk)| {
            let offset = address.checked_sub(chunk.base)?;
            (offset < self.chunk_size && offset + len as u64 <= self.chunk_size)
                .then_some((idx, offset as usize))
        })
    }

    /// Base address of the chunk containing `address`
    pub fn chunk_base_of(&self, address: u64) -> Option<u64> {
        self.locate(address, 0).map(|(idx, _)| self.chunks[idx].base)
    }

    /// Copy host memory at DMA address `address` into `buf`. `false` if the range is unmapped.
    pub fn read_dma(&self, address: u64, buf: &mut [u8]) -> bool {
        match self.locate(address, buf.len()) {
            Some((idx, offset)) => {
                let data = self.chunks[idx].lock();
                buf.copy_from_slice(&data[offset..offset + buf.len()]);
                true
            }
            None => false,
        }
    }

    /// Copy `data` into host memory at DMA address `address`. `false` if the range is unmapped.
    pub fn write_dma(&self, address: u64, data: &[u8]) -> bool {
        match self.locate(address, data.len()) {
            Some((idx, offset)) => {
                let mut chunk = self.chunks[idx].lock();
                chunk[offset..offset + data.len()].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Walk `len` bytes starting at linear `offset`, chunk by chunk
    fn for_each_linear(&self, offset: u64, len: usize, mut f: impl FnMut(&mut [u8], usize)) {
        let mut done = 0;
        while done < len {
            let linear = offset + done as u64;
            let idx = (linear / self.chunk_size) as usize;
            let Some(chunk) = self.chunks.get(idx) else {
                warn!("Linear access at {:#x} beyond host memory", linear);
                return;
            };
            let start = (linear % self.chunk_size) as usize;
            let n = (len - done).min(self.chunk_size as usize - start);
            let mut data = chunk.lock();
            f(&mut data[start..start + n], done);
            done += n;
        }
    }
}

impl HostMemoryProvider for SimHostMemory {
    fn chunks(&self) -> Vec<ChunkDescriptor> {
        self.chunks
            .iter()
            .enumerate()
            .map(|(idx, chunk)| ChunkDescriptor {
                chunk_id: idx as u16,
                base_address: chunk.base,
            })
            .collect()
    }

    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn read_linear(&self, offset: u64, buf: &mut [u8]) {
        self.for_each_linear(offset, buf.len(), |src, at| {
            buf[at..at + src.len()].copy_from_slice(src);
        });
    }

    fn write_linear(&self, offset: u64, data: &[u8]) {
        self.for_each_linear(offset, data.len(), |dst, at| {
            dst.copy_from_slice(&data[at..at + dst.len()]);
        });
    }
}

/// Access counters of a [`SimTransport`]
#[derive(Debug, Default)]
pub struct TransportStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub window_maps: AtomicU64,
    /// Command path accesses outside the mapped window
    pub window_faults: AtomicU64,
    pub dma_to_host: AtomicU64,
    pub dma_from_host: AtomicU64,
    pub dma_high: AtomicU64,
    pub dma_low: AtomicU64,
    /// DMAs that targeted unmapped host memory or overran the device buffer
    pub dma_faults: AtomicU64,
}

impl TransportStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Total transport operations of any kind
    pub fn total(&self) -> u64 {
        [
            &self.reads,
            &self.writes,
            &self.window_maps,
            &self.dma_to_host,
            &self.dma_from_host,
        ]
        .iter()
        .map(|c| c.load(Ordering::Relaxed))
        .sum()
    }
}

/// A DMA waiting for its completion to be signalled
type Pending = (Instant, Arc<Mailbox>);

/// Transport backed by [`SimHostMemory`].
///
/// By default DMAs complete before `enqueue_dma` returns. With
/// [`SimTransport::with_async_completion`] the data still moves at enqueue time, but the returned
/// [`Completion`] is only signalled later by a completer thread, like a real DMA engine would.
pub struct SimTransport {
    memory: Arc<SimHostMemory>,
    device: Mutex<Box<[u8]>>,
    /// Base of the chunk the command window points at
    window: Mutex<Option<u64>>,
    stats: TransportStats,
    dma_delay: Option<Duration>,
    completion_delay: Duration,
    completer: Option<Sender<Pending>>,
    completer_thread: Option<JoinHandle<()>>,
}

impl SimTransport {
    pub fn new(memory: Arc<SimHostMemory>, device_buffer_size: usize) -> Self {
        SimTransport {
            memory,
            device: Mutex::new(vec![0u8; device_buffer_size].into_boxed_slice()),
            window: Mutex::new(None),
            stats: TransportStats::default(),
            dma_delay: None,
            completion_delay: Duration::ZERO,
            completer: None,
            completer_thread: None,
        }
    }

    /// Busy-wait `delay` inside every DMA to model engine latency
    pub fn with_dma_delay(mut self, delay: Duration) -> Self {
        self.dma_delay = Some(delay);
        self
    }

    /// Signal DMA completions from a separate thread, `delay` after each DMA was enqueued
    pub fn with_async_completion(mut self, delay: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Pending>();
        let handle = thread::Builder::new()
            .name("sim-dma".to_string())
            .spawn(move || {
                let mut posted = 0u64;
                // ends once the transport and with it the sender is gone
                for (due, mailbox) in rx {
                    let now = Instant::now();
                    if due > now {
                        thread::sleep(due - now);
                    }
                    mailbox.post();
                    posted += 1;
                }
                debug!("sim-dma: completer exiting after {} completions", posted);
            })?;
        self.completion_delay = delay;
        self.completer = Some(tx);
        self.completer_thread = Some(handle);
        Ok(self)
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn memory(&self) -> &Arc<SimHostMemory> {
        &self.memory
    }

    /// Copy of the device side buffer
    pub fn device_buffer(&self) -> Vec<u8> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner).to_vec()
    }

    fn check_window(&self, address: u64, len: usize) {
        let mapped = *self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let inside = mapped.is_some_and(|base| {
            address >= base && address + len as u64 <= base + self.memory.chunk_size
        });
        if !inside {
            warn!("Command access at {:#x} outside the mapped window {:x?}", address, mapped);
            TransportStats::bump(&self.stats.window_faults);
        }
    }
}

impl Transport for SimTransport {
    fn map_window(&self, address: u64) {
        let base = self.memory.chunk_base_of(address);
        if base.is_none() {
            warn!("Mapping window at unmapped address {:#x}", address);
        }
        trace!("Window -> {:x?}", base);
        *self.window.lock().unwrap_or_else(PoisonError::into_inner) = base;
        TransportStats::bump(&self.stats.window_maps);
    }

    fn read(&self, address: u64, buf: &mut [u8]) {
        self.check_window(address, buf.len());
        if !self.memory.read_dma(address, buf) {
            buf.fill(0xff);
        }
        TransportStats::bump(&self.stats.reads);
    }

    fn write(&self, address: u64, data: &[u8]) {
        self.check_window(address, data.len());
        self.memory.write_dma(address, data);
        TransportStats::bump(&self.stats.writes);
    }

    fn enqueue_dma(&self, descriptor: &DmaDescriptor, queue: DmaQueue) -> Completion {
        let started = Instant::now();
        let start = descriptor.device_offset as usize;
        let end = start + descriptor.length as usize;

        // device buffer first, then the host chunk
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        let ok = match device.get_mut(start..end) {
            Some(local) => match descriptor.direction {
                Direction::ToHost => self.memory.write_dma(descriptor.host_address, local),
                Direction::FromHost => self.memory.read_dma(descriptor.host_address, local),
            },
            None => false,
        };
        drop(device);

        if !ok {
            warn!("DMA fault: {:x?}", descriptor);
            TransportStats::bump(&self.stats.dma_faults);
        }
        match descriptor.direction {
            Direction::ToHost => TransportStats::bump(&self.stats.dma_to_host),
            Direction::FromHost => TransportStats::bump(&self.stats.dma_from_host),
        }
        match queue {
            DmaQueue::High => TransportStats::bump(&self.stats.dma_high),
            DmaQueue::Low => TransportStats::bump(&self.stats.dma_low),
        }

        if let Some(delay) = self.dma_delay {
            while started.elapsed() < delay {
                std::hint::spin_loop();
            }
        }

        let Some(completer) = &self.completer else {
            return Completion::done();
        };
        let (completion, mailbox) = Completion::pending();
        if let Err(mpsc::SendError((_, mailbox))) =
            completer.send((started + self.completion_delay, mailbox))
        {
            warn!("sim-dma completer is gone, completing inline");
            mailbox.post();
        }
        completion
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        drop(self.completer.take());
        if let Some(handle) = self.completer_thread.take() {
            if handle.join().is_err() {
                warn!("sim-dma completer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: u64 = 64 * 1024;

    #[test]
    fn chunks_are_reversed_and_gapped() {
        let mem = SimHostMemory::new(3, CHUNK);
        let chunks = mem.chunks();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].base_address > chunks[1].base_address);
        assert_eq!(chunks[1].base_address - chunks[2].base_address, 2 * CHUNK);
        assert_eq!(mem.total_size(), 3 * CHUNK);
    }

    #[test]
    fn linear_view_spans_chunks() {
        let mem = SimHostMemory::new(2, CHUNK);
        let data: Vec<u8> = (0..64).collect();
        mem.write_linear(CHUNK - 32, &data);

        let mut back = vec![0u8; 64];
        mem.read_linear(CHUNK - 32, &mut back);
        assert_eq!(back, data);

        let chunks = mem.chunks();
        let mut head = [0u8; 32];
        assert!(mem.read_dma(chunks[1].base_address, &mut head));
        assert_eq!(&head[..], &data[32..]);
    }

    #[test]
    fn window_faults_are_counted() {
        let mem = Arc::new(SimHostMemory::new(2, CHUNK));
        let chunks = mem.chunks();
        let transport = SimTransport::new(mem, 8192);
        let mut buf = [0u8; 64];

        transport.read(chunks[0].base_address, &mut buf);
        assert_eq!(transport.stats().window_faults.load(Ordering::Relaxed), 1);

        transport.map_window(chunks[0].base_address + 128);
        transport.read(chunks[0].base_address, &mut buf);
        transport.write(chunks[0].base_address + 64, &buf);
        assert_eq!(transport.stats().window_faults.load(Ordering::Relaxed), 1);

        transport.read(chunks[1].base_address, &mut buf);
        assert_eq!(transport.stats().window_faults.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn dma_moves_data_both_ways() {
        let mem = Arc::new(SimHostMemory::new(1, CHUNK));
        let base = mem.chunks()[0].base_address;
        mem.write_dma(base + 4096, &[0xab; 128]);
        let transport = SimTransport::new(mem.clone(), 8192);

        let read = DmaDescriptor {
            host_address: base + 4096,
            device_offset: 256,
            length: 128,
            direction: Direction::FromHost,
        };
        transport.enqueue_dma(&read, DmaQueue::High).wait();
        assert!(transport.device_buffer()[256..384].iter().all(|&b| b == 0xab));

        let write = DmaDescriptor {
            host_address: base,
            ..read
        };
        let write = DmaDescriptor {
            direction: Direction::ToHost,
            ..write
        };
        transport.enqueue_dma(&write, DmaQueue::Low).wait();
        let mut back = [0u8; 128];
        mem.read_dma(base, &mut back);
        assert!(back.iter().all(|&b| b == 0xab));

        let overrun = DmaDescriptor {
            device_offset: 8192 - 64,
            ..read
        };
        transport.enqueue_dma(&overrun, DmaQueue::Low).wait();
        let stats = transport.stats();
        assert_eq!(stats.dma_faults.load(Ordering::Relaxed), 1);
        assert_eq!(stats.dma_high.load(Ordering::Relaxed), 1);
        assert_eq!(stats.dma_low.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn async_completion_signals_after_delay() {
        let mem = Arc::new(SimHostMemory::new(1, CHUNK));
        let base = mem.chunks()[0].base_address;
        mem.write_dma(base, &[0x5a; 64]);
        let delay = Duration::from_millis(20);
        let transport = SimTransport::new(mem, 8192)
            .with_async_completion(delay)
            .unwrap();

        let read = DmaDescriptor {
            host_address: base,
            device_offset: 0,
            length: 64,
            direction: Direction::FromHost,
        };
        let started = Instant::now();
        let first = transport.enqueue_dma(&read, DmaQueue::High);
        let second = transport.enqueue_dma(&read, DmaQueue::Low);
        first.wait();
        second.wait();
        assert!(started.elapsed() >= delay);
        assert!(transport.device_buffer()[..64].iter().all(|&b| b == 0x5a));
        assert_eq!(transport.stats().dma_from_host.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn async_completer_stops_with_transport() {
        let mem = Arc::new(SimHostMemory::new(1, CHUNK));
        let transport = SimTransport::new(mem, 8192)
            .with_async_completion(Duration::from_millis(1))
            .unwrap();
        drop(transport);
    }
}
