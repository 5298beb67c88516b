//! Interface to the instructions that move data across PCIe.
//!
//! Two access paths exist. The command path reads and writes host memory directly through a
//! single reusable address window, which has to be pointed at the chunk being accessed. The DMA
//! path enqueues descriptors to engine queues and completes asynchronously.
use crate::signal::Completion;

/// Which way a DMA moves data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device buffer to host memory (PCIe write)
    ToHost,
    /// Host memory to device buffer (PCIe read)
    FromHost,
}

/// DMA engine queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaQueue {
    /// Used by the latency tests
    High,
    /// Used by the bandwidth workers
    Low,
}

/// A single DMA request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// Host DMA address
    pub host_address: u64,
    /// Offset into the device side buffer
    pub device_offset: u32,
    pub length: u32,
    pub direction: Direction,
}

/// Operations the benchmark issues against an accelerator.
///
/// Implementations must be usable from many worker contexts at once. Failures are the
/// transport's own business: every call is assumed to eventually complete.
pub trait Transport: Send + Sync + 'static {
    /// Point the command path window at the chunk containing `address`
    fn map_window(&self, address: u64);

    /// Command path read of `buf.len()` bytes at `address`
    fn read(&self, address: u64, buf: &mut [u8]);

    /// Command path write of `data` to `address`
    fn write(&self, address: u64, data: &[u8]);

    /// Enqueue a DMA on `queue` and return its completion
    fn enqueue_dma(&self, descriptor: &DmaDescriptor, queue: DmaQueue) -> Completion;
}
