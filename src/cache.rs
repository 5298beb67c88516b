//! Host cache preparation.
//!
//! Before a test the device can either thrash the host caches, by writing full cache lines at
//! random over all host memory, or warm them, by writing the window sequentially. Both go through
//! the command path, which keeps a single address window mapped and only re-points it when the
//! next line lives in a different chunk.
use crate::address::AddressTable;
use crate::transport::Transport;
use log::debug;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

const LINE: usize = 64;
const THRASH_PATTERN: u32 = 0xdead_0000;
const WARM_PATTERN: u32 = 0xcafe_0000;

/// Write randomly to `region` bytes of host memory (clamped to what the chunks cover)
pub fn thrash<T: Transport + ?Sized>(transport: &T, table: &AddressTable, region: u64, seed: u64) {
    let region = region.min(table.covered());
    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    debug!("Thrashing {:#x} bytes of host memory", region);
    write_region(transport, table, region, THRASH_PATTERN, Some(&mut rng));
}

/// Write sequentially over the first `window` bytes of host memory
pub fn warm<T: Transport + ?Sized>(transport: &T, table: &AddressTable, window: u64) {
    let window = window.min(table.covered());
    debug!("Warming {:#x} byte window", window);
    write_region(transport, table, window, WARM_PATTERN, None);
}

/// Two passes worth of full line writes over `size` bytes. Every line gets a distinct
/// pattern so stale data is recognisable in the host buffer.
fn write_region<T: Transport + ?Sized>(
    transport: &T,
    table: &AddressTable,
    size: u64,
    pattern: u32,
    mut rng: Option<&mut Xoshiro256StarStar>,
) {
    let size = size & !(LINE as u64 - 1);
    if size == 0 {
        return;
    }
    let mut line = [0u8; LINE];
    let mut entry = table.translate(0);
    let mut mapped_chunk = entry.chunk_id();
    transport.map_window(entry.address());

    let num_trans = 2 * (size / LINE as u64);
    for trans in 0..num_trans {
        let word = (pattern & 0xffff_0000) | (trans as u32 & 0xffff);
        for chunk in line.chunks_exact_mut(4) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        transport.write(entry.address(), &line);

        let idx = match rng.as_deref_mut() {
            Some(rng) => u64::from(rng.next_u32()),
            None => trans + 1,
        };
        let lin_addr = (idx * LINE as u64) % size;
        entry = table.translate(lin_addr);
        if entry.chunk_id() != mapped_chunk {
            transport.map_window(entry.address());
            mapped_chunk = entry.chunk_id();
        }
    }
}
