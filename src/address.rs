//! # Address table
//!
//! Working out the host address of a transaction is fairly expensive, especially for random
//! access and window sizes that are not a power of two. Before each test the table below is
//! filled with one device-visible DMA address per transaction index, so the measurement loops
//! only do a masked array lookup.
//!
//! A window always starts at the beginning of chunk 0 and, when larger than a chunk, continues
//! into chunks 1, 2, .... Each entry is 64 bit: the low 56 bits are the DMA address and the top
//! byte is the index of the chunk the address falls into. No entry describes a transfer that
//! crosses the burst boundary.
use crate::config::BenchConfig;
use crate::control::TestFlags;
use crate::error::{BenchError, Result};
use log::{debug, trace};
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

const ADDRESS_MASK: u64 = (1 << 56) - 1;
const CHUNK_ID_SHIFT: u32 = 56;

/// Host memory chunk as handed over by the host memory provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub chunk_id: u16,
    /// DMA address of the first byte of the chunk
    pub base_address: u64,
}

/// One precomputed transaction target: DMA address plus chunk id in the top byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct AddressEntry(u64);

impl AddressEntry {
    pub fn new(address: u64, chunk_id: u8) -> Self {
        AddressEntry((address & ADDRESS_MASK) | (u64::from(chunk_id) << CHUNK_ID_SHIFT))
    }

    /// Raw 64 bit table word
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Device-visible DMA address without the chunk id
    pub fn address(self) -> u64 {
        self.0 & ADDRESS_MASK
    }

    /// Bits 32..56 of the DMA address
    pub fn address_hi(self) -> u32 {
        (self.address() >> 32) as u32
    }

    /// Bits 0..32 of the DMA address
    pub fn address_lo(self) -> u32 {
        self.0 as u32
    }

    pub fn chunk_id(self) -> u8 {
        (self.0 >> CHUNK_ID_SHIFT) as u8
    }
}

/// Transaction index to host address lookup table
pub struct AddressTable {
    entries: Box<[AddressEntry]>,
    mask: usize,
    /// Local copy of the chunk base addresses, indexed by chunk id
    chunk_bases: Vec<u64>,
    chunk_shift: u32,
    burst_boundary: u32,
    seed: u64,
    retry_limit: u32,
    unit_size: u32,
    units_in_window: u32,
}

impl AddressTable {
    /// Allocate a zeroed table sized by `cfg`
    pub fn new(cfg: &BenchConfig) -> Self {
        AddressTable {
            entries: vec![AddressEntry::default(); cfg.addr_table_size].into_boxed_slice(),
            mask: cfg.addr_table_size - 1,
            chunk_bases: Vec::new(),
            chunk_shift: cfg.chunk_size.trailing_zeros(),
            burst_boundary: cfg.burst_boundary,
            seed: cfg.random_seed,
            retry_limit: cfg.addr_retry_limit,
            unit_size: 0,
            units_in_window: 0,
        }
    }

    /// Cache the chunk base addresses for the next `init()`
    pub fn set_chunks(&mut self, chunks: &[ChunkDescriptor]) -> Result<()> {
        if chunks.is_empty() || chunks.len() > 256 {
            return Err(BenchError::invalid_parameters(format!(
                "{} host memory chunks, expected 1..=256",
                chunks.len()
            )));
        }
        self.chunk_bases.clear();
        for (idx, chunk) in chunks.iter().enumerate() {
            if usize::from(chunk.chunk_id) != idx {
                return Err(BenchError::invalid_parameters(format!(
                    "chunk ids are not contiguous: found {} at position {}",
                    chunk.chunk_id, idx
                )));
            }
            if chunk.base_address & u64::from(self.burst_boundary - 1) != 0 {
                return Err(BenchError::invalid_parameters(format!(
                    "chunk {} base {:#x} is not burst aligned",
                    chunk.chunk_id, chunk.base_address
                )));
            }
            self.chunk_bases.push(chunk.base_address);
        }
        Ok(())
    }

    /// Precompute the addresses for a test.
    ///
    /// `window_size` bytes starting at chunk 0 are divided into units of `transfer_size +
    /// host_offset` rounded up to 64 bytes; each transaction targets `host_offset` bytes into a
    /// unit. Units are visited in order unless `flags` contains [`TestFlags::RANDOM`].
    /// Candidates whose transfer would cross the burst boundary are skipped.
    pub fn init(
        &mut self,
        window_size: u32,
        transfer_size: u32,
        host_offset: u32,
        flags: TestFlags,
    ) -> Result<()> {
        let span = u64::from(transfer_size) + u64::from(host_offset);
        if transfer_size == 0 {
            return Err(BenchError::invalid_parameters("transfer size is zero"));
        }
        if span > u64::from(self.burst_boundary) {
            return Err(BenchError::invalid_parameters(format!(
                "transfer {} + host offset {} exceeds burst boundary {}",
                transfer_size, host_offset, self.burst_boundary
            )));
        }
        if span > u64::from(window_size) {
            return Err(BenchError::invalid_parameters(format!(
                "transfer {} + host offset {} exceeds window {}",
                transfer_size, host_offset, window_size
            )));
        }
        let covered = self.covered();
        if u64::from(window_size) > covered {
            return Err(BenchError::invalid_parameters(format!(
                "window {:#x} is larger than the {:#x} bytes of host memory",
                window_size, covered
            )));
        }

        let unit_size = round_up_64(span as u32);
        let units_in_window = window_size / unit_size;
        if units_in_window == 0 {
            return Err(BenchError::invalid_parameters(format!(
                "window {} holds no {} byte unit",
                window_size, unit_size
            )));
        }
        self.unit_size = unit_size;
        self.units_in_window = units_in_window;

        let random = flags.contains(TestFlags::RANDOM);
        let mut rng = Xoshiro256StarStar::seed_from_u64(self.seed);
        let boundary = u64::from(self.burst_boundary);
        // sequential mode: skipped units shift every later slot
        let mut add: u64 = 0;

        for idx in 0..self.entries.len() {
            let mut rejected = 0;
            let lin_addr = loop {
                let trans = if random {
                    u64::from(rng.next_u32())
                } else {
                    idx as u64 + add
                };
                let lin_addr = (trans % u64::from(units_in_window)) * u64::from(unit_size)
                    + u64::from(host_offset);

                let avail = boundary - (lin_addr & (boundary - 1));
                if avail >= u64::from(transfer_size) {
                    break lin_addr;
                }

                add += 1;
                rejected += 1;
                if rejected > self.retry_limit {
                    return Err(BenchError::invalid_parameters(format!(
                        "no burst aligned address for slot {} after {} attempts",
                        idx, rejected
                    )));
                }
            };

            let entry = self.translate(lin_addr);
            self.entries[idx] = entry;
            trace!("slot {} -> {:#x} (chunk {})", idx, entry.address(), entry.chunk_id());
        }

        debug!(
            "Address table: window={:#x} size={} h_off={} unit={} units={} {}",
            window_size,
            transfer_size,
            host_offset,
            unit_size,
            units_in_window,
            if random { "random" } else { "sequential" }
        );
        Ok(())
    }

    /// Translate a transaction index into its precomputed address
    #[inline]
    pub fn lookup(&self, index: u32) -> AddressEntry {
        self.entries[index as usize & self.mask]
    }

    /// Convert a linear offset into host memory to a chunk id and DMA address.
    /// `linear` must lie below [`AddressTable::covered`].
    #[inline]
    pub fn translate(&self, linear: u64) -> AddressEntry {
        let chunk_id = (linear >> self.chunk_shift) as usize;
        let chunk_off = linear & ((1u64 << self.chunk_shift) - 1);
        AddressEntry::new(self.chunk_bases[chunk_id] + chunk_off, chunk_id as u8)
    }

    /// Bytes of host memory reachable through the cached chunks
    pub fn covered(&self) -> u64 {
        (self.chunk_bases.len() as u64) << self.chunk_shift
    }

    /// Linear offset into the window that `entry` was built from
    pub fn linear_offset(&self, entry: AddressEntry) -> u64 {
        let chunk = usize::from(entry.chunk_id());
        (entry.address() - self.chunk_bases[chunk]) + ((chunk as u64) << self.chunk_shift)
    }

    /// Base address of the chunk `chunk_id`, if cached
    pub fn chunk_base(&self, chunk_id: u8) -> Option<u64> {
        self.chunk_bases.get(usize::from(chunk_id)).copied()
    }

    pub fn entries(&self) -> &[AddressEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes between the starts of consecutive units of the last `init()`
    pub fn unit_size(&self) -> u32 {
        self.unit_size
    }

    pub fn units_in_window(&self) -> u32 {
        self.units_in_window
    }
}

/// Round up to the next multiple of 64 (host cache line)
#[inline]
pub fn round_up_64(value: u32) -> u32 {
    (value + 63) & !63
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const CHUNK: u64 = 4 * 1024 * 1024;

    fn cfg(max_mem: u64, table: usize) -> BenchConfig {
        BenchConfig {
            max_mem,
            chunk_size: CHUNK,
            addr_table_size: table,
            ..BenchConfig::default()
        }
    }

    /// Chunk bases deliberately out of order to catch id/base mixups
    fn chunks(n: usize) -> Vec<ChunkDescriptor> {
        (0..n)
            .map(|i| ChunkDescriptor {
                chunk_id: i as u16,
                base_address: 0x10_0000_0000 + ((n - i) as u64) * 2 * CHUNK,
            })
            .collect()
    }

    fn table(max_mem: u64, size: usize) -> AddressTable {
        let cfg = cfg(max_mem, size);
        let mut table = AddressTable::new(&cfg);
        table.set_chunks(&chunks(cfg.num_chunks())).unwrap();
        table
    }

    #[test]
    fn entry_packing() {
        let entry = AddressEntry::new(0x00ab_cdef_1234_5678, 0x5a);
        assert_eq!(entry.chunk_id(), 0x5a);
        assert_eq!(entry.address(), 0x00ab_cdef_1234_5678);
        assert_eq!(entry.address_hi(), 0x00ab_cdef);
        assert_eq!(entry.address_lo(), 0x1234_5678);
        assert_eq!(entry.raw() >> 56, 0x5a);
    }

    #[test]
    fn round_up() {
        assert_eq!(round_up_64(1), 64);
        assert_eq!(round_up_64(64), 64);
        assert_eq!(round_up_64(65), 128);
        assert_eq!(round_up_64(4096), 4096);
    }

    #[test]
    fn sequential_window_cycles_every_unit() {
        let mut table = table(16 * CHUNK, 4096);
        table.init(4096, 64, 0, TestFlags::empty()).unwrap();
        assert_eq!(table.units_in_window(), 64);

        let offsets: Vec<u64> = table.entries().iter().map(|e| table.linear_offset(*e)).collect();
        let distinct: HashSet<u64> = offsets.iter().copied().collect();
        assert_eq!(distinct.len(), 64);
        for (idx, off) in offsets.iter().enumerate() {
            assert_eq!(*off, (idx as u64 % 64) * 64);
        }
    }

    #[test]
    fn no_entry_crosses_burst_boundary() {
        for &(size, h_off, random) in &[(64, 0, false), (100, 30, false), (1000, 17, true), (4000, 96, true), (2049, 0, false)] {
            let mut table = table(16 * CHUNK, 8192);
            let flags = if random { TestFlags::RANDOM } else { TestFlags::empty() };
            table.init(1 << 20, size, h_off, flags).unwrap();
            for entry in table.entries() {
                let in_chunk = entry.address() - table.chunk_base(entry.chunk_id()).unwrap();
                assert!((in_chunk & 4095) + u64::from(size) <= 4096, "size {} crosses at {:#x}", size, in_chunk);
            }
        }
    }

    #[test]
    fn offsets_stay_inside_window() {
        let window = 5 * 1024 * 1024 + 320;
        let mut table = table(16 * CHUNK, 16384);
        table.init(window, 256, 8, TestFlags::RANDOM).unwrap();
        for entry in table.entries() {
            assert!(table.linear_offset(*entry) < u64::from(window));
            assert!(usize::from(entry.chunk_id()) < 16);
        }
    }

    #[test]
    fn sequential_is_deterministic() {
        let mut a = table(16 * CHUNK, 4096);
        let mut b = table(16 * CHUNK, 4096);
        a.init(1 << 16, 192, 32, TestFlags::empty()).unwrap();
        b.init(1 << 16, 192, 32, TestFlags::empty()).unwrap();
        assert_eq!(a.entries(), b.entries());

        // rebuilding in place gives the same result again
        let before = a.entries().to_vec();
        a.init(1 << 16, 192, 32, TestFlags::empty()).unwrap();
        assert_eq!(a.entries(), &before[..]);
    }

    #[test]
    fn random_is_reproducible_per_seed() {
        let mut a = table(16 * CHUNK, 4096);
        let mut b = table(16 * CHUNK, 4096);
        a.init(1 << 20, 64, 0, TestFlags::RANDOM).unwrap();
        b.init(1 << 20, 64, 0, TestFlags::RANDOM).unwrap();
        assert_eq!(a.entries(), b.entries());
        let distinct: HashSet<u64> = a.entries().iter().map(|e| e.raw()).collect();
        assert!(distinct.len() > 1000);
    }

    #[test]
    fn chunk_changes_twice_per_sweep() {
        // 8 MiB window over 4 MiB chunks: 0 -> 1 mid sweep and 1 -> 0 on wrap
        let mut table = table(16 * CHUNK, 1 << 18);
        table.init(8 * 1024 * 1024, 64, 0, TestFlags::empty()).unwrap();
        let units = table.units_in_window() as usize;
        assert_eq!(units, 131072);
        let transitions = (0..units)
            .filter(|&i| table.lookup(i as u32).chunk_id() != table.lookup(((i + 1) % units) as u32).chunk_id())
            .count();
        assert_eq!(transitions, 2);
    }

    #[test]
    fn partial_last_chunk() {
        let mut table = table(16 * CHUNK, 1 << 18);
        table.init(10 * 1024 * 1024, 64, 0, TestFlags::empty()).unwrap();
        let units = table.units_in_window() as usize;
        let ids: HashSet<u8> = (0..units).map(|i| table.lookup(i as u32).chunk_id()).collect();
        assert_eq!(ids, HashSet::from([0, 1, 2]));
        let transitions = (0..units)
            .filter(|&i| table.lookup(i as u32).chunk_id() != table.lookup(((i + 1) % units) as u32).chunk_id())
            .count();
        assert_eq!(transitions, 3);
    }

    #[test]
    fn lookup_wraps() {
        let mut table = table(16 * CHUNK, 1024);
        table.init(1 << 20, 64, 0, TestFlags::empty()).unwrap();
        assert_eq!(table.lookup(5), table.lookup(1024 + 5));
        assert_eq!(table.lookup(u32::MAX), table.lookup(1023));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let mut table = table(2 * CHUNK, 1024);
        assert!(matches!(
            table.init(8192, 4000, 100, TestFlags::empty()),
            Err(BenchError::InvalidParameters { .. })
        ));
        assert!(table.init(64, 64, 8, TestFlags::empty()).is_err());
        assert!(table.init(8192, 0, 0, TestFlags::empty()).is_err());
        // unit rounds up past the window
        assert!(table.init(100, 70, 0, TestFlags::empty()).is_err());
        // window larger than host memory
        assert!(table.init(3 * CHUNK as u32, 64, 0, TestFlags::empty()).is_err());
    }

    #[test]
    fn random_retry_limit_surfaces_error() {
        let cfg = BenchConfig {
            addr_retry_limit: 1,
            ..cfg(16 * CHUNK, 1024)
        };
        let mut table = AddressTable::new(&cfg);
        table.set_chunks(&chunks(16)).unwrap();
        // 3008 byte units: most candidates cross a 4 KiB boundary
        let res = table.init(1 << 20, 3000, 0, TestFlags::RANDOM);
        assert!(matches!(res, Err(BenchError::InvalidParameters { .. })));
    }

    #[test]
    fn retry_limit_counts_redraws() {
        let cfg = BenchConfig {
            addr_retry_limit: 1,
            ..cfg(16 * CHUNK, 1024)
        };
        let mut table = AddressTable::new(&cfg);
        table.set_chunks(&chunks(16)).unwrap();
        // two 3008 byte units: the second crosses 4 KiB, so every slot after the first
        // needs exactly one redraw
        table.init(8192, 3000, 0, TestFlags::empty()).unwrap();
        assert_eq!(table.units_in_window(), 2);
        let base = table.lookup(0).address();
        assert!((1..1024).all(|tx| table.lookup(tx).address() == base));

        // four units: the second and third both cross, two redraws in a row are one too many
        let res = table.init(12288, 3000, 0, TestFlags::empty());
        assert!(matches!(res, Err(BenchError::InvalidParameters { .. })));
    }

    #[test]
    fn rejects_non_contiguous_chunks() {
        let mut table = AddressTable::new(&cfg(16 * CHUNK, 1024));
        let mut list = chunks(3);
        list[2].chunk_id = 7;
        assert!(table.set_chunks(&list).is_err());
        let mut list = chunks(3);
        list[1].base_address += 8;
        assert!(table.set_chunks(&list).is_err());
    }
}
