//! Device timestamp counter.
//!
//! Ticks are nanoseconds since the first read in this process, which keeps them monotonic across
//! all worker threads.
use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Read the 64 bit timestamp counter
#[inline]
pub fn now() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Split a timestamp into its high and low 32 bit words
#[inline]
pub fn split(ts: u64) -> (u32, u32) {
    ((ts >> 32) as u32, ts as u32)
}

/// Join high and low 32 bit words back into a timestamp
#[inline]
pub fn join(hi: u32, lo: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Elapsed ticks between two reads, clamped to a 32 bit journal sample
#[inline]
pub fn sample(t0: u64, t1: u64) -> u32 {
    u32::try_from(t1.saturating_sub(t0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join() {
        let ts = 0x0123_4567_89ab_cdef;
        let (hi, lo) = split(ts);
        assert_eq!(hi, 0x0123_4567);
        assert_eq!(lo, 0x89ab_cdef);
        assert_eq!(join(hi, lo), ts);
    }

    #[test]
    fn monotonic_and_clamped() {
        let t0 = now();
        let t1 = now();
        assert!(t1 >= t0);
        assert_eq!(sample(10, 4), 0);
        assert_eq!(sample(0, u64::MAX), u32::MAX);
    }
}
