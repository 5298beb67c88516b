pub mod address;
pub mod bench;
pub mod cache;
pub mod chain;
pub mod clock;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod journal;
pub mod queue;
pub mod signal;
pub mod sim;
pub mod transport;
pub mod worker;

pub use config::BenchConfig;
pub use control::{ControlChannel, TestFlags, TestKind, TestParams, TestResult};
pub use error::{BenchError, Result};

/// Link two worker contexts with a one-slot signal edge.
/// Usage:
///  connect_contexts!(upstream_ctx, downstream_ctx);
#[macro_export]
macro_rules! connect_contexts {
    ( $tx:expr, $rx:expr ) => {
        let (tx, rx) = $crate::signal::edge();
        $tx.set_sender(tx);
        $rx.set_receiver(rx);
    };
}

/// Byte count in the largest fitting binary unit, two decimals
pub fn format_size(bytes: f32) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Convert number of bytes to formatted string for fixed-width integer string
pub fn format_size_fixed_int(bytes: u64) -> String {
    const GB: u64 = 1024 * 1024 * 1024;
    const MB: u64 = 1024 * 1024;
    const KB: u64 = 1024;

    if bytes >= GB && bytes % GB == 0 {
        format!("{:>4} GiB", bytes / GB)
    } else if bytes >= MB && bytes % MB == 0 {
        format!("{:>4} MiB", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{:>4} KiB", bytes / KB)
    } else {
        format!("{:>4} B", bytes)
    }
}
