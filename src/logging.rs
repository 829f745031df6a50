//! Logging setup for the `bulk-scan` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary. `RUST_LOG` always wins over the verbosity flag:
//!
//! ```bash
//! RUST_LOG=bulk_scan=debug bulk-scan image.raw -o out
//! RUST_LOG=bulk_scan::scanner=trace bulk-scan image.raw -o out
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter directive for a `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "bulk_scan=info",
        1 => "bulk_scan=debug",
        _ => "bulk_scan=trace",
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(verbosity > 0)
            .with_thread_ids(verbosity > 1)
            .with_writer(std::io::stderr)
            .compact(),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_by_verbosity() {
        assert_eq!(default_directive(0), "bulk_scan=info");
        assert_eq!(default_directive(1), "bulk_scan=debug");
        assert_eq!(default_directive(5), "bulk_scan=trace");
    }
}
