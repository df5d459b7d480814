//! Tracing subscriber setup for binaries embedding the scheduler.

use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber honouring `RUST_LOG`.
///
/// Falls back to `info` (or `debug` when `verbose`) for this crate. Calling
/// it twice is harmless; the second installation is ignored.
pub fn init(verbose: bool) {
    let fallback = if verbose {
        "testfleet=debug,testfleet_cli=debug"
    } else {
        "testfleet=info,testfleet_cli=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
