//! Process-wide tracing setup shared by binaries, tests and benches.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, LogFormatError};

/// Initialize tracing with the format taken from `BRANCHLEDGER_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env().unwrap_or_default());
}

/// Initialize tracing for a test binary. Output goes through the libtest
/// capture so it only shows for failing tests.
pub fn init_for_tests() {
    tracing::init_test();
}
