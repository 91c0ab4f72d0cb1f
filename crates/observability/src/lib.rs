//! Shared tracing setup for relay services.

pub mod tracing;

/// Initialize process-wide tracing with JSON output.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}
