//! Process-wide logging setup for services embedding the job engine.

/// Initialize process-wide observability (JSON tracing output).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Human-readable variant of [`init`] for local runs.
pub fn init_pretty() {
    tracing::init_pretty();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
