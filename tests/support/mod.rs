//! Shared test scaffolding for the integration suites.

/// Routes `tracing::debug!` output (token grants, wait estimates) to the
/// test harness's captured output, gated by `RUST_LOG` as usual.
pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .with_test_writer()
        .try_init();
}
