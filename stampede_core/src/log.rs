//! Logging utils.

use tracing_subscriber::EnvFilter;

/// Initialize stderr logging.
///
/// It uses the `STAMPEDE_LOG` environment variable to control the logging
/// level. Defaults to `warn`.
pub fn init() {
  let filter = EnvFilter::try_from_env("STAMPEDE_LOG")
    .unwrap_or_else(|_| EnvFilter::new("warn"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

/// Same as [`init`], but safe to call multiple times. Used by tests.
pub fn try_init() {
  let filter = EnvFilter::try_from_env("STAMPEDE_LOG")
    .unwrap_or_else(|_| EnvFilter::new("warn"));

  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .try_init();
}
