use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber. Safe to call more than once;
/// only the first call wins (tests and embedding applications may both
/// try to initialize).
pub fn init() {
    INSTALLED.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true));
        // Another subscriber may already be installed by the host process.
        let _ = subscriber.try_init();
    });
}
