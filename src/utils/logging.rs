use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the application.
///
/// `RUST_LOG` wins when it is set; otherwise `default_level` is used.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(default_level)));

    // try_init so tests can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// `EnvFilter` knows `warn` but not `warning`.
pub(crate) fn default_directive(level: &str) -> String {
    match level.to_lowercase().as_str() {
        "warning" => "warn".to_string(),
        other => other.to_string(),
    }
}
