use tracing_subscriber::EnvFilter;

/// Installs the process-wide JSON logger. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_json_logger() {
	tracing_subscriber::fmt()
		.json()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();
}
