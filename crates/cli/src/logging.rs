//! stderr logging for the `telco` binary.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Environment variable that overrides the verbosity flags.
pub const LOG_ENV: &str = "TELCO_LOG";

/// Filter directives for a `-v` count.
pub fn default_filter(verbosity: u8) -> &'static str {
	match verbosity {
		// host and connection chatter stays off
		0 => "error,telco=off,telco_runtime=off,telco::host=off",
		1 => "info,telco=warn,telco_runtime=warn",
		2 => "debug,telco::host=info",
		_ => "trace",
	}
}

/// Installs the global subscriber. `TELCO_LOG`, then `RUST_LOG`, win over `verbosity`.
pub fn init_logging(verbosity: u8) {
	let env_filter = EnvFilter::try_from_env(LOG_ENV)
		.or_else(|_| EnvFilter::try_from_default_env())
		.unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(verbosity > 1)
		.with_level(true)
		.compact()
		.init();
}
