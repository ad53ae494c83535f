//! Process-wide logging setup.
//!
//! One `init` call per process, early in main (or once per test binary).
//! Output format and verbosity are environment driven:
//!
//! - `RUST_LOG` sets the filter (default `info`)
//! - `LOG_FORMAT=pretty` switches from JSON lines to human-readable output

use tracing_subscriber::EnvFilter;

/// Initialize structured logging for the process.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let pretty = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("pretty"));

    if pretty {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_current_span(false)
            .try_init();
    }
}
