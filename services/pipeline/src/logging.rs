use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "pipeline=info,api=info,warn";

/// Install the global subscriber. `json` switches console output to one JSON
/// object per line.
pub fn init_logging(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stdout))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stdout))
            .init();
    }
}
