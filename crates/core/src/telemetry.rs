use tracing_subscriber::{EnvFilter, fmt};

/// Used when `RUST_LOG` is unset: our crates at `info`, chatty dependencies at `warn`.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

/// Initialise the global tracing subscriber.
///
/// Respects `RUST_LOG` env var; defaults to [`DEFAULT_DIRECTIVES`].
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    fmt().with_env_filter(filter).with_target(true).init();
}
