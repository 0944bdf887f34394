use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "constel=info,constellation=info,warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable compact output (for interactive CLI use).
    Human,
    /// Structured JSON output (for node daemons).
    Json,
}

/// Initialize the global tracing subscriber.
///
/// Call once at program startup. Respects `RUST_LOG`; later calls are ignored.
pub fn init(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = match format {
        LogFormat::Human => {
            let subscriber = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .try_init()
        }
        LogFormat::Json => {
            let subscriber = fmt::layer().json().with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .try_init()
        }
    };
    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}
