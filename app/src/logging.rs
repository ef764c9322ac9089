use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CHQ_LOG";
const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid {LOG_ENV} filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Installs the stderr subscriber. Output on stdout stays reserved for
/// results.
pub fn init() -> Result<(), LogError> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::new(DEFAULT_FILTER),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|_| LogError::AlreadyInitialized)
}
