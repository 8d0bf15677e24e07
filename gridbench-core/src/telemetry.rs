use std::io::IsTerminal as _;

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use crate::error::BoxError;

/// Configures structured logging with runtime control via the `RUST_LOG`
/// environment variable.
///
/// Defaults to INFO level to balance visibility with performance.
/// Use `RUST_LOG=debug` or `RUST_LOG=trace` for troubleshooting.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryConfig {
    /// Debug logging as default instead of info.
    pub verbose: bool,
    /// Pretty logging (format for humans).
    pub pretty: bool,
}

pub fn init_tracing(config: TelemetryConfig) -> Result<(), BoxError> {
    let directive = if config.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
    .into();

    let subscriber = tracing_subscriber::fmt()
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(directive)
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr);

    if config.pretty {
        subscriber.pretty().try_init()?;
    } else {
        subscriber.try_init()?;
    }

    tracing::debug!("tracing is set up");
    Ok(())
}
