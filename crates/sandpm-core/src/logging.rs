//! Logging initialization for hosts embedding sandpm.
//!
//! Library code only emits `tracing` events; whoever owns the process decides
//! where they go by calling [`init`] once.

use crate::error::Error;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a global tracing subscriber.
///
/// * `verbosity` - 0 = INFO, 1 = DEBUG, 2+ = TRACE
/// * `json` - emit JSON lines to stderr instead of human-readable output
///
/// `RUST_LOG` is honored; the verbosity level is added on top for the
/// `sandpm_core` target.
///
/// Returns an error if a global subscriber is already installed.
pub fn init(verbosity: u8, json: bool) -> Result<(), Error> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let directive = format!("sandpm_core={level}")
        .parse()
        .map_err(|e| Error::Logging(format!("invalid log directive: {e}")))?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"))
        .add_directive(directive);

    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| Error::Logging(e.to_string()))
}
