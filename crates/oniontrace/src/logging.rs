//! Tracing subscriber installation.

use crate::config::LogLevel;

/// Install the global tracing subscriber with the configured filter.
///
/// The filter is fixed for the lifetime of the process; there is no
/// runtime reconfiguration.
pub(crate) fn install(level: LogLevel) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(level.to_filter())
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))
}
