use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};
use vessel_core::{FilterReload, LogLevel};

/// Environment variable holding the startup filter.
pub const LOG_ENV: &str = "VESSEL_LOG";

/// [`FilterReload`] over the process-wide `EnvFilter`.
pub struct EnvFilterReload {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl FilterReload for EnvFilterReload {
    fn reload(&self, directives: &str) -> Result<(), String> {
        let filter = EnvFilter::try_new(directives).map_err(|e| e.to_string())?;
        self.handle.reload(filter).map_err(|e| e.to_string())
    }
}

/// Install the global subscriber. Logs go to stderr so they don't interfere
/// with the MCP stdio transport on stdout.
pub fn init(default_level: LogLevel, json: bool) -> Arc<EnvFilterReload> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_directive()));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();

    Arc::new(EnvFilterReload { handle })
}
