//! Logging initialization

use crate::types::MirrorError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Diagnostics go to stderr so stdout stays clean for command output. An
/// explicit directive wins over `RUST_LOG`; the default keeps mirra at
/// info level.
pub fn init(directive: Option<&str>) -> Result<(), MirrorError> {
    let env_filter = match directive {
        Some(directive) => EnvFilter::try_new(directive)
            .map_err(|e| MirrorError::Config(format!("invalid log filter: {e}")))?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("mirra=info"))
            .map_err(|e| MirrorError::Config(format!("invalid log filter: {e}")))?,
    };

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}
