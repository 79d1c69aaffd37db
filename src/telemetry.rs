use std::error::Error;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber with a stderr fmt layer.
///
/// The filter defaults to `info` and can be overridden with `RUST_LOG`.
/// Setting `SCHEMAD_DISABLE_TRACING` silences everything but errors, which
/// keeps REPL output readable.
pub fn init_tracing() -> Result<(), Box<dyn Error>> {
    let env_filter = if tracing_disabled() {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

pub fn tracing_disabled() -> bool {
    matches!(
        std::env::var("SCHEMAD_DISABLE_TRACING"),
        Ok(v) if matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes" | "YES")
    )
}
