// Tracing for the auth flow server. The security event trail stays at info
// whatever the configured level, unless RUST_LOG says otherwise.
use std::sync::OnceLock;

use octofhir_authflow::events::EVENT_TARGET;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| filter_for(level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Apply the configured level once config is loaded. `RUST_LOG` keeps precedence.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(handle) = LOG_RELOAD_HANDLE.get() {
        let filter = filter_for(level);
        if let Err(e) = handle.modify(|f| *f = filter) {
            tracing::warn!(error = %e, level, "Failed to apply logging level");
        }
    }
}

/// Filter for `level` that keeps security events at info.
pub fn filter_for(level: &str) -> EnvFilter {
    let filter = EnvFilter::new(level);
    match format!("{EVENT_TARGET}=info").parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_keeps_security_events() {
        let rendered = filter_for("warn").to_string();
        assert!(rendered.contains("warn"));
        assert!(rendered.contains("authflow::events=info"));
    }
}
