//! Tracing initialisation from the deployment's `log` section.

use chaingov_core::LogConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `"info,chaingov_sources=debug"` style directives, or `None` when the
/// level is empty and `RUST_LOG` should decide.
fn directives(config: &LogConfig) -> Option<String> {
    if config.level.trim().is_empty() {
        return None;
    }
    let mut out = config.level.trim().to_string();
    let mut components: Vec<_> = config.components.iter().collect();
    components.sort();
    for (component, level) in components {
        out.push_str(&format!(",{}={}", component.replace('-', "_"), level));
    }
    Some(out)
}

/// Call once at startup. Logs go to stderr so JSON output on stdout stays clean.
pub fn init_tracing(config: &LogConfig) {
    let filter = match directives(config) {
        Some(d) => EnvFilter::try_new(&d).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
