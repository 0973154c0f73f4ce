//! Tracing initialisation for the `marketsync` binary.

use std::collections::BTreeMap;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    pub level: String,
    /// Per-component overrides: crate name → level
    pub components: BTreeMap<String, String>,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `format` is `json` or anything else for text. The storage driver is
    /// held at `warn` unless overridden, sqlx logs every statement at `info`.
    pub fn new(level: &str, format: &str) -> Self {
        let mut components = BTreeMap::new();
        components.insert("sqlx".to_string(), "warn".to_string());
        Self {
            level: level.to_string(),
            components,
            json: format.eq_ignore_ascii_case("json"),
        }
    }

    /// Directive string for [`EnvFilter`], e.g. `info,sqlx=warn`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        for (component, level) in &self.components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber. Call once at startup. `RUST_LOG`, when
/// set, takes precedence over the configured directives.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}
