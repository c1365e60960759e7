//! Tracing Subscriber Initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` (from
//! `RUST_LOG`, falling back to the configured directive) and either a JSON or
//! a human-readable fmt layer.

use once_cell::sync::OnceCell;
use prism_core::{ConfigError, PrismResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event.
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Emit JSON lines instead of the pretty format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("PRISM_SERVICE_NAME")
                .unwrap_or_else(|_| "prism".to_string()),
            default_filter: "prism_orchestrator=info,prism_storage=info,warn".to_string(),
            json: std::env::var("PRISM_LOG_FORMAT")
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

impl TelemetryConfig {
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Initialize the global tracing subscriber.
///
/// Calling it again after a successful initialization is a no-op.
///
/// # Errors
///
/// `ConfigError` when another subscriber was installed by someone else.
pub fn init_tracing(config: &TelemetryConfig) -> PrismResult<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ConfigError::Parse {
        reason: format!("Failed to init subscriber: {}", e),
    })?;
    let _ = INITIALIZED.set(());

    tracing::info!(
        service_name = %config.service_name,
        json = config.json,
        "Telemetry initialized"
    );
    Ok(())
}
