pub mod capture;

pub use capture::{capture_logs, CapturedEvent, CapturedLogs};

use std::str::FromStr;
use std::sync::Arc;

use mover_settings::LoggingSettings;
use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),

    #[error("invalid filter directives '{directives}': {message}")]
    InvalidFilter { directives: String, message: String },

    #[error("failed to install subscriber: {0}")]
    Init(String),

    #[error("failed to reload filter: {0}")]
    Reload(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "mover_engine::registry" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of compact text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    pub fn from_settings(settings: &LoggingSettings) -> Result<Self, TelemetryError> {
        let log_level = parse_level(&settings.level)?;
        let module_levels = settings
            .modules
            .iter()
            .map(|(module, level)| Ok((module.clone(), parse_level(level)?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;
        Ok(Self {
            log_level,
            module_levels,
            json: settings.json,
        })
    }
}

fn parse_level(s: &str) -> Result<Level, TelemetryError> {
    Level::from_str(s).map_err(|_| TelemetryError::InvalidLevel(s.to_string()))
}

/// Render filter directives: the base directive followed by one
/// `module=level` directive per override.
pub fn build_directives(base: &str, module_levels: &[(String, Level)]) -> String {
    let mut directives = base.to_string();
    for (module, level) in module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

fn make_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directives).map_err(|e| TelemetryError::InvalidFilter {
        directives: directives.to_string(),
        message: e.to_string(),
    })
}

/// Keeps the reloadable filter alive and allows runtime level changes.
pub struct TelemetryGuard {
    base: String,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: reload::Handle<EnvFilter, Registry>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), TelemetryError> {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            build_directives(&self.base, &levels)
        };
        let filter = make_filter(&directives)?;
        self.reload
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let base = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| config.log_level.to_string().to_lowercase());
    let filter = make_filter(&build_directives(&base, &config.module_levels))?;
    let (filter_layer, reload) = reload::Layer::new(filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    Ok(TelemetryGuard {
        base,
        level_filter: Arc::new(RwLock::new(config.module_levels)),
        reload,
    })
}
