use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoverSettings {
    pub animation: AnimationSettings,
    pub logging: LoggingSettings,
}

impl MoverSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.animation.tick_period_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "animation.tick_period_ms must be greater than zero".into(),
            ));
        }
        if !self.animation.finish_buffer_ticks.is_finite() {
            return Err(SettingsError::InvalidValue(
                "animation.finish_buffer_ticks must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// Timing of animation runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationSettings {
    /// Period between two ticks of a run.
    pub tick_period_ms: u64,
    /// Delay between a run starting and its first tick.
    pub start_delay_ms: u64,
    /// Extra ticks spent snapping blocks to their final position after the
    /// animated duration. Rounded; negative values count as zero.
    pub finish_buffer_ticks: f64,
    /// Duration used when a request does not carry one.
    pub default_duration_ticks: u32,
    /// Delay before re-validating a structure's trigger after it stopped.
    pub recheck_delay_ms: u64,
    /// Delay before re-validating triggers remembered across a restart.
    pub restart_recheck_delay_ms: u64,
}

impl Default for AnimationSettings {
    fn default() -> Self {
        Self {
            tick_period_ms: 50,
            start_delay_ms: 50,
            finish_buffer_ticks: 0.0,
            default_duration_ticks: 40,
            recheck_delay_ms: 100,
            restart_recheck_delay_ms: 2_000,
        }
    }
}

/// Log output configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"mover_engine::registry": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
