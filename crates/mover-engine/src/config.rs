use std::time::Duration;

use mover_settings::AnimationSettings;

/// Duration requested for a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestedDuration {
    Ticks(u32),
    Time(Duration),
}

/// Timing parameters of animation runs.
#[derive(Clone, Debug, PartialEq)]
pub struct AnimationConfig {
    pub tick_period: Duration,
    pub start_delay: Duration,
    pub finish_buffer_ticks: f64,
    pub default_duration_ticks: u32,
    pub recheck_delay: Duration,
    pub restart_recheck_delay: Duration,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self::from(&AnimationSettings::default())
    }
}

impl From<&AnimationSettings> for AnimationConfig {
    fn from(s: &AnimationSettings) -> Self {
        Self {
            tick_period: Duration::from_millis(s.tick_period_ms.max(1)),
            start_delay: Duration::from_millis(s.start_delay_ms),
            finish_buffer_ticks: s.finish_buffer_ticks,
            default_duration_ticks: s.default_duration_ticks,
            recheck_delay: Duration::from_millis(s.recheck_delay_ms),
            restart_recheck_delay: Duration::from_millis(s.restart_recheck_delay_ms),
        }
    }
}

impl AnimationConfig {
    /// Number of ticks a run lasts. Wall-clock durations round up to whole ticks.
    pub fn resolve_duration(&self, requested: Option<RequestedDuration>) -> u32 {
        match requested {
            None => self.default_duration_ticks,
            Some(RequestedDuration::Ticks(ticks)) => ticks,
            Some(RequestedDuration::Time(time)) => {
                let period = self.tick_period.as_nanos().max(1);
                u32::try_from(time.as_nanos().div_ceil(period)).unwrap_or(u32::MAX)
            }
        }
    }

    /// Finish buffer rounded to whole ticks, never negative.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn finish_buffer(&self) -> u32 {
        let rounded = self.finish_buffer_ticks.round();
        if rounded.is_finite() && rounded > 0.0 {
            rounded as u32
        } else {
            0
        }
    }
}

/// Tick index after which a run is stopped.
///
/// Structures without a final position get no finishing buffer.
pub fn stop_count(duration: u32, finish_buffer: u32, has_final_position: bool) -> u32 {
    if has_final_position {
        duration.saturating_add(finish_buffer)
    } else {
        duration
    }
}
