use std::fmt;

use serde::{Deserialize, Serialize};

/// The six extension points of an animation run, in lifecycle order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// Once, before blocks are materialised.
    Prepare,
    /// Every tick, before the step body.
    PreStep,
    /// Every tick, after the step body.
    PostStep,
    /// Once, when the run stops gracefully.
    Ending,
    /// Once, after an abort has been finalised.
    Aborted,
    /// Once, after finalisation, whatever the outcome.
    Completed,
}

impl HookPoint {
    pub const ALL: [Self; 6] = [
        Self::Prepare,
        Self::PreStep,
        Self::PostStep,
        Self::Ending,
        Self::Aborted,
        Self::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::PreStep => "pre_step",
            Self::PostStep => "post_step",
            Self::Ending => "ending",
            Self::Aborted => "aborted",
            Self::Completed => "completed",
        }
    }

    /// Whether the point fires on every tick rather than once per run.
    pub fn is_per_tick(&self) -> bool {
        matches!(self, Self::PreStep | Self::PostStep)
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
