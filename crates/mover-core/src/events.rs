use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RunId, StructureId};
use crate::structure::StructureSnapshot;

/// Whether a run mutates the structure or only previews it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// At most one concurrent run per structure; commits the result.
    Exclusive,
    /// Any number of concurrent preview runs; never commits.
    Shared,
}

impl AccessMode {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Exclusive)
    }
}

/// What caused a toggle request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToggleCause {
    Player,
    Redstone,
    Command,
    Server,
}

/// The requested change to the structure's open flag.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Toggle,
    Open,
    Close,
}

impl ActionType {
    /// The open flag the structure has after this action completes.
    pub fn resolve_open(self, currently_open: bool) -> bool {
        match self {
            Self::Toggle => !currently_open,
            Self::Open => true,
            Self::Close => false,
        }
    }
}

/// Who is responsible for a toggle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub name: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    pub fn server() -> Self {
        Self {
            id: "server".into(),
            name: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToggleStartEvent {
    pub structure_id: StructureId,
    pub run_id: RunId,
    pub cause: ToggleCause,
    pub action: ActionType,
    pub actor: Actor,
    pub mode: AccessMode,
    pub duration_ticks: u32,
    pub skipped: bool,
    pub started_at: DateTime<Utc>,
}

/// Terminal summary of a run. Published exactly once per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToggleEndEvent {
    pub structure_id: StructureId,
    pub run_id: RunId,
    pub snapshot: StructureSnapshot,
    pub cause: ToggleCause,
    pub action: ActionType,
    pub actor: Actor,
    pub mode: AccessMode,
    pub duration_ticks: u32,
    pub skipped: bool,
    pub aborted: bool,
    pub finished_at: DateTime<Utc>,
}

/// Domain events published by the animation engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StructureEvent {
    #[serde(rename = "toggle_start")]
    ToggleStart(ToggleStartEvent),

    #[serde(rename = "toggle_end")]
    ToggleEnd(ToggleEndEvent),
}

impl StructureEvent {
    pub fn structure_id(&self) -> StructureId {
        match self {
            Self::ToggleStart(e) => e.structure_id,
            Self::ToggleEnd(e) => e.structure_id,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::ToggleStart(e) => &e.run_id,
            Self::ToggleEnd(e) => &e.run_id,
        }
    }
}
