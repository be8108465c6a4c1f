use std::sync::Arc;
use std::time::Duration;

use mover_core::errors::LockError;
use mover_core::events::{AccessMode, ActionType, Actor, ToggleCause};
use mover_core::structure::{Structure, StructureSnapshot};

use crate::config::RequestedDuration;
use crate::strategy::AnimationStrategy;

/// Everything needed to animate one structure once.
#[derive(Clone)]
pub struct AnimationRequest {
    pub structure: Arc<Structure>,
    /// State of the structure when the request was made.
    pub snapshot: StructureSnapshot,
    pub strategy: Arc<dyn AnimationStrategy>,
    pub cause: ToggleCause,
    pub action: ActionType,
    /// `None` uses the configured default.
    pub duration: Option<RequestedDuration>,
    pub skip_animation: bool,
    pub actor: Actor,
    pub mode: AccessMode,
}

impl AnimationRequest {
    pub fn builder(
        structure: Arc<Structure>,
        strategy: Arc<dyn AnimationStrategy>,
    ) -> AnimationRequestBuilder {
        AnimationRequestBuilder {
            structure,
            strategy,
            cause: ToggleCause::Server,
            action: ActionType::Toggle,
            duration: None,
            skip_animation: false,
            actor: Actor::server(),
            mode: AccessMode::Exclusive,
        }
    }
}

impl std::fmt::Debug for AnimationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationRequest")
            .field("structure_id", &self.snapshot.id)
            .field("strategy", &self.strategy.name())
            .field("cause", &self.cause)
            .field("action", &self.action)
            .field("duration", &self.duration)
            .field("skip_animation", &self.skip_animation)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

pub struct AnimationRequestBuilder {
    structure: Arc<Structure>,
    strategy: Arc<dyn AnimationStrategy>,
    cause: ToggleCause,
    action: ActionType,
    duration: Option<RequestedDuration>,
    skip_animation: bool,
    actor: Actor,
    mode: AccessMode,
}

impl AnimationRequestBuilder {
    pub fn cause(mut self, cause: ToggleCause) -> Self {
        self.cause = cause;
        self
    }

    pub fn action(mut self, action: ActionType) -> Self {
        self.action = action;
        self
    }

    pub fn duration_ticks(mut self, ticks: u32) -> Self {
        self.duration = Some(RequestedDuration::Ticks(ticks));
        self
    }

    pub fn duration(mut self, time: Duration) -> Self {
        self.duration = Some(RequestedDuration::Time(time));
        self
    }

    pub fn skip_animation(mut self, skip: bool) -> Self {
        self.skip_animation = skip;
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    /// Snapshot the structure under its read lock.
    pub fn build(self) -> Result<AnimationRequest, LockError> {
        let snapshot = self.structure.snapshot()?;
        Ok(AnimationRequest {
            structure: self.structure,
            snapshot,
            strategy: self.strategy,
            cause: self.cause,
            action: self.action,
            duration: self.duration,
            skip_animation: self.skip_animation,
            actor: self.actor,
            mode: self.mode,
        })
    }
}
