use std::any::Any;

use mover_core::errors::LockError;
use mover_core::ids::{RegistrationToken, RunId, StructureId};

/// Protocol violations of the activity registry. These indicate caller bugs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no registration entry for {0}")]
    NoEntry(StructureId),

    #[error("token mismatch for {structure_id}: entry holds {expected}, caller presented {actual}")]
    TokenMismatch {
        structure_id: StructureId,
        expected: RegistrationToken,
        actual: RegistrationToken,
    },

    #[error("exclusive entry for {0} already holds a run")]
    ExclusiveOccupied(StructureId),

    #[error("run {run_id} is not tracked for {structure_id}")]
    UntrackedRun {
        structure_id: StructureId,
        run_id: RunId,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("failed to create blocks: {0}")]
    Create(String),

    #[error("failed to spawn blocks: {0}")]
    Spawn(String),

    #[error("failed to remove original blocks: {0}")]
    RemoveOriginals(String),

    #[error("failed to place blocks: {0}")]
    Placement(String),
}

#[derive(Debug, thiserror::Error)]
#[error("strategy {strategy} failed at step {step}: {message}")]
pub struct StrategyError {
    pub strategy: String,
    pub step: u32,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("block error: {0}")]
    Block(#[from] BlockError),

    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("{operation} must run on the control context")]
    WrongContext { operation: &'static str },

    #[error("run {0} was already started")]
    AlreadyStarted(RunId),

    #[error("control job did not complete (panicked or context shut down)")]
    JobAbandoned,

    #[error("failed to spawn control thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("panic: {0}")]
    Panic(String),
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
