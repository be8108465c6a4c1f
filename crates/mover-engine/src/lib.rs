//! # mover-engine
//!
//! Runs block-structure animations on a tick schedule.
//!
//! - [`registry::ActivityRegistry`] admits runs per structure, either one
//!   exclusive run or any number of shared (preview) runs
//! - [`run::AnimationRun`] is the per-animation state machine, finalized
//!   exactly once by commit or restore
//! - [`control::ControlContext`] is the single thread allowed to touch world
//!   state; [`scheduler::Scheduler`] drives ticks and continuations
//! - [`engine::AnimationEngine`] ties them together behind `toggle`

#![deny(unsafe_code)]

pub mod blocks;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod request;
pub mod run;
pub mod scheduler;
pub mod sim;
pub mod strategy;

pub use blocks::{AnimatedBlock, BlockManager, BlockManagerFactory};
pub use config::{AnimationConfig, RequestedDuration};
pub use control::{Completion, ControlContext};
pub use engine::{AnimationEngine, AnimationEngineBuilder, ToggleOutcome};
pub use error::{BlockError, EngineError, HookError, RegistryError, StrategyError};
pub use hooks::{AnimationHook, HookContext, HookDispatcher, HookFactory, HookRegistry, RunInfo};
pub use registry::{ActivityRegistry, RegisteredRun, TriggerVerifier};
pub use request::{AnimationRequest, AnimationRequestBuilder};
pub use run::{AnimationRun, AnimationState, RunStatus, StartOutcome};
pub use scheduler::{ManualScheduler, Scheduler, TaskHandle, TokioScheduler};
pub use strategy::{AnimationStrategy, StepInfo};
