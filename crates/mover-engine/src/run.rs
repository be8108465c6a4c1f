//! The per-animation state machine.
//!
//! A run is started once on the control context, stepped by a repeating
//! scheduled task, and finalized exactly once: either committing its blocks
//! to their final placement or restoring the originals. `started`,
//! `finalized`, `aborted` and `stopping` are one-shot atomic flags so that
//! racing callers (a natural stop against an external abort) resolve to a
//! single path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use mover_core::errors::LockError;
use mover_core::events::{
    AccessMode, ActionType, Actor, StructureEvent, ToggleCause, ToggleEndEvent, ToggleStartEvent,
};
use mover_core::geometry::{Cuboid, RegionTracker};
use mover_core::hooks::HookPoint;
use mover_core::ids::{RegistrationToken, RunId, StructureId};
use mover_core::structure::{Structure, StructureSnapshot};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::blocks::BlockManager;
use crate::config::{self, AnimationConfig};
use crate::control::ControlContext;
use crate::error::{panic_message, BlockError, EngineError};
use crate::hooks::{HookContext, HookDispatcher};
use crate::registry::{ActivityRegistry, RegisteredRun, TriggerVerifier};
use crate::request::AnimationRequest;
use crate::scheduler::{spawn_logged, Scheduler, TaskHandle};
use crate::strategy::{AnimationStrategy, StepInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationState {
    Pending,
    Active,
    Skipped,
    Finishing,
    Stopping,
    Completed,
}

impl AnimationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Completed)
    }
}

/// Result of [`AnimationRun::start`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Active,
    Skipped,
    SetupFailed,
    /// The run was aborted before it could start.
    Aborted,
}

/// Point-in-time view of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub structure_id: StructureId,
    pub state: AnimationState,
    pub steps_executed: u32,
    pub ticks: u32,
    pub duration: u32,
    pub stop_count: u32,
    pub perpetual: bool,
    pub region: Option<Cuboid>,
    /// Region the blocks occupied when the run was stopped.
    pub stopped_region: Option<Cuboid>,
    pub aborted: bool,
    pub finalized: bool,
}

/// Collaborators shared by every run of an engine.
#[derive(Clone)]
pub struct RunServices {
    pub control: Arc<ControlContext>,
    pub scheduler: Arc<dyn Scheduler>,
    pub registry: Weak<ActivityRegistry>,
    pub verifier: Option<Arc<dyn TriggerVerifier>>,
    pub config: AnimationConfig,
}

pub struct AnimationRun {
    weak_self: Weak<AnimationRun>,
    run_id: RunId,
    token: RegistrationToken,
    structure: Arc<Structure>,
    snapshot: StructureSnapshot,
    strategy: Arc<dyn AnimationStrategy>,
    blocks: Arc<dyn BlockManager>,
    hooks: HookDispatcher,
    services: RunServices,
    mode: AccessMode,
    cause: ToggleCause,
    action: ActionType,
    actor: Actor,
    duration: u32,
    stop_count: u32,
    perpetual: bool,
    skip_animation: bool,

    state: Mutex<AnimationState>,
    started: AtomicBool,
    finalized: AtomicBool,
    aborted: AtomicBool,
    stopping: AtomicBool,
    ticks: AtomicU32,
    steps_executed: AtomicU32,
    tick_failures: AtomicU32,
    tick_task: Mutex<Option<TaskHandle>>,
    region: Mutex<Option<Cuboid>>,
    stopped_region: Mutex<Option<Cuboid>>,
}

impl AnimationRun {
    pub fn new(
        run_id: RunId,
        token: RegistrationToken,
        request: AnimationRequest,
        blocks: Arc<dyn BlockManager>,
        hooks: HookDispatcher,
        services: RunServices,
    ) -> Arc<Self> {
        let duration = services.config.resolve_duration(request.duration);
        let stop_count = config::stop_count(
            duration,
            services.config.finish_buffer(),
            request.strategy.has_final_position(),
        );
        let perpetual = request.strategy.is_perpetual();
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            run_id,
            token,
            structure: request.structure,
            snapshot: request.snapshot,
            strategy: request.strategy,
            blocks,
            hooks,
            services,
            mode: request.mode,
            cause: request.cause,
            action: request.action,
            actor: request.actor,
            duration,
            stop_count,
            perpetual,
            skip_animation: request.skip_animation,
            state: Mutex::new(AnimationState::Pending),
            started: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            ticks: AtomicU32::new(0),
            steps_executed: AtomicU32::new(0),
            tick_failures: AtomicU32::new(0),
            tick_task: Mutex::new(None),
            region: Mutex::new(None),
            stopped_region: Mutex::new(None),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn structure_id(&self) -> StructureId {
        self.snapshot.id
    }

    pub fn token(&self) -> RegistrationToken {
        self.token
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn state(&self) -> AnimationState {
        *self.state.lock()
    }

    pub fn duration(&self) -> u32 {
        self.duration
    }

    pub fn stop_count(&self) -> u32 {
        self.stop_count
    }

    pub fn steps_executed(&self) -> u32 {
        self.steps_executed.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id.clone(),
            structure_id: self.snapshot.id,
            state: self.state(),
            steps_executed: self.steps_executed(),
            ticks: self.ticks.load(Ordering::Acquire),
            duration: self.duration,
            stop_count: self.stop_count,
            perpetual: self.perpetual,
            region: *self.region.lock(),
            stopped_region: *self.stopped_region.lock(),
            aborted: self.is_aborted(),
            finalized: self.is_finalized(),
        }
    }

    /// Create the blocks and begin ticking. Must run on the control context,
    /// and only once.
    ///
    /// Setup failures are handled here: originals are restored, the registry
    /// slot is released and `SetupFailed` is returned.
    pub fn start(&self) -> Result<StartOutcome, EngineError> {
        self.services.control.assert_current("AnimationRun::start")?;
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::AlreadyStarted(self.run_id.clone()));
        }
        if self.is_aborted() {
            return Ok(StartOutcome::Aborted);
        }

        self.dispatch(HookPoint::Prepare, 0);

        let setup = catch_unwind(AssertUnwindSafe(|| self.setup()))
            .unwrap_or_else(|payload| Err(EngineError::Panic(panic_message(&*payload))));
        let animate = match setup {
            Ok(animate) => animate,
            Err(e) => {
                self.fail_setup(&e);
                return Ok(StartOutcome::SetupFailed);
            }
        };

        if !animate {
            self.set_state(AnimationState::Skipped);
            self.publish_start(true);
            info!(structure_id = %self.snapshot.id, run_id = %self.run_id, "animation skipped");
            self.finalize(false);
            return Ok(StartOutcome::Skipped);
        }

        self.set_state(AnimationState::Active);
        self.publish_start(false);

        let weak = self.weak_self.clone();
        let task = self.services.scheduler.schedule_repeating(
            self.services.config.start_delay,
            self.services.config.tick_period,
            Box::new(move || {
                if let Some(run) = weak.upgrade() {
                    run.tick();
                }
            }),
        );
        *self.tick_task.lock() = Some(task.clone());
        // an abort racing with setup or scheduling found no task to cancel
        if self.is_aborted() {
            task.cancel();
            self.set_state(AnimationState::Completed);
            return Ok(StartOutcome::Aborted);
        }

        info!(
            structure_id = %self.snapshot.id,
            run_id = %self.run_id,
            mode = ?self.mode,
            duration = self.duration,
            stop_count = self.stop_count,
            perpetual = self.perpetual,
            "animation started"
        );
        Ok(StartOutcome::Active)
    }

    /// Returns whether the run animates (false: skip straight to finalize).
    fn setup(&self) -> Result<bool, EngineError> {
        self.blocks
            .create_blocks(&self.snapshot, self.strategy.as_ref())?;
        if self.skip_animation || self.blocks.blocks().is_empty() {
            if self.mode.is_exclusive() {
                self.blocks.remove_original_blocks()?;
            }
            return Ok(false);
        }
        self.blocks.spawn_blocks()?;
        if self.mode.is_exclusive() {
            self.blocks.remove_original_blocks()?;
        }
        *self.region.lock() = self.blocks.region();
        Ok(true)
    }

    fn fail_setup(&self, cause: &EngineError) {
        error!(
            structure_id = %self.snapshot.id,
            run_id = %self.run_id,
            error = %cause,
            "animation setup failed, restoring original blocks"
        );
        self.aborted.store(true, Ordering::Release);
        if let Err(e) = self.blocks.restore_on_failure() {
            error!(structure_id = %self.snapshot.id, error = %e, "restore after setup failure failed");
        }
        if self
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.set_state(AnimationState::Completed);
            self.report_finished(true);
        }
    }

    fn tick(&self) {
        if self.is_aborted() || self.stopping.load(Ordering::Acquire) {
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| self.tick_body())) {
            Ok(Ok(())) => self.tick_failures.store(0, Ordering::Relaxed),
            Ok(Err(e)) => {
                let failures = self.tick_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    structure_id = %self.snapshot.id,
                    run_id = %self.run_id,
                    consecutive_failures = failures,
                    error = %e,
                    "animation tick failed"
                );
            }
            Err(payload) => {
                let failures = self.tick_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    structure_id = %self.snapshot.id,
                    run_id = %self.run_id,
                    consecutive_failures = failures,
                    panic = %panic_message(&*payload),
                    "animation tick panicked"
                );
            }
        }
    }

    fn tick_body(&self) -> Result<(), EngineError> {
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        self.dispatch(HookPoint::PreStep, tick);

        let outcome = if self.perpetual || tick <= self.duration {
            self.step(tick).map(|()| {
                self.steps_executed.store(tick, Ordering::Release);
            })
        } else if tick <= self.stop_count {
            self.snap_to_final();
            self.set_state(AnimationState::Finishing);
            Ok(())
        } else {
            self.stop_animation();
            Ok(())
        };

        self.dispatch(HookPoint::PostStep, tick);
        outcome
    }

    fn step(&self, tick: u32) -> Result<(), EngineError> {
        let info = StepInfo {
            step: tick,
            duration: self.duration,
        };
        self.strategy.begin_step(info)?;
        let mut tracker = RegionTracker::new();
        for block in self.blocks.blocks() {
            let target = self.strategy.target(block.as_ref(), info)?;
            block.move_to(target);
            tracker.include(target, block.extent());
        }
        *self.region.lock() = tracker.cuboid();
        Ok(())
    }

    fn snap_to_final(&self) {
        let mut tracker = RegionTracker::new();
        for block in self.blocks.blocks() {
            let target = block.final_position();
            block.move_to(target);
            tracker.include(target, block.extent());
        }
        *self.region.lock() = tracker.cuboid();
    }

    /// End the run gracefully, committing its blocks.
    ///
    /// A run that has not started yet has nothing to commit and is aborted
    /// instead.
    pub fn stop_animation(&self) {
        match self.state() {
            state if state.is_terminal() => return,
            AnimationState::Pending => {
                debug!(
                    structure_id = %self.snapshot.id,
                    run_id = %self.run_id,
                    "stop requested before start, aborting"
                );
                self.abort(false);
                return;
            }
            _ => {}
        }
        if self
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let captured = *self.region.lock();
        *self.stopped_region.lock() = captured;
        self.set_state(AnimationState::Stopping);
        self.dispatch(HookPoint::Ending, self.ticks.load(Ordering::Acquire));

        self.finalize(false);
        if let Some(task) = self.tick_task.lock().take() {
            task.cancel();
        }
        self.set_state(AnimationState::Completed);
        *self.region.lock() = Some(self.snapshot.cuboid);
        debug!(
            structure_id = %self.snapshot.id,
            run_id = %self.run_id,
            steps = self.steps_executed(),
            "animation stopped"
        );
        self.schedule_trigger_recheck();
    }

    /// Cancel the run and restore the original blocks. Safe before start and
    /// after the run finished.
    pub fn abort(&self, blocking: bool) {
        if self.is_finalized() || self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.tick_task.lock().take() {
            task.cancel();
        }
        self.finalize(blocking);
        self.dispatch(HookPoint::Aborted, self.ticks.load(Ordering::Acquire));
        {
            let mut state = self.state.lock();
            if *state != AnimationState::Skipped {
                *state = AnimationState::Completed;
            }
        }
        info!(structure_id = %self.snapshot.id, run_id = %self.run_id, blocking, "animation aborted");
    }

    /// Place the blocks and release the run. First caller wins.
    fn finalize(&self, blocking: bool) {
        if self
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let aborted = self.is_aborted();
        let blocks = Arc::clone(&self.blocks);
        let placement = self.services.control.submit(move || {
            if aborted {
                blocks.restore_on_failure()
            } else {
                blocks.commit_to_final()
            }
        });

        if blocking {
            self.log_placement(placement.wait());
            self.complete(aborted);
            return;
        }
        let Some(run) = self.weak_self.upgrade() else {
            return;
        };
        spawn_logged(self.services.scheduler.as_ref(), "finalize", async move {
            run.log_placement(placement.await);
            run.complete(aborted);
            Ok(())
        });
    }

    fn log_placement(&self, result: Result<Result<(), BlockError>, EngineError>) {
        let error = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        error!(
            structure_id = %self.snapshot.id,
            run_id = %self.run_id,
            error = %error,
            "block placement failed"
        );
    }

    fn complete(&self, aborted: bool) {
        if self.mode.is_exclusive() && !aborted {
            if let Err(e) = self.commit_structure() {
                error!(structure_id = %self.snapshot.id, error = %e, "failed to commit structure state");
            }
        }
        self.dispatch(HookPoint::Completed, self.ticks.load(Ordering::Acquire));
        self.report_finished(aborted);
    }

    fn commit_structure(&self) -> Result<(), LockError> {
        let mut state = self.structure.write()?;
        state.is_open = self.action.resolve_open(self.snapshot.is_open);
        state.cuboid = self.strategy.final_cuboid(&self.snapshot);
        Ok(())
    }

    fn report_finished(&self, aborted: bool) {
        let summary = ToggleEndEvent {
            structure_id: self.snapshot.id,
            run_id: self.run_id.clone(),
            snapshot: self.snapshot.clone(),
            cause: self.cause,
            action: self.action,
            actor: self.actor.clone(),
            mode: self.mode,
            duration_ticks: self.duration,
            skipped: self.state() == AnimationState::Skipped,
            aborted,
            finished_at: Utc::now(),
        };
        let Some(registry) = self.services.registry.upgrade() else {
            debug!(run_id = %self.run_id, "registry dropped before run finished");
            return;
        };
        if let Err(e) = registry.process_finished_run(self.token, self, summary) {
            error!(run_id = %self.run_id, error = %e, "registry rejected finished run");
        }
    }

    fn publish_start(&self, skipped: bool) {
        if let Some(registry) = self.services.registry.upgrade() {
            registry.publish(StructureEvent::ToggleStart(ToggleStartEvent {
                structure_id: self.snapshot.id,
                run_id: self.run_id.clone(),
                cause: self.cause,
                action: self.action,
                actor: self.actor.clone(),
                mode: self.mode,
                duration_ticks: self.duration,
                skipped,
                started_at: Utc::now(),
            }));
        }
    }

    fn schedule_trigger_recheck(&self) {
        if !self.needs_recheck() {
            return;
        }
        let Some(verifier) = self.services.verifier.clone() else {
            return;
        };
        let structure_id = self.snapshot.id;
        let _ = self.services.scheduler.spawn_delayed(
            self.services.config.recheck_delay,
            Box::pin(async move {
                if let Err(e) = verifier.verify(structure_id).await {
                    warn!(%structure_id, error = %e, "trigger re-check failed");
                }
            }),
        );
    }

    fn set_state(&self, state: AnimationState) {
        *self.state.lock() = state;
    }

    fn dispatch(&self, point: HookPoint, step: u32) {
        if self.hooks.is_empty() {
            return;
        }
        self.hooks.dispatch(&HookContext {
            point,
            structure_id: self.snapshot.id,
            run_id: self.run_id.clone(),
            step,
            state: self.state(),
            timestamp: Utc::now(),
        });
    }
}

impl RegisteredRun for AnimationRun {
    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn structure_id(&self) -> StructureId {
        self.snapshot.id
    }

    fn mode(&self) -> AccessMode {
        self.mode
    }

    fn abort(&self, blocking: bool) {
        AnimationRun::abort(self, blocking);
    }

    fn request_stop(&self) {
        self.stop_animation();
    }

    fn is_aborted(&self) -> bool {
        AnimationRun::is_aborted(self)
    }

    fn needs_recheck(&self) -> bool {
        self.mode.is_exclusive() && self.snapshot.has_trigger()
    }
}

impl std::fmt::Debug for AnimationRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationRun")
            .field("run_id", &self.run_id)
            .field("structure_id", &self.snapshot.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
