use std::sync::Arc;

use mover_core::events::StructureEvent;
use mover_core::ids::{RunId, StructureId};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::blocks::BlockManagerFactory;
use crate::config::AnimationConfig;
use crate::control::ControlContext;
use crate::error::{EngineError, RegistryError};
use crate::hooks::{HookRegistry, RunInfo};
use crate::registry::{ActivityRegistry, TriggerVerifier};
use crate::request::AnimationRequest;
use crate::run::{AnimationRun, RunServices, StartOutcome};
use crate::scheduler::{Scheduler, TokioScheduler};

const CONTROL_THREAD_NAME: &str = "mover-control";

/// Result of [`AnimationEngine::toggle`].
#[derive(Debug)]
pub enum ToggleOutcome {
    /// The run is animating.
    Started(Arc<AnimationRun>),
    /// The run finished without animating.
    Skipped(RunId),
    /// Another run holds the structure.
    Busy,
    SetupFailed(RunId),
    /// The run was evicted or aborted before it started.
    Aborted(RunId),
}

impl ToggleOutcome {
    pub fn run(&self) -> Option<&Arc<AnimationRun>> {
        match self {
            Self::Started(run) => Some(run),
            _ => None,
        }
    }
}

/// Entry point: admits, builds and starts animation runs.
pub struct AnimationEngine {
    control: Arc<ControlContext>,
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<ActivityRegistry>,
    hooks: Arc<HookRegistry>,
    block_managers: Arc<dyn BlockManagerFactory>,
    verifier: Option<Arc<dyn TriggerVerifier>>,
    config: AnimationConfig,
}

pub struct AnimationEngineBuilder {
    config: AnimationConfig,
    block_managers: Arc<dyn BlockManagerFactory>,
    control: Option<Arc<ControlContext>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    hooks: Option<Arc<HookRegistry>>,
    verifier: Option<Arc<dyn TriggerVerifier>>,
}

impl AnimationEngineBuilder {
    pub fn control(mut self, control: Arc<ControlContext>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn TriggerVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Build the engine. Without an explicit scheduler this must be called
    /// inside a tokio runtime.
    pub fn build(self) -> Result<AnimationEngine, EngineError> {
        let control = match self.control {
            Some(control) => control,
            None => ControlContext::spawn(CONTROL_THREAD_NAME)?,
        };
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::current()));
        let registry = Arc::new(ActivityRegistry::new(
            Arc::clone(&scheduler),
            self.verifier.clone(),
            self.config.restart_recheck_delay,
        ));
        Ok(AnimationEngine {
            control,
            scheduler,
            registry,
            hooks: self.hooks.unwrap_or_default(),
            block_managers: self.block_managers,
            verifier: self.verifier,
            config: self.config,
        })
    }
}

impl AnimationEngine {
    pub fn builder(
        config: AnimationConfig,
        block_managers: Arc<dyn BlockManagerFactory>,
    ) -> AnimationEngineBuilder {
        AnimationEngineBuilder {
            config,
            block_managers,
            control: None,
            scheduler: None,
            hooks: None,
            verifier: None,
        }
    }

    /// Admit, build and start a run for the requested structure.
    pub async fn toggle(&self, request: AnimationRequest) -> Result<ToggleOutcome, EngineError> {
        let structure_id = request.snapshot.id;
        let Some(token) = self.registry.register_animation(structure_id, request.mode) else {
            return Ok(ToggleOutcome::Busy);
        };

        let run_id = RunId::new();
        let duration_ticks = self.config.resolve_duration(request.duration);
        let hooks = self.hooks.instantiate(&RunInfo {
            structure_id,
            run_id: run_id.clone(),
            mode: request.mode,
            kind: request.snapshot.kind.clone(),
            duration_ticks,
        });
        let blocks = self.block_managers.create(request.mode);
        let run = AnimationRun::new(run_id.clone(), token, request, blocks, hooks, self.services());

        match self.registry.add_run(token, run.clone()) {
            Ok(()) => {}
            // an exclusive admission evicted the reservation
            Err(RegistryError::NoEntry(_) | RegistryError::TokenMismatch { .. }) => {
                info!(%structure_id, %token, %run_id, "reservation evicted before the run was attached");
                return Ok(ToggleOutcome::Aborted(run_id));
            }
            Err(e) => {
                error!(%structure_id, %token, error = %e, "failed to attach run, releasing reservation");
                if let Err(release) = self.registry.unregister_animation(structure_id, token) {
                    error!(%structure_id, error = %release, "failed to release reservation");
                }
                return Err(e.into());
            }
        }

        let starting = Arc::clone(&run);
        let outcome = match self.control.submit(move || starting.start()).await {
            Ok(outcome) => outcome?,
            Err(e) => {
                error!(%structure_id, %run_id, error = %e, "run never reached the control context");
                run.abort(true);
                return Err(e);
            }
        };
        debug!(%structure_id, %run_id, ?outcome, "toggle handled");
        Ok(match outcome {
            StartOutcome::Active => ToggleOutcome::Started(run),
            StartOutcome::Skipped => ToggleOutcome::Skipped(run_id),
            StartOutcome::SetupFailed => ToggleOutcome::SetupFailed(run_id),
            StartOutcome::Aborted => ToggleOutcome::Aborted(run_id),
        })
    }

    /// Gracefully stop the exclusive run of a structure.
    pub fn stop(&self, structure_id: StructureId) -> bool {
        self.registry.stop_exclusive(structure_id)
    }

    pub fn stop_all(&self, structure_id: StructureId) -> usize {
        self.registry.stop_all(structure_id)
    }

    pub fn structure_deleted(&self, structure_id: StructureId) -> bool {
        self.registry.on_structure_deleted(structure_id)
    }

    /// Abort every run and reject new ones until [`Self::initialize`].
    pub fn shutdown(&self) {
        info!("animation engine shutting down");
        self.registry.shutdown();
    }

    pub fn initialize(&self) {
        self.registry.initialize();
        info!("animation engine initialized");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StructureEvent> {
        self.registry.subscribe()
    }

    pub fn registry(&self) -> &Arc<ActivityRegistry> {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn control(&self) -> &Arc<ControlContext> {
        &self.control
    }

    pub fn config(&self) -> &AnimationConfig {
        &self.config
    }

    fn services(&self) -> RunServices {
        RunServices {
            control: Arc::clone(&self.control),
            scheduler: Arc::clone(&self.scheduler),
            registry: Arc::downgrade(&self.registry),
            verifier: self.verifier.clone(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HookError;
    use crate::hooks::{AnimationHook, HookContext, HookFactory};
    use crate::run::AnimationState;
    use crate::scheduler::ManualScheduler;
    use crate::sim::{SimBlockManagerFactory, SimFailure, SlideStrategy, SpinStrategy};
    use mover_core::events::AccessMode;
    use mover_core::geometry::{BlockPos, Cuboid, Vec3};
    use mover_core::hooks::HookPoint;
    use mover_core::structure::{Structure, StructureState};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn structure(id: u64) -> Arc<Structure> {
        Arc::new(Structure::new(
            StructureId(id),
            StructureState {
                name: format!("door {id}"),
                kind: "sliding_door".into(),
                is_open: false,
                cuboid: Cuboid::new(BlockPos::new(0, 64, 0), BlockPos::new(1, 66, 0)),
                rotation_point: BlockPos::new(0, 64, 0),
                power_block: None,
            },
        ))
    }

    fn slide(id: u64, mode: AccessMode, ticks: u32) -> AnimationRequest {
        AnimationRequest::builder(structure(id), Arc::new(SlideStrategy::new(0, 3, 0)))
            .mode(mode)
            .duration_ticks(ticks)
            .build()
            .unwrap()
    }

    fn manual_engine() -> (AnimationEngine, Arc<ManualScheduler>, Arc<SimBlockManagerFactory>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let factory = Arc::new(SimBlockManagerFactory::new());
        let engine = AnimationEngine::builder(AnimationConfig::default(), factory.clone())
            .scheduler(scheduler.clone())
            .build()
            .unwrap();
        (engine, scheduler, factory)
    }

    struct Counting(Arc<Mutex<Vec<HookPoint>>>);

    impl AnimationHook for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn execute(&self, ctx: &HookContext) -> Result<(), HookError> {
            self.0.lock().push(ctx.point);
            Ok(())
        }
    }

    struct CountingFactory(Arc<Mutex<Vec<HookPoint>>>);

    impl HookFactory for CountingFactory {
        fn name(&self) -> &str {
            "counting"
        }

        fn create(&self, _run: &RunInfo) -> Option<Box<dyn AnimationHook>> {
            Some(Box::new(Counting(Arc::clone(&self.0))))
        }
    }

    #[tokio::test]
    async fn toggle_runs_to_completion() {
        let (engine, scheduler, factory) = manual_engine();
        let points = Arc::new(Mutex::new(Vec::new()));
        engine
            .hooks()
            .register(Arc::new(CountingFactory(Arc::clone(&points))));
        let mut events = engine.subscribe();

        let outcome = engine.toggle(slide(1, AccessMode::Exclusive, 4)).await.unwrap();
        let run = Arc::clone(outcome.run().unwrap());
        assert_eq!(run.state(), AnimationState::Active);
        assert!(engine.registry().is_busy(StructureId(1)));

        scheduler.advance_by(5);
        assert_eq!(run.state(), AnimationState::Completed);
        assert!(!engine.registry().is_busy(StructureId(1)));
        assert_eq!(factory.last().unwrap().commits(), 1);
        assert_eq!(points.lock().first(), Some(&HookPoint::Prepare));
        assert!(points.lock().contains(&HookPoint::Completed));

        assert!(matches!(events.try_recv(), Ok(StructureEvent::ToggleStart(_))));
        assert!(matches!(events.try_recv(), Ok(StructureEvent::ToggleEnd(_))));
    }

    #[tokio::test]
    async fn busy_structure_is_rejected() {
        let (engine, _scheduler, _) = manual_engine();
        let first = engine.toggle(slide(2, AccessMode::Exclusive, 10)).await.unwrap();
        assert!(matches!(first, ToggleOutcome::Started(_)));
        let second = engine.toggle(slide(2, AccessMode::Exclusive, 10)).await.unwrap();
        assert!(matches!(second, ToggleOutcome::Busy));
        let preview = engine.toggle(slide(2, AccessMode::Shared, 10)).await.unwrap();
        assert!(matches!(preview, ToggleOutcome::Busy));
    }

    #[tokio::test]
    async fn exclusive_toggle_evicts_previews() {
        let (engine, _scheduler, factory) = manual_engine();
        let a = engine.toggle(slide(3, AccessMode::Shared, 10)).await.unwrap();
        let b = engine.toggle(slide(3, AccessMode::Shared, 10)).await.unwrap();
        let shared_token = engine.registry().token_of(StructureId(3)).unwrap();
        assert_eq!(engine.registry().member_count(StructureId(3)), 2);

        let exclusive = engine.toggle(slide(3, AccessMode::Exclusive, 10)).await.unwrap();
        assert!(matches!(exclusive, ToggleOutcome::Started(_)));
        assert_ne!(engine.registry().token_of(StructureId(3)), Some(shared_token));
        assert!(a.run().unwrap().is_aborted());
        assert!(b.run().unwrap().is_aborted());

        let managers = factory.created();
        assert_eq!(managers[0].restores(), 1);
        assert_eq!(managers[1].restores(), 1);
        assert_eq!(engine.registry().member_count(StructureId(3)), 1);
    }

    #[tokio::test]
    async fn setup_failure_releases_slot() {
        let (engine, _scheduler, factory) = manual_engine();
        factory.fail_on(Some(SimFailure::Create));
        let outcome = engine.toggle(slide(4, AccessMode::Exclusive, 10)).await.unwrap();
        assert!(matches!(outcome, ToggleOutcome::SetupFailed(_)));
        assert!(!engine.registry().is_busy(StructureId(4)));

        factory.fail_on(None);
        let retry = engine.toggle(slide(4, AccessMode::Exclusive, 10)).await.unwrap();
        assert!(matches!(retry, ToggleOutcome::Started(_)));
    }

    /// Admits an exclusive run on the structure while a toggle is between
    /// admission and attachment.
    struct Interloper {
        registry: Arc<ActivityRegistry>,
        fired: Mutex<bool>,
    }

    impl HookFactory for Interloper {
        fn name(&self) -> &str {
            "interloper"
        }

        fn create(&self, run: &RunInfo) -> Option<Box<dyn AnimationHook>> {
            let mut fired = self.fired.lock();
            if !*fired {
                *fired = true;
                let _ = self
                    .registry
                    .register_animation(run.structure_id, AccessMode::Exclusive);
            }
            None
        }
    }

    #[tokio::test]
    async fn preview_evicted_before_attach_is_aborted() {
        let (engine, _scheduler, _) = manual_engine();
        engine.hooks().register(Arc::new(Interloper {
            registry: Arc::clone(engine.registry()),
            fired: Mutex::new(false),
        }));

        let outcome = engine.toggle(slide(30, AccessMode::Shared, 10)).await.unwrap();
        assert!(matches!(outcome, ToggleOutcome::Aborted(_)));
        assert_eq!(engine.registry().mode_of(StructureId(30)), Some(AccessMode::Exclusive));
        assert_eq!(engine.registry().member_count(StructureId(30)), 0);
    }

    #[tokio::test]
    async fn closed_control_context_releases_structure() {
        let (engine, _scheduler, factory) = manual_engine();
        engine.control().shutdown();

        let result = engine.toggle(slide(31, AccessMode::Exclusive, 10)).await;
        assert!(matches!(result, Err(EngineError::JobAbandoned)));
        assert!(!engine.registry().is_busy(StructureId(31)));
        assert_eq!(factory.last().unwrap().spawns(), 0);
    }

    #[tokio::test]
    async fn skip_toggle_commits_immediately() {
        let (engine, scheduler, _) = manual_engine();
        let structure = structure(5);
        let request = AnimationRequest::builder(Arc::clone(&structure), Arc::new(SlideStrategy::new(0, 3, 0)))
            .skip_animation(true)
            .build()
            .unwrap();
        let outcome = engine.toggle(request).await.unwrap();
        assert!(matches!(outcome, ToggleOutcome::Skipped(_)));
        assert_eq!(scheduler.live_tasks(), 0);
        assert!(structure.snapshot().unwrap().is_open);
    }

    #[tokio::test]
    async fn stop_and_delete() {
        let (engine, _scheduler, factory) = manual_engine();
        let spin = AnimationRequest::builder(structure(6), Arc::new(SpinStrategy::new(Vec3::new(0.5, 65.0, 0.5), 40)))
            .build()
            .unwrap();
        let outcome = engine.toggle(spin).await.unwrap();
        let run = Arc::clone(outcome.run().unwrap());
        assert!(engine.stop(StructureId(6)));
        assert_eq!(run.state(), AnimationState::Completed);
        assert!(!run.is_aborted());

        let _ = engine.toggle(slide(7, AccessMode::Exclusive, 10)).await.unwrap();
        assert!(engine.structure_deleted(StructureId(7)));
        assert_eq!(factory.last().unwrap().restores(), 1);
        assert!(!engine.structure_deleted(StructureId(7)));
    }

    #[tokio::test]
    async fn shutdown_then_initialize() {
        let (engine, _scheduler, factory) = manual_engine();
        let _ = engine.toggle(slide(8, AccessMode::Exclusive, 10)).await.unwrap();
        engine.shutdown();
        assert_eq!(factory.last().unwrap().restores(), 1);
        assert!(matches!(
            engine.toggle(slide(9, AccessMode::Exclusive, 10)).await.unwrap(),
            ToggleOutcome::Busy
        ));
        engine.initialize();
        assert!(matches!(
            engine.toggle(slide(9, AccessMode::Exclusive, 10)).await.unwrap(),
            ToggleOutcome::Started(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn real_time_run_publishes_end_event() {
        let mut config = AnimationConfig::default();
        config.tick_period = Duration::from_millis(5);
        config.start_delay = Duration::from_millis(5);
        let factory = Arc::new(SimBlockManagerFactory::new());
        let engine = AnimationEngine::builder(config, factory.clone()).build().unwrap();
        let mut events = engine.subscribe();

        let structure = structure(10);
        let request = AnimationRequest::builder(Arc::clone(&structure), Arc::new(SlideStrategy::new(0, 3, 0)))
            .duration(Duration::from_millis(40))
            .build()
            .unwrap();
        let outcome = engine.toggle(request).await.unwrap();
        let run = Arc::clone(outcome.run().unwrap());
        assert_eq!(run.duration(), 8);

        let end = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(StructureEvent::ToggleEnd(e)) => break e,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel failed: {e}"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(end.structure_id, StructureId(10));
        assert!(!end.aborted);
        assert_eq!(run.steps_executed(), 8);
        assert!(structure.snapshot().unwrap().is_open);
        assert_eq!(factory.last().unwrap().commits(), 1);
    }
}
