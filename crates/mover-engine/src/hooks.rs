use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mover_core::events::AccessMode;
use mover_core::hooks::HookPoint;
use mover_core::ids::{RunId, StructureId};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::{panic_message, HookError};
use crate::run::AnimationState;

/// Context passed to hooks at each extension point.
#[derive(Clone, Debug)]
pub struct HookContext {
    pub point: HookPoint,
    pub structure_id: StructureId,
    pub run_id: RunId,
    /// Ticks elapsed when the hook fires.
    pub step: u32,
    pub state: AnimationState,
    pub timestamp: DateTime<Utc>,
}

/// An extension callback living for the duration of one run.
pub trait AnimationHook: Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, ctx: &HookContext) -> Result<(), HookError>;
}

/// Describes the run a hook is being created for.
#[derive(Clone, Debug)]
pub struct RunInfo {
    pub structure_id: StructureId,
    pub run_id: RunId,
    pub mode: AccessMode,
    pub kind: String,
    pub duration_ticks: u32,
}

/// Creates a fresh hook for every run. Returning `None` opts out of the run.
pub trait HookFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self, run: &RunInfo) -> Option<Box<dyn AnimationHook>>;
}

/// Named hook factories, kept in registration order.
#[derive(Default)]
pub struct HookRegistry {
    factories: RwLock<Vec<Arc<dyn HookFactory>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A factory with the same name is replaced in place.
    pub fn register(&self, factory: Arc<dyn HookFactory>) {
        let mut factories = self.factories.write();
        if let Some(existing) = factories.iter_mut().find(|f| f.name() == factory.name()) {
            debug!(hook = factory.name(), "replacing hook factory");
            *existing = factory;
        } else {
            factories.push(factory);
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut factories = self.factories.write();
        let before = factories.len();
        factories.retain(|f| f.name() != name);
        factories.len() != before
    }

    pub fn count(&self) -> usize {
        self.factories.read().len()
    }

    pub fn names(&self) -> Vec<String> {
        self.factories
            .read()
            .iter()
            .map(|f| f.name().to_string())
            .collect()
    }

    /// Instantiate the hooks for one run.
    pub fn instantiate(&self, run: &RunInfo) -> HookDispatcher {
        let factories: Vec<Arc<dyn HookFactory>> = self.factories.read().clone();
        let hooks = factories
            .iter()
            .filter_map(|factory| {
                match catch_unwind(AssertUnwindSafe(|| factory.create(run))) {
                    Ok(hook) => hook,
                    Err(payload) => {
                        error!(
                            hook = factory.name(),
                            structure_id = %run.structure_id,
                            panic = %panic_message(&*payload),
                            "hook factory panicked"
                        );
                        None
                    }
                }
            })
            .collect();
        HookDispatcher::new(hooks)
    }
}

/// Invokes a run's hooks in order. Failures are logged and never propagate.
#[derive(Default)]
pub struct HookDispatcher {
    hooks: Vec<Box<dyn AnimationHook>>,
}

impl HookDispatcher {
    pub fn new(hooks: Vec<Box<dyn AnimationHook>>) -> Self {
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn dispatch(&self, ctx: &HookContext) {
        for hook in &self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.execute(ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    hook = hook.name(),
                    point = %ctx.point,
                    structure_id = %ctx.structure_id,
                    run_id = %ctx.run_id,
                    error = %e,
                    "animation hook failed"
                ),
                Err(payload) => error!(
                    hook = hook.name(),
                    point = %ctx.point,
                    structure_id = %ctx.structure_id,
                    run_id = %ctx.run_id,
                    panic = %panic_message(&*payload),
                    "animation hook panicked"
                ),
            }
        }
    }
}
