//! Per-structure admission control for animation runs.
//!
//! Each structure has at most one [`RegistrationEntry`]. Admission,
//! attachment and detachment are single-key atomic transforms on a sharded
//! concurrent map, so unrelated structures never contend. Callbacks into
//! runs (abort, stop) are always made after the map guard is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mover_core::events::{AccessMode, StructureEvent, ToggleEndEvent};
use mover_core::ids::{RegistrationToken, RunId, StructureId, TokenSource};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, RegistryError};
use crate::scheduler::Scheduler;

const EVENT_CAPACITY: usize = 256;

/// What the registry needs from a run.
pub trait RegisteredRun: Send + Sync {
    fn run_id(&self) -> &RunId;
    fn structure_id(&self) -> StructureId;
    fn mode(&self) -> AccessMode;
    fn abort(&self, blocking: bool);
    /// Ask the run to end gracefully.
    fn request_stop(&self);
    fn is_aborted(&self) -> bool;
    /// Whether the structure's trigger must be re-validated if the run is
    /// cut short by a shutdown.
    fn needs_recheck(&self) -> bool;
}

/// Re-validates a structure's trigger (e.g. its power source) after its
/// state may have gone stale.
#[async_trait]
pub trait TriggerVerifier: Send + Sync {
    async fn verify(&self, structure_id: StructureId) -> Result<(), EngineError>;
}

pub struct ExclusiveEntry {
    token: RegistrationToken,
    run: Option<Arc<dyn RegisteredRun>>,
    pending: bool,
    aborted: bool,
}

pub struct SharedEntry {
    token: RegistrationToken,
    runs: HashMap<RunId, Arc<dyn RegisteredRun>>,
    pending: usize,
    aborted: bool,
}

/// Concurrency-control record of one structure.
pub enum RegistrationEntry {
    Exclusive(ExclusiveEntry),
    Shared(SharedEntry),
}

impl RegistrationEntry {
    fn new(mode: AccessMode, token: RegistrationToken) -> Self {
        match mode {
            AccessMode::Exclusive => Self::Exclusive(ExclusiveEntry {
                token,
                run: None,
                pending: true,
                aborted: false,
            }),
            AccessMode::Shared => Self::Shared(SharedEntry {
                token,
                runs: HashMap::new(),
                pending: 1,
                aborted: false,
            }),
        }
    }

    pub fn token(&self) -> RegistrationToken {
        match self {
            Self::Exclusive(e) => e.token,
            Self::Shared(e) => e.token,
        }
    }

    pub fn mode(&self) -> AccessMode {
        match self {
            Self::Exclusive(_) => AccessMode::Exclusive,
            Self::Shared(_) => AccessMode::Shared,
        }
    }

    /// Number of attached runs.
    pub fn len(&self) -> usize {
        match self {
            Self::Exclusive(e) => usize::from(e.run.is_some()),
            Self::Shared(e) => e.runs.len(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        match self {
            Self::Exclusive(e) => e.aborted,
            Self::Shared(e) => e.aborted,
        }
    }

    /// No members and no admission waiting for its run.
    fn is_idle(&self) -> bool {
        match self {
            Self::Exclusive(e) => e.run.is_none() && !e.pending,
            Self::Shared(e) => e.runs.is_empty() && e.pending == 0,
        }
    }

    fn members(&self) -> Vec<Arc<dyn RegisteredRun>> {
        match self {
            Self::Exclusive(e) => e.run.iter().cloned().collect(),
            Self::Shared(e) => e.runs.values().cloned().collect(),
        }
    }

    fn mark_aborted(&mut self) {
        match self {
            Self::Exclusive(e) => e.aborted = true,
            Self::Shared(e) => e.aborted = true,
        }
    }

    fn attach(&mut self, structure_id: StructureId, run: Arc<dyn RegisteredRun>) -> Result<(), RegistryError> {
        match self {
            Self::Exclusive(e) => {
                if e.run.is_some() {
                    return Err(RegistryError::ExclusiveOccupied(structure_id));
                }
                e.run = Some(run);
                e.pending = false;
            }
            Self::Shared(e) => {
                let _ = e.runs.insert(run.run_id().clone(), run);
                e.pending = e.pending.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Fan another shared admission into this entry.
    fn join_shared(&mut self) -> RegistrationToken {
        if let Self::Shared(e) = self {
            e.pending += 1;
        }
        self.token()
    }

    fn release_pending(&mut self) {
        match self {
            Self::Exclusive(e) => e.pending = false,
            Self::Shared(e) => e.pending = e.pending.saturating_sub(1),
        }
    }

    fn detach(&mut self, run_id: &RunId) -> bool {
        match self {
            Self::Exclusive(e) => {
                if e.run.as_ref().is_some_and(|r| r.run_id() == run_id) {
                    e.run = None;
                    true
                } else {
                    false
                }
            }
            Self::Shared(e) => e.runs.remove(run_id).is_some(),
        }
    }
}

pub struct ActivityRegistry {
    entries: DashMap<StructureId, RegistrationEntry>,
    tokens: TokenSource,
    active: AtomicBool,
    events: broadcast::Sender<StructureEvent>,
    pending_rechecks: Mutex<Vec<StructureId>>,
    scheduler: Arc<dyn Scheduler>,
    verifier: Option<Arc<dyn TriggerVerifier>>,
    restart_recheck_delay: Duration,
}

impl ActivityRegistry {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        verifier: Option<Arc<dyn TriggerVerifier>>,
        restart_recheck_delay: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            tokens: TokenSource::new(),
            active: AtomicBool::new(true),
            events,
            pending_rechecks: Mutex::new(Vec::new()),
            scheduler,
            verifier,
            restart_recheck_delay,
        }
    }

    /// Admit a run for `structure_id`.
    ///
    /// Returns `None` when an exclusive entry exists or the registry is shut
    /// down. An exclusive request evicts a live shared entry: its runs are
    /// aborted once the map guard is released.
    pub fn register_animation(
        &self,
        structure_id: StructureId,
        mode: AccessMode,
    ) -> Option<RegistrationToken> {
        if !self.is_active() {
            debug!(%structure_id, ?mode, "registry inactive, rejecting admission");
            return None;
        }

        let mut evicted = None;
        let token = match self.entries.entry(structure_id) {
            Entry::Vacant(slot) => {
                let token = self.tokens.next_token();
                let _ = slot.insert(RegistrationEntry::new(mode, token));
                Some(token)
            }
            Entry::Occupied(mut slot) => match (slot.get().mode(), mode) {
                (AccessMode::Exclusive, _) => None,
                (AccessMode::Shared, AccessMode::Shared) => Some(slot.get_mut().join_shared()),
                (AccessMode::Shared, AccessMode::Exclusive) => {
                    let token = self.tokens.next_token();
                    evicted = Some(slot.insert(RegistrationEntry::new(mode, token)));
                    Some(token)
                }
            },
        };

        if let Some(mut old) = evicted {
            old.mark_aborted();
            let members = old.members();
            info!(
                %structure_id,
                evicted_token = %old.token(),
                runs = members.len(),
                "exclusive admission evicted shared runs"
            );
            for run in members {
                run.abort(false);
            }
        }

        match token {
            Some(token) => debug!(%structure_id, ?mode, %token, "admitted"),
            None => debug!(%structure_id, ?mode, "structure busy"),
        }
        token
    }

    /// Release an admission that never received a run.
    pub fn unregister_animation(
        &self,
        structure_id: StructureId,
        token: RegistrationToken,
    ) -> Result<(), RegistryError> {
        match self.entries.entry(structure_id) {
            Entry::Vacant(_) => Ok(()),
            Entry::Occupied(mut slot) => {
                let expected = slot.get().token();
                if expected != token {
                    return Err(RegistryError::TokenMismatch {
                        structure_id,
                        expected,
                        actual: token,
                    });
                }
                slot.get_mut().release_pending();
                if slot.get().is_idle() {
                    let _ = slot.remove();
                    debug!(%structure_id, %token, "reservation released");
                }
                Ok(())
            }
        }
    }

    /// Attach a constructed run to the entry admitted under `token`.
    pub fn add_run(
        &self,
        token: RegistrationToken,
        run: Arc<dyn RegisteredRun>,
    ) -> Result<(), RegistryError> {
        let structure_id = run.structure_id();
        let mut entry = self
            .entries
            .get_mut(&structure_id)
            .ok_or(RegistryError::NoEntry(structure_id))?;
        let expected = entry.token();
        if expected != token {
            return Err(RegistryError::TokenMismatch {
                structure_id,
                expected,
                actual: token,
            });
        }
        entry.attach(structure_id, run)
    }

    /// Detach a finished run and publish its end event.
    ///
    /// The event is published whatever the bookkeeping outcome. A run that is
    /// no longer tracked (evicted, deleted or shut down) is tolerated when it
    /// was aborted.
    pub fn process_finished_run(
        &self,
        token: RegistrationToken,
        run: &dyn RegisteredRun,
        summary: ToggleEndEvent,
    ) -> Result<(), RegistryError> {
        let structure_id = run.structure_id();
        let detached = match self.entries.entry(structure_id) {
            Entry::Occupied(mut slot) if slot.get().token() == token => {
                let removed = slot.get_mut().detach(run.run_id());
                if removed && slot.get().is_idle() {
                    let _ = slot.remove();
                }
                removed
            }
            _ => false,
        };
        let _ = self.events.send(StructureEvent::ToggleEnd(summary));

        if detached {
            debug!(%structure_id, run_id = %run.run_id(), "run finished");
            Ok(())
        } else if run.is_aborted() {
            debug!(
                %structure_id,
                run_id = %run.run_id(),
                active = self.is_active(),
                "aborted run was no longer tracked"
            );
            Ok(())
        } else {
            error!(%structure_id, run_id = %run.run_id(), "finished run was not tracked");
            Err(RegistryError::UntrackedRun {
                structure_id,
                run_id: run.run_id().clone(),
            })
        }
    }

    /// Gracefully stop the exclusive run of a structure.
    pub fn stop_exclusive(&self, structure_id: StructureId) -> bool {
        let run = self.entries.get(&structure_id).and_then(|entry| match &*entry {
            RegistrationEntry::Exclusive(e) => e.run.clone(),
            RegistrationEntry::Shared(_) => None,
        });
        match run {
            Some(run) => {
                run.request_stop();
                true
            }
            None => false,
        }
    }

    /// Gracefully stop every run of a structure. Returns how many were asked.
    pub fn stop_all(&self, structure_id: StructureId) -> usize {
        let members = self
            .entries
            .get(&structure_id)
            .map(|entry| entry.members())
            .unwrap_or_default();
        for run in &members {
            run.request_stop();
        }
        members.len()
    }

    /// Abort and forget everything registered for a deleted structure.
    pub fn on_structure_deleted(&self, structure_id: StructureId) -> bool {
        let Some((_, mut entry)) = self.entries.remove(&structure_id) else {
            return false;
        };
        entry.mark_aborted();
        let members = entry.members();
        info!(%structure_id, runs = members.len(), "structure deleted, aborting runs");
        for run in members {
            run.abort(false);
        }
        true
    }

    /// Reject further admissions and abort every registered run, waiting for
    /// each to finalize.
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        let ids: Vec<StructureId> = self.entries.iter().map(|e| *e.key()).collect();
        let mut aborted = 0usize;
        for structure_id in ids {
            let Some((_, mut entry)) = self.entries.remove(&structure_id) else {
                continue;
            };
            entry.mark_aborted();
            let members = entry.members();
            if entry.mode().is_exclusive() && members.iter().any(|r| r.needs_recheck()) {
                self.pending_rechecks.lock().push(structure_id);
            }
            for run in members {
                run.abort(true);
                aborted += 1;
            }
        }
        info!(aborted, "activity registry shut down");
    }

    /// Accept admissions again and schedule trigger re-checks for structures
    /// whose runs were cut short by the last shutdown.
    pub fn initialize(&self) {
        self.active.store(true, Ordering::Release);
        let rechecks = std::mem::take(&mut *self.pending_rechecks.lock());
        let Some(verifier) = &self.verifier else {
            if !rechecks.is_empty() {
                debug!(count = rechecks.len(), "no trigger verifier, dropping re-checks");
            }
            return;
        };
        for structure_id in rechecks {
            let verifier = Arc::clone(verifier);
            let _ = self.scheduler.spawn_delayed(
                self.restart_recheck_delay,
                Box::pin(async move {
                    if let Err(e) = verifier.verify(structure_id).await {
                        warn!(%structure_id, error = %e, "trigger re-check failed");
                    }
                }),
            );
        }
    }

    pub fn publish(&self, event: StructureEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StructureEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_busy(&self, structure_id: StructureId) -> bool {
        self.entries.contains_key(&structure_id)
    }

    pub fn mode_of(&self, structure_id: StructureId) -> Option<AccessMode> {
        self.entries.get(&structure_id).map(|e| e.mode())
    }

    pub fn token_of(&self, structure_id: StructureId) -> Option<RegistrationToken> {
        self.entries.get(&structure_id).map(|e| e.token())
    }

    pub fn member_count(&self, structure_id: StructureId) -> usize {
        self.entries.get(&structure_id).map_or(0, |e| e.len())
    }

    /// Number of structures with an entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_rechecks(&self) -> Vec<StructureId> {
        self.pending_rechecks.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use chrono::Utc;
    use mover_core::events::{ActionType, Actor, ToggleCause};
    use mover_core::geometry::{BlockPos, Cuboid};
    use mover_core::structure::StructureSnapshot;
    use std::sync::atomic::AtomicU32;

    struct FakeRun {
        run_id: RunId,
        structure_id: StructureId,
        mode: AccessMode,
        aborts: AtomicU32,
        stops: AtomicU32,
        aborted: AtomicBool,
        trigger: bool,
    }

    impl FakeRun {
        fn build(structure_id: u64, mode: AccessMode, trigger: bool) -> Arc<Self> {
            Arc::new(Self {
                run_id: RunId::new(),
                structure_id: StructureId(structure_id),
                mode,
                aborts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                aborted: AtomicBool::new(false),
                trigger,
            })
        }

        fn new(structure_id: u64, mode: AccessMode) -> Arc<Self> {
            Self::build(structure_id, mode, false)
        }

        fn with_trigger(structure_id: u64) -> Arc<Self> {
            Self::build(structure_id, AccessMode::Exclusive, true)
        }

        fn aborts(&self) -> u32 {
            self.aborts.load(Ordering::SeqCst)
        }
    }

    impl RegisteredRun for FakeRun {
        fn run_id(&self) -> &RunId {
            &self.run_id
        }
        fn structure_id(&self) -> StructureId {
            self.structure_id
        }
        fn mode(&self) -> AccessMode {
            self.mode
        }
        fn abort(&self, _blocking: bool) {
            self.aborted.store(true, Ordering::SeqCst);
            let _ = self.aborts.fetch_add(1, Ordering::SeqCst);
        }
        fn request_stop(&self) {
            let _ = self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn is_aborted(&self) -> bool {
            self.aborted.load(Ordering::SeqCst)
        }
        fn needs_recheck(&self) -> bool {
            self.trigger
        }
    }

    struct CountingVerifier {
        calls: Mutex<Vec<StructureId>>,
    }

    #[async_trait]
    impl TriggerVerifier for CountingVerifier {
        async fn verify(&self, structure_id: StructureId) -> Result<(), EngineError> {
            self.calls.lock().push(structure_id);
            Ok(())
        }
    }

    fn registry() -> (ActivityRegistry, Arc<ManualScheduler>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let registry = ActivityRegistry::new(scheduler.clone(), None, Duration::from_secs(2));
        (registry, scheduler)
    }

    fn summary(run: &FakeRun) -> ToggleEndEvent {
        ToggleEndEvent {
            structure_id: run.structure_id,
            run_id: run.run_id.clone(),
            snapshot: StructureSnapshot {
                id: run.structure_id,
                name: "door".into(),
                kind: "sliding_door".into(),
                is_open: false,
                cuboid: Cuboid::new(BlockPos::new(0, 0, 0), BlockPos::new(1, 1, 0)),
                rotation_point: BlockPos::new(0, 0, 0),
                power_block: None,
            },
            cause: ToggleCause::Command,
            action: ActionType::Toggle,
            actor: Actor::server(),
            mode: run.mode,
            duration_ticks: 10,
            skipped: false,
            aborted: run.is_aborted(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn second_exclusive_is_rejected() {
        let (registry, _) = registry();
        let id = StructureId(1);
        assert!(registry.register_animation(id, AccessMode::Exclusive).is_some());
        assert!(registry.register_animation(id, AccessMode::Exclusive).is_none());
        assert!(registry.register_animation(id, AccessMode::Shared).is_none());
    }

    #[test]
    fn exclusive_then_unregister_scenario() {
        let (registry, _) = registry();
        let id = StructureId(42);
        let t1 = registry.register_animation(id, AccessMode::Exclusive).unwrap();
        assert!(registry.register_animation(id, AccessMode::Exclusive).is_none());
        registry.unregister_animation(id, t1).unwrap();
        assert!(!registry.is_busy(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn shared_admissions_share_token() {
        let (registry, _) = registry();
        let id = StructureId(2);
        let a = registry.register_animation(id, AccessMode::Shared).unwrap();
        let b = registry.register_animation(id, AccessMode::Shared).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.mode_of(id), Some(AccessMode::Shared));
    }

    #[test]
    fn exclusive_evicts_shared_scenario() {
        let (registry, _) = registry();
        let id = StructureId(42);
        let t2 = registry.register_animation(id, AccessMode::Shared).unwrap();
        assert_eq!(registry.register_animation(id, AccessMode::Shared), Some(t2));
        let first = FakeRun::new(42, AccessMode::Shared);
        let second = FakeRun::new(42, AccessMode::Shared);
        registry.add_run(t2, first.clone()).unwrap();
        registry.add_run(t2, second.clone()).unwrap();
        assert_eq!(registry.member_count(id), 2);

        let t3 = registry.register_animation(id, AccessMode::Exclusive).unwrap();
        assert_ne!(t3, t2);
        assert_eq!(first.aborts(), 1);
        assert_eq!(second.aborts(), 1);
        assert_eq!(registry.mode_of(id), Some(AccessMode::Exclusive));
        assert_eq!(registry.token_of(id), Some(t3));
        assert_eq!(registry.member_count(id), 0);
    }

    #[test]
    fn evicted_run_finishing_is_tolerated_and_does_not_touch_new_entry() {
        let (registry, _) = registry();
        let mut events = registry.subscribe();
        let id = StructureId(3);
        let shared = registry.register_animation(id, AccessMode::Shared).unwrap();
        let preview = FakeRun::new(3, AccessMode::Shared);
        registry.add_run(shared, preview.clone()).unwrap();
        let exclusive = registry.register_animation(id, AccessMode::Exclusive).unwrap();

        registry
            .process_finished_run(shared, preview.as_ref(), summary(&preview))
            .unwrap();
        assert_eq!(registry.token_of(id), Some(exclusive));
        assert!(matches!(events.try_recv(), Ok(StructureEvent::ToggleEnd(e)) if e.aborted));
    }

    #[test]
    fn mismatched_tokens_are_errors() {
        let (registry, _) = registry();
        let id = StructureId(4);
        let good = registry.register_animation(id, AccessMode::Exclusive).unwrap();
        let other = registry
            .register_animation(StructureId(5), AccessMode::Exclusive)
            .unwrap();

        assert_eq!(
            registry.unregister_animation(id, other),
            Err(RegistryError::TokenMismatch {
                structure_id: id,
                expected: good,
                actual: other,
            })
        );
        let run = FakeRun::new(4, AccessMode::Exclusive);
        assert!(matches!(
            registry.add_run(other, run),
            Err(RegistryError::TokenMismatch { .. })
        ));
        assert!(registry.is_busy(id));
    }

    #[test]
    fn add_run_without_entry_fails() {
        let (registry, _) = registry();
        let token = registry
            .register_animation(StructureId(6), AccessMode::Exclusive)
            .unwrap();
        let run = FakeRun::new(7, AccessMode::Exclusive);
        assert_eq!(
            registry.add_run(token, run),
            Err(RegistryError::NoEntry(StructureId(7)))
        );
    }

    #[test]
    fn exclusive_entry_holds_one_run() {
        let (registry, _) = registry();
        let id = StructureId(8);
        let token = registry.register_animation(id, AccessMode::Exclusive).unwrap();
        registry.add_run(token, FakeRun::new(8, AccessMode::Exclusive)).unwrap();
        assert_eq!(
            registry.add_run(token, FakeRun::new(8, AccessMode::Exclusive)),
            Err(RegistryError::ExclusiveOccupied(id))
        );
        assert_eq!(registry.member_count(id), 1);
    }

    #[test]
    fn finished_run_releases_entry_and_publishes() {
        let (registry, _) = registry();
        let mut events = registry.subscribe();
        let id = StructureId(9);
        let token = registry.register_animation(id, AccessMode::Exclusive).unwrap();
        let run = FakeRun::new(9, AccessMode::Exclusive);
        registry.add_run(token, run.clone()).unwrap();

        registry
            .process_finished_run(token, run.as_ref(), summary(&run))
            .unwrap();
        assert!(!registry.is_busy(id));
        let event = events.try_recv().unwrap();
        assert_eq!(event.structure_id(), id);
        assert_eq!(event.run_id(), &run.run_id);
    }

    #[test]
    fn shared_entry_lives_until_last_run_and_pending_admission() {
        let (registry, _) = registry();
        let id = StructureId(10);
        let token = registry.register_animation(id, AccessMode::Shared).unwrap();
        let _ = registry.register_animation(id, AccessMode::Shared).unwrap();
        let run = FakeRun::new(10, AccessMode::Shared);
        registry.add_run(token, run.clone()).unwrap();

        registry
            .process_finished_run(token, run.as_ref(), summary(&run))
            .unwrap();
        // second admission is still pending
        assert!(registry.is_busy(id));
        registry.unregister_animation(id, token).unwrap();
        assert!(!registry.is_busy(id));
    }

    #[test]
    fn untracked_live_run_is_a_violation() {
        let (registry, _) = registry();
        let mut events = registry.subscribe();
        let run = FakeRun::new(11, AccessMode::Exclusive);
        let token = registry
            .register_animation(StructureId(99), AccessMode::Exclusive)
            .unwrap();
        assert!(matches!(
            registry.process_finished_run(token, run.as_ref(), summary(&run)),
            Err(RegistryError::UntrackedRun { .. })
        ));
        // the event is still published
        assert!(events.try_recv().is_ok());
    }

    #[test]
    fn stop_requests_reach_members() {
        let (registry, _) = registry();
        let exclusive_id = StructureId(12);
        let token = registry
            .register_animation(exclusive_id, AccessMode::Exclusive)
            .unwrap();
        let run = FakeRun::new(12, AccessMode::Exclusive);
        registry.add_run(token, run.clone()).unwrap();
        assert!(registry.stop_exclusive(exclusive_id));
        assert_eq!(run.stops.load(Ordering::SeqCst), 1);

        let shared_id = StructureId(13);
        let token = registry.register_animation(shared_id, AccessMode::Shared).unwrap();
        let _ = registry.register_animation(shared_id, AccessMode::Shared).unwrap();
        let a = FakeRun::new(13, AccessMode::Shared);
        let b = FakeRun::new(13, AccessMode::Shared);
        registry.add_run(token, a.clone()).unwrap();
        registry.add_run(token, b.clone()).unwrap();
        assert!(!registry.stop_exclusive(shared_id));
        assert_eq!(registry.stop_all(shared_id), 2);
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.aborts(), 0);
    }

    #[test]
    fn deleted_structure_aborts_regardless_of_state() {
        let (registry, _) = registry();
        let id = StructureId(14);
        let token = registry.register_animation(id, AccessMode::Exclusive).unwrap();
        let run = FakeRun::new(14, AccessMode::Exclusive);
        registry.add_run(token, run.clone()).unwrap();

        registry.shutdown();
        assert!(!registry.on_structure_deleted(id));
        registry.initialize();

        let token = registry.register_animation(id, AccessMode::Exclusive).unwrap();
        let run = FakeRun::new(14, AccessMode::Exclusive);
        registry.add_run(token, run.clone()).unwrap();
        assert!(registry.on_structure_deleted(id));
        assert_eq!(run.aborts(), 1);
        assert!(!registry.is_busy(id));
        assert!(!registry.on_structure_deleted(id));
    }

    #[test]
    fn shutdown_aborts_and_rejects_admissions() {
        let (registry, _) = registry();
        let token = registry
            .register_animation(StructureId(15), AccessMode::Exclusive)
            .unwrap();
        let run = FakeRun::new(15, AccessMode::Exclusive);
        registry.add_run(token, run.clone()).unwrap();

        registry.shutdown();
        assert!(!registry.is_active());
        assert_eq!(run.aborts(), 1);
        assert!(registry.is_empty());
        assert!(registry
            .register_animation(StructureId(16), AccessMode::Shared)
            .is_none());

        // finishing after shutdown is tolerated because the run was aborted
        registry
            .process_finished_run(token, run.as_ref(), summary(&run))
            .unwrap();
    }

    #[test]
    fn rechecks_scheduled_after_restart() {
        let scheduler = Arc::new(ManualScheduler::new());
        let verifier = Arc::new(CountingVerifier {
            calls: Mutex::new(Vec::new()),
        });
        let registry = ActivityRegistry::new(
            scheduler.clone(),
            Some(verifier.clone()),
            Duration::from_secs(2),
        );
        let powered = StructureId(17);
        let token = registry.register_animation(powered, AccessMode::Exclusive).unwrap();
        registry.add_run(token, FakeRun::with_trigger(17)).unwrap();
        let plain = StructureId(18);
        let token = registry.register_animation(plain, AccessMode::Exclusive).unwrap();
        registry.add_run(token, FakeRun::new(18, AccessMode::Exclusive)).unwrap();

        registry.shutdown();
        assert_eq!(registry.pending_rechecks(), vec![powered]);

        registry.initialize();
        assert!(registry.is_active());
        assert!(registry.pending_rechecks().is_empty());
        assert_eq!(scheduler.pending_delayed(), 1);
        assert!(verifier.calls.lock().is_empty());

        scheduler.advance();
        assert_eq!(*verifier.calls.lock(), vec![powered]);
    }

    #[test]
    fn concurrent_exclusive_admission_admits_one() {
        let (registry, _) = registry();
        let registry = Arc::new(registry);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .register_animation(StructureId(19), AccessMode::Exclusive)
                        .is_some()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
