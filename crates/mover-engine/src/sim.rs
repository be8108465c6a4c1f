//! In-memory block manager and simple strategies.
//!
//! Used by the `mover` binary to drive structures without a world, and by
//! tests to observe which lifecycle calls a run makes.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mover_core::events::AccessMode;
use mover_core::geometry::{BlockPos, Cuboid, RegionTracker, Vec3};
use mover_core::structure::StructureSnapshot;
use parking_lot::Mutex;
use tracing::debug;

use crate::blocks::{AnimatedBlock, BlockManager, BlockManagerFactory};
use crate::error::{BlockError, StrategyError};
use crate::strategy::{AnimationStrategy, StepInfo};

pub struct SimBlock {
    start: Vec3,
    target: Vec3,
    position: Mutex<Vec3>,
}

impl SimBlock {
    pub fn new(start: Vec3, target: Vec3) -> Self {
        Self {
            start,
            target,
            position: Mutex::new(start),
        }
    }
}

impl AnimatedBlock for SimBlock {
    fn start_position(&self) -> Vec3 {
        self.start
    }

    fn final_position(&self) -> Vec3 {
        self.target
    }

    fn position(&self) -> Vec3 {
        *self.position.lock()
    }

    fn move_to(&self, target: Vec3) {
        *self.position.lock() = target;
    }
}

/// Lifecycle step a [`SimBlockManager`] should fail at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFailure {
    Create,
    Spawn,
    /// Create succeeds but yields no blocks.
    NoBlocks,
}

#[derive(Default)]
struct Counters {
    creates: AtomicUsize,
    spawns: AtomicUsize,
    originals_removed: AtomicUsize,
    restores: AtomicUsize,
    commits: AtomicUsize,
}

/// Block manager that keeps blocks in memory and counts lifecycle calls.
pub struct SimBlockManager {
    mode: AccessMode,
    blocks: Mutex<Vec<Arc<SimBlock>>>,
    /// Positions the structure occupies in the simulated world.
    placed: Mutex<Vec<BlockPos>>,
    failure: Mutex<Option<SimFailure>>,
    counters: Counters,
}

impl SimBlockManager {
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            blocks: Mutex::new(Vec::new()),
            placed: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn fail_on(&self, failure: SimFailure) {
        *self.failure.lock() = Some(failure);
    }

    fn fails_at(&self, step: SimFailure) -> bool {
        *self.failure.lock() == Some(step)
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn creates(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn spawns(&self) -> usize {
        self.counters.spawns.load(Ordering::SeqCst)
    }

    pub fn originals_removed(&self) -> usize {
        self.counters.originals_removed.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.counters.restores.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    /// Block positions currently placed in the simulated world.
    pub fn placed(&self) -> Vec<BlockPos> {
        self.placed.lock().clone()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_block(v: Vec3) -> BlockPos {
    BlockPos::new(v.x.round() as i32, v.y.round() as i32, v.z.round() as i32)
}

impl BlockManager for SimBlockManager {
    fn create_blocks(
        &self,
        snapshot: &StructureSnapshot,
        strategy: &dyn AnimationStrategy,
    ) -> Result<(), BlockError> {
        let _ = self.counters.creates.fetch_add(1, Ordering::SeqCst);
        if self.fails_at(SimFailure::Create) {
            return Err(BlockError::Create(format!("simulated failure for {}", snapshot.id)));
        }
        *self.placed.lock() = snapshot.cuboid.positions().collect();
        if self.fails_at(SimFailure::NoBlocks) {
            return Ok(());
        }
        let blocks: Vec<Arc<SimBlock>> = snapshot
            .cuboid
            .positions()
            .map(|pos| {
                let start = Vec3::from(pos);
                let target = strategy.final_position(start).unwrap_or(start);
                Arc::new(SimBlock::new(start, target))
            })
            .collect();
        debug!(structure_id = %snapshot.id, blocks = blocks.len(), "created simulated blocks");
        *self.blocks.lock() = blocks;
        Ok(())
    }

    fn spawn_blocks(&self) -> Result<(), BlockError> {
        let _ = self.counters.spawns.fetch_add(1, Ordering::SeqCst);
        if self.fails_at(SimFailure::Spawn) {
            return Err(BlockError::Spawn("simulated failure".into()));
        }
        Ok(())
    }

    fn remove_original_blocks(&self) -> Result<(), BlockError> {
        let _ = self.counters.originals_removed.fetch_add(1, Ordering::SeqCst);
        self.placed.lock().clear();
        Ok(())
    }

    fn restore_on_failure(&self) -> Result<(), BlockError> {
        let _ = self.counters.restores.fetch_add(1, Ordering::SeqCst);
        let blocks = self.blocks.lock();
        for block in blocks.iter() {
            block.move_to(block.start_position());
        }
        *self.placed.lock() = blocks.iter().map(|b| to_block(b.start_position())).collect();
        Ok(())
    }

    fn commit_to_final(&self) -> Result<(), BlockError> {
        let _ = self.counters.commits.fetch_add(1, Ordering::SeqCst);
        let blocks = self.blocks.lock();
        for block in blocks.iter() {
            block.move_to(block.final_position());
        }
        if self.mode.is_exclusive() {
            *self.placed.lock() = blocks.iter().map(|b| to_block(b.final_position())).collect();
        }
        Ok(())
    }

    fn blocks(&self) -> Vec<Arc<dyn AnimatedBlock>> {
        self.blocks
            .lock()
            .iter()
            .map(|b| Arc::clone(b) as Arc<dyn AnimatedBlock>)
            .collect()
    }

    fn region(&self) -> Option<Cuboid> {
        let mut tracker = RegionTracker::new();
        for block in self.blocks.lock().iter() {
            tracker.include(block.position(), block.extent());
        }
        tracker.cuboid()
    }
}

/// Hands out [`SimBlockManager`]s and keeps them for inspection.
#[derive(Default)]
pub struct SimBlockManagerFactory {
    failure: Mutex<Option<SimFailure>>,
    created: Mutex<Vec<Arc<SimBlockManager>>>,
}

impl SimBlockManagerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every manager created from now on fail at `failure`.
    pub fn fail_on(&self, failure: Option<SimFailure>) {
        *self.failure.lock() = failure;
    }

    pub fn created(&self) -> Vec<Arc<SimBlockManager>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<SimBlockManager>> {
        self.created.lock().last().cloned()
    }
}

impl BlockManagerFactory for SimBlockManagerFactory {
    fn create(&self, mode: AccessMode) -> Arc<dyn BlockManager> {
        let manager = Arc::new(SimBlockManager::new(mode));
        if let Some(failure) = *self.failure.lock() {
            manager.fail_on(failure);
        }
        self.created.lock().push(Arc::clone(&manager));
        manager
    }
}

/// Translates the structure by a fixed offset over the run's duration.
#[derive(Clone, Debug)]
pub struct SlideStrategy {
    dx: i32,
    dy: i32,
    dz: i32,
}

impl SlideStrategy {
    pub fn new(dx: i32, dy: i32, dz: i32) -> Self {
        Self { dx, dy, dz }
    }

    fn offset(&self) -> Vec3 {
        Vec3::from(BlockPos::new(self.dx, self.dy, self.dz))
    }
}

impl AnimationStrategy for SlideStrategy {
    fn name(&self) -> &str {
        "slide"
    }

    fn target(&self, block: &dyn AnimatedBlock, step: StepInfo) -> Result<Vec3, StrategyError> {
        Ok(block
            .start_position()
            .lerp(block.final_position(), step.progress()))
    }

    fn final_position(&self, start: Vec3) -> Option<Vec3> {
        Some(start.add(self.offset()))
    }

    fn final_cuboid(&self, snapshot: &StructureSnapshot) -> Cuboid {
        snapshot.cuboid.translated(self.dx, self.dy, self.dz)
    }
}

/// Rotates the structure around a vertical axis forever.
#[derive(Clone, Debug)]
pub struct SpinStrategy {
    axis: Vec3,
    ticks_per_turn: u32,
}

impl SpinStrategy {
    pub fn new(axis: Vec3, ticks_per_turn: u32) -> Self {
        Self {
            axis,
            ticks_per_turn: ticks_per_turn.max(1),
        }
    }
}

impl AnimationStrategy for SpinStrategy {
    fn name(&self) -> &str {
        "spin"
    }

    fn target(&self, block: &dyn AnimatedBlock, step: StepInfo) -> Result<Vec3, StrategyError> {
        let angle = TAU * f64::from(step.step % self.ticks_per_turn) / f64::from(self.ticks_per_turn);
        let rel = block.start_position().sub(self.axis);
        let (sin, cos) = angle.sin_cos();
        Ok(self.axis.add(Vec3::new(
            rel.x * cos - rel.z * sin,
            rel.y,
            rel.x * sin + rel.z * cos,
        )))
    }

    fn final_position(&self, _start: Vec3) -> Option<Vec3> {
        None
    }

    fn has_final_position(&self) -> bool {
        false
    }

    fn is_perpetual(&self) -> bool {
        true
    }

    fn final_cuboid(&self, snapshot: &StructureSnapshot) -> Cuboid {
        snapshot.cuboid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mover_core::ids::StructureId;

    fn snapshot() -> StructureSnapshot {
        StructureSnapshot {
            id: StructureId(1),
            name: "door".into(),
            kind: "sliding_door".into(),
            is_open: false,
            cuboid: Cuboid::new(BlockPos::new(0, 0, 0), BlockPos::new(1, 1, 0)),
            rotation_point: BlockPos::new(0, 0, 0),
            power_block: None,
        }
    }

    #[test]
    fn slide_moves_blocks_to_offset() {
        let manager = SimBlockManager::new(AccessMode::Exclusive);
        let strategy = SlideStrategy::new(0, 2, 0);
        manager.create_blocks(&snapshot(), &strategy).unwrap();
        assert_eq!(manager.blocks().len(), 4);

        let block = &manager.blocks()[0];
        let half = strategy
            .target(block.as_ref(), StepInfo { step: 5, duration: 10 })
            .unwrap();
        assert_eq!(half, block.start_position().add(Vec3::new(0.0, 1.0, 0.0)));

        manager.remove_original_blocks().unwrap();
        assert!(manager.placed().is_empty());
        manager.commit_to_final().unwrap();
        let mut placed = manager.placed();
        placed.sort_by_key(|p| (p.x, p.y, p.z));
        assert_eq!(placed[0], BlockPos::new(0, 2, 0));
        assert_eq!(
            strategy.final_cuboid(&snapshot()),
            Cuboid::new(BlockPos::new(0, 2, 0), BlockPos::new(1, 3, 0))
        );
    }

    #[test]
    fn restore_puts_originals_back() {
        let manager = SimBlockManager::new(AccessMode::Exclusive);
        manager.create_blocks(&snapshot(), &SlideStrategy::new(3, 0, 0)).unwrap();
        manager.remove_original_blocks().unwrap();
        manager.blocks()[0].move_to(Vec3::new(9.0, 9.0, 9.0));
        manager.restore_on_failure().unwrap();
        assert_eq!(manager.placed().len(), 4);
        assert!(manager.placed().contains(&BlockPos::new(0, 0, 0)));
        assert_eq!(manager.restores(), 1);
    }

    #[test]
    fn configured_failures() {
        let manager = SimBlockManager::new(AccessMode::Exclusive);
        manager.fail_on(SimFailure::Create);
        assert!(matches!(
            manager.create_blocks(&snapshot(), &SlideStrategy::new(0, 1, 0)),
            Err(BlockError::Create(_))
        ));

        let factory = SimBlockManagerFactory::new();
        factory.fail_on(Some(SimFailure::NoBlocks));
        let manager = factory.create(AccessMode::Shared);
        manager.create_blocks(&snapshot(), &SlideStrategy::new(0, 1, 0)).unwrap();
        assert!(manager.blocks().is_empty());
        assert_eq!(factory.created().len(), 1);
    }

    #[test]
    fn spin_keeps_radius_and_has_no_end() {
        let strategy = SpinStrategy::new(Vec3::new(0.0, 0.0, 0.0), 4);
        let block = SimBlock::new(Vec3::new(2.0, 1.0, 0.0), Vec3::new(2.0, 1.0, 0.0));
        let quarter = strategy
            .target(&block, StepInfo { step: 1, duration: 0 })
            .unwrap();
        assert!((quarter.x).abs() < 1e-9);
        assert!((quarter.z - 2.0).abs() < 1e-9);
        assert!((quarter.y - 1.0).abs() < 1e-9);
        assert!(strategy.is_perpetual());
        assert!(!strategy.has_final_position());
        assert!(strategy.final_position(Vec3::ZERO).is_none());
    }
}
