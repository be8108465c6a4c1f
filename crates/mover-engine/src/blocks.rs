//! Contract of the block lifecycle manager.
//!
//! The manager owns the world-visible representation of a structure while
//! it animates. Every method except [`BlockManager::blocks`] and
//! [`BlockManager::region`] mutates world state and is only called on the
//! control context.

use std::sync::Arc;

use mover_core::events::AccessMode;
use mover_core::geometry::{Cuboid, Vec3};
use mover_core::structure::StructureSnapshot;

use crate::error::BlockError;
use crate::strategy::AnimationStrategy;

/// A temporary block moved by a run.
pub trait AnimatedBlock: Send + Sync {
    fn start_position(&self) -> Vec3;
    /// Where the block rests once the run commits. Equals the start position
    /// for strategies without a final position.
    fn final_position(&self) -> Vec3;
    fn position(&self) -> Vec3;
    /// Half-extent used for bounding region tracking.
    fn extent(&self) -> f64 {
        0.5
    }
    fn move_to(&self, target: Vec3);
}

pub trait BlockManager: Send + Sync {
    /// Create the animated blocks for a structure. No blocks is not an error.
    fn create_blocks(
        &self,
        snapshot: &StructureSnapshot,
        strategy: &dyn AnimationStrategy,
    ) -> Result<(), BlockError>;

    fn spawn_blocks(&self) -> Result<(), BlockError>;

    fn remove_original_blocks(&self) -> Result<(), BlockError>;

    /// Put the original blocks back where they were.
    fn restore_on_failure(&self) -> Result<(), BlockError>;

    /// Place the blocks at their final positions.
    fn commit_to_final(&self) -> Result<(), BlockError>;

    fn blocks(&self) -> Vec<Arc<dyn AnimatedBlock>>;

    fn region(&self) -> Option<Cuboid>;
}

/// Produces a fresh block manager for each run.
pub trait BlockManagerFactory: Send + Sync {
    fn create(&self, mode: AccessMode) -> Arc<dyn BlockManager>;
}
