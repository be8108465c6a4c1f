use mover_core::geometry::{Cuboid, Vec3};
use mover_core::structure::StructureSnapshot;

use crate::blocks::AnimatedBlock;
use crate::error::StrategyError;

/// Position of a run within its duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepInfo {
    /// 1-based tick index.
    pub step: u32,
    pub duration: u32,
}

impl StepInfo {
    /// Fraction of the duration completed, in `[0, 1]`. A zero duration is
    /// always complete.
    pub fn progress(&self) -> f64 {
        if self.duration == 0 {
            1.0
        } else {
            (f64::from(self.step) / f64::from(self.duration)).min(1.0)
        }
    }
}

/// Per-shape movement computation.
pub trait AnimationStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per executed step before any block target is requested.
    fn begin_step(&self, _step: StepInfo) -> Result<(), StrategyError> {
        Ok(())
    }

    fn target(&self, block: &dyn AnimatedBlock, step: StepInfo) -> Result<Vec3, StrategyError>;

    /// Resting position of a block starting at `start`, if the shape has one.
    fn final_position(&self, start: Vec3) -> Option<Vec3>;

    fn has_final_position(&self) -> bool {
        true
    }

    /// Perpetual runs step until explicitly stopped.
    fn is_perpetual(&self) -> bool {
        false
    }

    /// Coordinates committed to the structure after a successful run.
    fn final_cuboid(&self, snapshot: &StructureSnapshot) -> Cuboid;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress() {
        assert!((StepInfo { step: 5, duration: 10 }.progress() - 0.5).abs() < f64::EPSILON);
        assert!((StepInfo { step: 12, duration: 10 }.progress() - 1.0).abs() < f64::EPSILON);
        assert!((StepInfo { step: 1, duration: 0 }.progress() - 1.0).abs() < f64::EPSILON);
    }
}
