//! Positions, block coordinates and bounding cuboids.

use serde::{Deserialize, Serialize};

/// A continuous position in world space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn scale(self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }

    pub fn distance(self, other: Self) -> f64 {
        let d = self.sub(other);
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }

    /// Linear interpolation; `t` is clamped to `[0, 1]`.
    pub fn lerp(self, to: Self, t: f64) -> Self {
        let t = t.clamp(0.0, 1.0);
        self.add(to.sub(self).scale(t))
    }
}

impl From<BlockPos> for Vec3 {
    fn from(pos: BlockPos) -> Self {
        Self::new(f64::from(pos.x), f64::from(pos.y), f64::from(pos.z))
    }
}

/// An integer block coordinate.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }
}

/// An axis-aligned, inclusive box of blocks. `min` is always component-wise
/// less than or equal to `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cuboid {
    min: BlockPos,
    max: BlockPos,
}

impl Cuboid {
    pub fn new(a: BlockPos, b: BlockPos) -> Self {
        Self {
            min: BlockPos::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: BlockPos::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    pub fn min(&self) -> BlockPos {
        self.min
    }

    pub fn max(&self) -> BlockPos {
        self.max
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        (self.min.x..=self.max.x).contains(&pos.x)
            && (self.min.y..=self.max.y).contains(&pos.y)
            && (self.min.z..=self.max.z).contains(&pos.z)
    }

    pub fn volume(&self) -> u64 {
        let dx = u64::from((self.max.x - self.min.x).unsigned_abs()) + 1;
        let dy = u64::from((self.max.y - self.min.y).unsigned_abs()) + 1;
        let dz = u64::from((self.max.z - self.min.z).unsigned_abs()) + 1;
        dx * dy * dz
    }

    pub fn translated(&self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            min: self.min.offset(dx, dy, dz),
            max: self.max.offset(dx, dy, dz),
        }
    }

    /// Every block position inside the cuboid, x fastest.
    pub fn positions(&self) -> impl Iterator<Item = BlockPos> + '_ {
        (self.min.y..=self.max.y).flat_map(move |y| {
            (self.min.z..=self.max.z)
                .flat_map(move |z| (self.min.x..=self.max.x).map(move |x| BlockPos::new(x, y, z)))
        })
    }

    pub fn center(&self) -> Vec3 {
        Vec3::from(self.min).add(Vec3::from(self.max)).scale(0.5)
    }
}

/// Accumulates the cuboid enclosing a set of spheres (block centre plus radius).
#[derive(Clone, Debug, Default)]
pub struct RegionTracker {
    lo: Option<Vec3>,
    hi: Option<Vec3>,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.lo = None;
        self.hi = None;
    }

    pub fn include(&mut self, center: Vec3, radius: f64) {
        let r = radius.max(0.0);
        let lo = Vec3::new(center.x - r, center.y - r, center.z - r);
        let hi = Vec3::new(center.x + r, center.y + r, center.z + r);
        self.lo = Some(match self.lo {
            Some(cur) => Vec3::new(cur.x.min(lo.x), cur.y.min(lo.y), cur.z.min(lo.z)),
            None => lo,
        });
        self.hi = Some(match self.hi {
            Some(cur) => Vec3::new(cur.x.max(hi.x), cur.y.max(hi.y), cur.z.max(hi.z)),
            None => hi,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.lo.is_none()
    }

    /// The enclosing block cuboid, or `None` if nothing was included.
    #[allow(clippy::cast_possible_truncation)]
    pub fn cuboid(&self) -> Option<Cuboid> {
        let (lo, hi) = (self.lo?, self.hi?);
        Some(Cuboid::new(
            BlockPos::new(lo.x.floor() as i32, lo.y.floor() as i32, lo.z.floor() as i32),
            BlockPos::new(hi.x.ceil() as i32, hi.y.ceil() as i32, hi.z.ceil() as i32),
        ))
    }
}
