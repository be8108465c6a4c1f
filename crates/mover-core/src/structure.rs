//! The persisted structure record and its reader/writer lock.
//!
//! A [`Structure`] is shared between callers that want to animate it and the
//! runs that commit its new state. Readers take short-lived snapshots; the
//! only writer is the commit at the end of an exclusive run. Lock misuse that
//! would deadlock (upgrading a held read lock, re-entering the write lock) is
//! detected per thread and reported as [`LockError`] before blocking.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::errors::LockError;
use crate::geometry::{BlockPos, Cuboid};
use crate::ids::StructureId;

/// Mutable, persisted state of a structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructureState {
    pub name: String,
    /// Shape kind, e.g. `"sliding_door"` or `"windmill"`.
    pub kind: String,
    pub is_open: bool,
    pub cuboid: Cuboid,
    pub rotation_point: BlockPos,
    /// Block whose power state can toggle the structure.
    pub power_block: Option<BlockPos>,
}

/// Immutable copy of a structure taken at request time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructureSnapshot {
    pub id: StructureId,
    pub name: String,
    pub kind: String,
    pub is_open: bool,
    pub cuboid: Cuboid,
    pub rotation_point: BlockPos,
    pub power_block: Option<BlockPos>,
}

impl StructureSnapshot {
    /// Whether the structure has a trigger that must be re-validated after
    /// its state changes.
    pub fn has_trigger(&self) -> bool {
        self.power_block.is_some()
    }
}

#[derive(Default, Clone, Copy)]
struct Held {
    reads: usize,
    write: bool,
}

thread_local! {
    static HELD: RefCell<HashMap<StructureId, Held>> = RefCell::new(HashMap::new());
}

fn held(id: StructureId) -> Held {
    HELD.with(|h| h.borrow().get(&id).copied().unwrap_or_default())
}

fn update_held(id: StructureId, f: impl FnOnce(&mut Held)) {
    HELD.with(|h| {
        let mut map = h.borrow_mut();
        let entry = map.entry(id).or_default();
        f(entry);
        if entry.reads == 0 && !entry.write {
            let _ = map.remove(&id);
        }
    });
}

/// A live structure guarded by a reader/writer lock.
#[derive(Debug)]
pub struct Structure {
    id: StructureId,
    state: RwLock<StructureState>,
}

impl Structure {
    pub fn new(id: StructureId, state: StructureState) -> Self {
        Self {
            id,
            state: RwLock::new(state),
        }
    }

    pub fn id(&self) -> StructureId {
        self.id
    }

    /// Acquire a read guard. Re-entrant on the same thread.
    pub fn read(&self) -> Result<StructureReadGuard<'_>, LockError> {
        let current = held(self.id);
        if current.write {
            return Err(LockError::ReadWhileWriting(self.id));
        }
        let guard = if current.reads > 0 {
            self.state.read_recursive()
        } else {
            self.state.read()
        };
        update_held(self.id, |h| h.reads += 1);
        Ok(StructureReadGuard { id: self.id, guard })
    }

    /// Acquire the exclusive write guard.
    pub fn write(&self) -> Result<StructureWriteGuard<'_>, LockError> {
        let current = held(self.id);
        if current.write {
            return Err(LockError::ReentrantWrite(self.id));
        }
        if current.reads > 0 {
            return Err(LockError::UpgradeWhileReading(self.id));
        }
        let guard = self.state.write();
        update_held(self.id, |h| h.write = true);
        Ok(StructureWriteGuard { id: self.id, guard })
    }

    pub fn snapshot(&self) -> Result<StructureSnapshot, LockError> {
        let state = self.read()?;
        Ok(StructureSnapshot {
            id: self.id,
            name: state.name.clone(),
            kind: state.kind.clone(),
            is_open: state.is_open,
            cuboid: state.cuboid,
            rotation_point: state.rotation_point,
            power_block: state.power_block,
        })
    }
}

pub struct StructureReadGuard<'a> {
    id: StructureId,
    guard: RwLockReadGuard<'a, StructureState>,
}

impl Deref for StructureReadGuard<'_> {
    type Target = StructureState;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl Drop for StructureReadGuard<'_> {
    fn drop(&mut self) {
        update_held(self.id, |h| h.reads = h.reads.saturating_sub(1));
    }
}

pub struct StructureWriteGuard<'a> {
    id: StructureId,
    guard: RwLockWriteGuard<'a, StructureState>,
}

impl Deref for StructureWriteGuard<'_> {
    type Target = StructureState;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for StructureWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for StructureWriteGuard<'_> {
    fn drop(&mut self) {
        update_held(self.id, |h| h.write = false);
    }
}
