use crate::ids::StructureId;

/// Misuse of a structure's reader/writer lock that would otherwise deadlock.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("write lock on {0} requested while this thread holds a read lock on it")]
    UpgradeWhileReading(StructureId),

    #[error("write lock on {0} requested while this thread already holds it")]
    ReentrantWrite(StructureId),

    #[error("read lock on {0} requested while this thread holds its write lock")]
    ReadWhileWriting(StructureId),
}

impl LockError {
    pub fn structure_id(&self) -> StructureId {
        match self {
            Self::UpgradeWhileReading(id) | Self::ReentrantWrite(id) | Self::ReadWhileWriting(id) => *id,
        }
    }
}
