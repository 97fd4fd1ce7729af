use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw key bytes of a table row.
pub type Key = Vec<u8>;

/// Raw value bytes of a table row.
pub type Value = Vec<u8>;

/// Position of a replicated operation in the partition's totally ordered log.
pub type LogPosition = i64;

/// Identifier of one logical mutation.
///
/// The forward operation and its undo share the id, so the apply path can
/// find the speculative work either one refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a new random operation ID
    pub fn new() -> Self {
        OperationId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        OperationId(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op_{}", self.0.simple())
    }
}

/// Role of this replica within its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicaRole {
    #[default]
    Unknown,
    None,
    IdleSecondary,
    ActiveSecondary,
    Primary,
}

impl ReplicaRole {
    pub fn is_primary(&self) -> bool {
        matches!(self, ReplicaRole::Primary)
    }
}

impl std::fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaRole::Unknown => write!(f, "UNKNOWN"),
            ReplicaRole::None => write!(f, "NONE"),
            ReplicaRole::IdleSecondary => write!(f, "IDLE_SECONDARY"),
            ReplicaRole::ActiveSecondary => write!(f, "ACTIVE_SECONDARY"),
            ReplicaRole::Primary => write!(f, "PRIMARY"),
        }
    }
}
