use crate::core::OperationId;
use uuid::Uuid;

/// Which replica an apply call runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRole {
    /// The replica that originated the operation
    Primary,
    Secondary,
    /// Log replay after restart
    Recovery,
}

/// What an apply call asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyKind {
    Redo,
    /// The owning replicator transaction aborted
    Undo,
    /// Reverting operations a replica applied past the agreed log end
    FalseProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyContext {
    pub role: ApplyRole,
    pub kind: ApplyKind,
}

impl ApplyContext {
    pub const PRIMARY_REDO: ApplyContext = ApplyContext::new(ApplyRole::Primary, ApplyKind::Redo);
    pub const PRIMARY_UNDO: ApplyContext = ApplyContext::new(ApplyRole::Primary, ApplyKind::Undo);
    pub const SECONDARY_REDO: ApplyContext =
        ApplyContext::new(ApplyRole::Secondary, ApplyKind::Redo);
    pub const SECONDARY_FALSE_PROGRESS: ApplyContext =
        ApplyContext::new(ApplyRole::Secondary, ApplyKind::FalseProgress);
    pub const RECOVERY_REDO: ApplyContext = ApplyContext::new(ApplyRole::Recovery, ApplyKind::Redo);

    pub const fn new(role: ApplyRole, kind: ApplyKind) -> Self {
        Self { role, kind }
    }

    pub fn is_primary(&self) -> bool {
        self.role == ApplyRole::Primary
    }

    pub fn is_undo(&self) -> bool {
        matches!(self.kind, ApplyKind::Undo | ApplyKind::FalseProgress)
    }
}

impl std::fmt::Display for ApplyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{:?}", self.role, self.kind)
    }
}

/// Result of one apply call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The operation is committed; `resumed` when it finalized pre-applied work
    Committed { id: OperationId, resumed: bool },
    /// Speculative work for the operation was rolled back
    Discarded { id: OperationId },
}

impl ApplyOutcome {
    pub fn id(&self) -> OperationId {
        match self {
            ApplyOutcome::Committed { id, .. } | ApplyOutcome::Discarded { id } => *id,
        }
    }
}

/// Identity the framework binds a state provider to.
#[derive(Debug, Clone)]
pub struct InitializationParameters {
    pub partition_id: Uuid,
    pub replica_id: i64,
    /// Logical name, usually a URI such as `fabric:/journal`
    pub name: String,
    pub initialization_context: Option<Vec<u8>>,
    pub provider_id: Uuid,
}

impl InitializationParameters {
    pub fn new(partition_id: Uuid, name: &str) -> Self {
        Self {
            partition_id,
            replica_id: 0,
            name: name.to_string(),
            initialization_context: None,
            provider_id: Uuid::new_v4(),
        }
    }

    pub fn replica_id(mut self, replica_id: i64) -> Self {
        self.replica_id = replica_id;
        self
    }

    pub fn initialization_context(mut self, context: Vec<u8>) -> Self {
        self.initialization_context = Some(context);
        self
    }

    pub fn provider_id(mut self, provider_id: Uuid) -> Self {
        self.provider_id = provider_id;
        self
    }
}
