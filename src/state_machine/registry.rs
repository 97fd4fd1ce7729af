use crate::core::OperationId;
use crate::replication::ReplicatorTransaction;
use crate::transaction::PausedTransaction;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Pre-applied work awaiting its apply call.
pub struct OperationContext {
    replicator_transaction: Arc<dyn ReplicatorTransaction>,
    transaction: PausedTransaction,
}

impl OperationContext {
    pub fn new(
        replicator_transaction: Arc<dyn ReplicatorTransaction>,
        transaction: PausedTransaction,
    ) -> Self {
        Self {
            replicator_transaction,
            transaction,
        }
    }

    pub fn replicator_transaction_id(&self) -> i64 {
        self.replicator_transaction.id()
    }

    pub fn transaction(&self) -> &PausedTransaction {
        &self.transaction
    }

    pub fn into_transaction(self) -> PausedTransaction {
        self.transaction
    }
}

/// Operation id to in-flight context; at most one entry per id.
#[derive(Default)]
pub struct InFlightRegistry {
    operations: DashMap<OperationId, OperationContext>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `context` under `id`.
    ///
    /// If the id is already registered the existing entry is left alone and
    /// `context` is handed back.
    pub fn register(
        &self,
        id: OperationId,
        context: OperationContext,
    ) -> std::result::Result<(), OperationContext> {
        match self.operations.entry(id) {
            Entry::Occupied(_) => Err(context),
            Entry::Vacant(slot) => {
                slot.insert(context);
                Ok(())
            }
        }
    }

    pub fn take(&self, id: &OperationId) -> Option<OperationContext> {
        self.operations.remove(id).map(|(_, context)| context)
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.operations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<(OperationId, OperationContext)> {
        let ids: Vec<OperationId> = self.operations.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.operations.remove(&id))
            .collect()
    }
}
