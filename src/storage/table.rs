use super::store::PersistentStore;
use crate::core::{Key, Result, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;

/// A handle bound to one named table of a [`PersistentStore`].
///
/// Handles are handed out by the table pool; a checked-out handle carries
/// the pool permit that makes it exclusive to its holder.
pub struct PersistentTable {
    id: u64,
    name: String,
    store: Arc<PersistentStore>,
    last_used: Instant,
    permit: Option<OwnedSemaphorePermit>,
}

impl PersistentTable {
    pub(crate) fn new(id: u64, name: &str, store: Arc<PersistentStore>) -> Self {
        Self {
            id,
            name: name.to_string(),
            store,
            last_used: Instant::now(),
            permit: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// Committed value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        self.store.get(&self.name, key)
    }

    pub fn len(&self) -> Result<usize> {
        self.store.row_count(&self.name)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Forward cursor over every committed row, in key order.
    pub fn get_range(&self) -> TableCursor {
        TableCursor {
            store: Arc::clone(&self.store),
            table: self.name.clone(),
            position: None,
            exhausted: false,
        }
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn check_out(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
        self.last_used = Instant::now();
    }

    pub(crate) fn check_in(&mut self) -> Option<OwnedSemaphorePermit> {
        self.last_used = Instant::now();
        self.permit.take()
    }
}

impl std::fmt::Debug for PersistentTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("checked_out", &self.permit.is_some())
            .finish()
    }
}

/// Lazy forward cursor over a table.
///
/// Each step seeks past the last key it returned, so rows committed ahead of
/// the cursor while it is open are observed and rows behind it are not.
pub struct TableCursor {
    store: Arc<PersistentStore>,
    table: String,
    position: Option<Key>,
    exhausted: bool,
}

impl TableCursor {
    pub fn advance(&mut self) -> Result<Option<(Key, Value)>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.store.next_row(&self.table, self.position.as_deref())? {
            Some((key, value)) => {
                self.position = Some(key.clone());
                Ok(Some((key, value)))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

impl Iterator for TableCursor {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}
