// ============================================================================
// Operation Model
// ============================================================================
//
// Every mutation of a replicated table is a closed tagged variant that can be
// serialized into the replication log, decoded on any replica, and applied
// against a table. Applying an operation reports what the key held before,
// which is exactly what is needed to build its undo.
//
// ============================================================================

pub mod envelope;

pub use envelope::{OperationData, OperationEnvelope};

use crate::core::{Key, Result, Value};
use serde::{Deserialize, Serialize};

/// Minimal table surface operations are applied against.
pub trait KeyValueTable {
    /// Claim `key` for writing before it is read. Tables shared between
    /// concurrent writers fail here when another writer owns the key.
    fn reserve(&mut self, _key: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Read the current value of `key`, including uncommitted writes made
    /// through this table.
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Insert or overwrite `key`.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`; removing a missing key is not an error.
    fn remove(&mut self, key: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Set,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Set => write!(f, "SET"),
            OperationKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single table mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert or overwrite a key
    Set { key: Key, value: Value },

    /// Remove a key
    Delete { key: Key },
}

impl Operation {
    pub fn set(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Operation::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Operation::Delete { key: key.into() }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Set { .. } => OperationKind::Set,
            Operation::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Set { key, .. } | Operation::Delete { key } => key,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Operation::Set { value, .. } => Some(value),
            Operation::Delete { .. } => None,
        }
    }

    /// Apply the operation and return the value the key held before.
    ///
    /// The key is reserved before it is read, so the returned value (and the
    /// undo built from it) cannot be overtaken by another writer.
    pub fn apply<T: KeyValueTable + ?Sized>(&self, table: &mut T) -> Result<Option<Value>> {
        table.reserve(self.key())?;
        let previous = table.get(self.key())?;
        match self {
            Operation::Set { key, value } => table.put(key, value)?,
            Operation::Delete { key } => table.remove(key)?,
        }
        Ok(previous)
    }

    /// The operation that restores the key to `previous`, the value reported
    /// by [`Operation::apply`].
    pub fn undo(&self, previous: Option<Value>) -> Operation {
        let key = self.key().to_vec();
        match previous {
            Some(value) => Operation::Set { key, value },
            None => Operation::Delete { key },
        }
    }
}
