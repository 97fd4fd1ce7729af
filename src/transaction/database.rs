use super::{TransactionId, TransactionState};
use crate::core::{DbError, Key, Result, Value};
use crate::operation::KeyValueTable;
use crate::storage::{PersistentTable, PersistentTablePool};
use std::collections::BTreeMap;

/// A storage transaction plus the pooled table handle it writes through.
pub struct DatabaseTransaction {
    id: TransactionId,
    state: TransactionState,
    /// Uncommitted writes; `None` marks a delete
    writes: BTreeMap<Key, Option<Value>>,
    table: Option<PersistentTable>,
    pool: PersistentTablePool,
}

impl DatabaseTransaction {
    pub(crate) fn begin(pool: PersistentTablePool, table: PersistentTable) -> Self {
        let id = TransactionId(pool.store().begin_transaction_id());
        Self {
            id,
            state: TransactionState::Active,
            writes: BTreeMap::new(),
            table: Some(table),
            pool,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Table view that reads through and writes into this transaction.
    pub fn table(&mut self) -> Result<TransactionTable<'_>> {
        self.ensure_active("write through")?;
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| DbError::InvalidTransactionState(format!("{} has no table", self.id)))?;
        Ok(TransactionTable {
            txn: self.id,
            table,
            writes: &mut self.writes,
        })
    }

    /// Make the write set durable.
    ///
    /// A failed commit leaves the transaction active so it can be rolled back.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| DbError::InvalidTransactionState(format!("{} has no table", self.id)))?;
        let writes = self
            .writes
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        table.store().commit(self.id.0, table.name(), writes)?;

        self.writes.clear();
        self.state = TransactionState::Committed;
        self.release_locks();
        Ok(())
    }

    /// Discard the write set.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active("rollback")?;
        self.writes.clear();
        self.state = TransactionState::RolledBack;
        self.release_locks();
        Ok(())
    }

    /// Hand the transaction over to another call site.
    pub fn pause(mut self) -> Result<PausedTransaction> {
        self.ensure_active("pause")?;
        self.state = TransactionState::Paused;
        Ok(PausedTransaction { inner: self })
    }

    /// Release the transaction and return its handle to the pool.
    ///
    /// Disposing a transaction that never reached a terminal state rolls it
    /// back first.
    pub fn dispose(mut self) {
        if !self.state.is_terminal() {
            tracing::warn!(txn = %self.id, state = %self.state, "disposing unfinished transaction");
            self.writes.clear();
        }
        self.release();
    }

    fn release(&mut self) {
        self.release_locks();
        if let Some(table) = self.table.take() {
            self.pool.return_table(table);
        }
        self.state = TransactionState::Disposed;
    }

    fn release_locks(&self) {
        if let Err(err) = self.pool.store().release_locks(self.id.0) {
            tracing::warn!(txn = %self.id, error = %err, "failed to release key locks");
        }
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if !self.state.is_active() {
            return Err(DbError::InvalidTransactionState(format!(
                "Cannot {action}: transaction {} is {}",
                self.id, self.state
            )));
        }
        Ok(())
    }
}

impl Drop for DatabaseTransaction {
    fn drop(&mut self) {
        if self.table.is_some() {
            tracing::warn!(
                txn = %self.id,
                state = %self.state,
                "transaction dropped without dispose; discarding writes"
            );
            self.writes.clear();
            self.release();
        }
    }
}

impl std::fmt::Debug for DatabaseTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseTransaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending_writes", &self.writes.len())
            .finish()
    }
}

/// A transaction parked between pre-apply and its later commit or discard.
#[derive(Debug)]
pub struct PausedTransaction {
    inner: DatabaseTransaction,
}

impl PausedTransaction {
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.pending_writes()
    }

    /// Take control of the transaction back.
    pub fn resume(mut self) -> DatabaseTransaction {
        self.inner.state = TransactionState::Active;
        self.inner
    }
}

/// Table view scoped to one transaction.
pub struct TransactionTable<'a> {
    txn: TransactionId,
    table: &'a PersistentTable,
    writes: &'a mut BTreeMap<Key, Option<Value>>,
}

impl TransactionTable<'_> {
    pub fn name(&self) -> &str {
        self.table.name()
    }

    fn claim(&self, key: &[u8]) -> Result<()> {
        self.table.store().lock_key(self.txn.0, self.table.name(), key)
    }
}

impl KeyValueTable for TransactionTable<'_> {
    fn reserve(&mut self, key: &[u8]) -> Result<()> {
        self.claim(key)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        match self.writes.get(key) {
            Some(pending) => Ok(pending.clone()),
            None => self.table.get(key),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.claim(key)?;
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.claim(key)?;
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, TableConfig};
    use crate::operation::Operation;
    use crate::storage::DurabilityMode;
    use tempfile::TempDir;

    fn open_pool(dir: &TempDir) -> PersistentTablePool {
        let config = TableConfig::new(dir.path())
            .durability(DurabilityMode::Sync)
            .pool(PoolConfig::new().min_tables(1).max_tables(4));
        PersistentTablePool::open(dir.path(), "journal", "journal", &config).unwrap()
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let mut tx = pool.create_transaction().await.unwrap();
        Operation::set(b"k".to_vec(), b"v".to_vec())
            .apply(&mut tx.table().unwrap())
            .unwrap();
        assert_eq!(pool.store().get("journal", b"k").unwrap(), None);

        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        tx.dispose();

        assert_eq!(pool.store().get("journal", b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let mut tx = pool.create_transaction().await.unwrap();
        tx.table().unwrap().put(b"k", b"v").unwrap();
        tx.rollback().unwrap();
        tx.dispose();

        assert_eq!(pool.store().get("journal", b"k").unwrap(), None);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_reads_see_own_writes() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let mut tx = pool.create_transaction().await.unwrap();
        let mut table = tx.table().unwrap();
        table.put(b"k", b"v").unwrap();
        assert_eq!(table.get(b"k").unwrap(), Some(b"v".to_vec()));
        table.remove(b"k").unwrap();
        assert_eq!(table.get(b"k").unwrap(), None);
        tx.dispose();
    }

    #[tokio::test]
    async fn test_pause_and_resume_keep_writes() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let mut tx = pool.create_transaction().await.unwrap();
        tx.table().unwrap().put(b"k", b"v").unwrap();
        let paused = tx.pause().unwrap();
        assert_eq!(paused.pending_writes(), 1);
        assert_eq!(pool.stats().checked_out, 1);

        let mut tx = tokio::spawn(async move { paused.resume() }).await.unwrap();
        assert_eq!(tx.state(), TransactionState::Active);
        tx.commit().unwrap();
        tx.dispose();

        assert_eq!(pool.store().get("journal", b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_terminal_transactions_reject_work() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let mut tx = pool.create_transaction().await.unwrap();
        tx.commit().unwrap();
        assert!(tx.commit().is_err());
        assert!(tx.rollback().is_err());
        assert!(tx.table().is_err());
        assert!(matches!(
            tx.pause(),
            Err(DbError::InvalidTransactionState(_))
        ));
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_one_key_conflict() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let mut first = pool.create_transaction().await.unwrap();
        first.table().unwrap().put(b"k", b"a").unwrap();
        let first = first.pause().unwrap();

        let mut second = pool.create_transaction().await.unwrap();
        let err = Operation::set(b"k".to_vec(), b"b".to_vec())
            .apply(&mut second.table().unwrap())
            .unwrap_err();
        assert!(err.is_write_conflict());
        assert_eq!(second.pending_writes(), 0);
        second.rollback().unwrap();
        second.dispose();

        let mut first = first.resume();
        first.commit().unwrap();
        first.dispose();
        assert_eq!(pool.store().locked_keys().unwrap(), 0);

        // Once the owner is done the key is free again
        let mut third = pool.create_transaction().await.unwrap();
        let previous = Operation::set(b"k".to_vec(), b"c".to_vec())
            .apply(&mut third.table().unwrap())
            .unwrap();
        assert_eq!(previous, Some(b"a".to_vec()));
        third.commit().unwrap();
        third.dispose();
    }

    #[tokio::test]
    async fn test_dispose_and_drop_release_key_locks() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        let mut tx = pool.create_transaction().await.unwrap();
        tx.table().unwrap().put(b"a", b"1").unwrap();
        tx.dispose();
        assert_eq!(pool.store().locked_keys().unwrap(), 0);

        {
            let mut tx = pool.create_transaction().await.unwrap();
            tx.table().unwrap().remove(b"b").unwrap();
            assert_eq!(pool.store().locked_keys().unwrap(), 1);
        }
        assert_eq!(pool.store().locked_keys().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_returns_handle() {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir);

        {
            let mut tx = pool.create_transaction().await.unwrap();
            tx.table().unwrap().put(b"k", b"v").unwrap();
            let _paused = tx.pause().unwrap();
        }

        assert_eq!(pool.stats().checked_out, 0);
        assert_eq!(pool.store().get("journal", b"k").unwrap(), None);
    }
}
