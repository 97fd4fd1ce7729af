use super::persistence::{DurabilityMode, PersistenceManager, StoreImage, TableImage, WalEntry};
use crate::core::{DbError, Key, Result, Value};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// The physical store of one partition.
///
/// Holds every table of the partition in memory, backed by a WAL and a
/// snapshot file in the store directory. All mutations go through
/// [`PersistentStore::commit`], which logs before it applies; the
/// persistence lock is always taken before the table lock.
///
/// Keys written by an open transaction are owned by it until it commits or
/// rolls back; a second writer on such a key gets [`DbError::WriteConflict`].
pub struct PersistentStore {
    directory: PathBuf,
    file_stem: String,
    tables: RwLock<BTreeMap<String, TableImage>>,
    persistence: Mutex<PersistenceManager>,
    next_txn: AtomicU64,
    /// (table, key) -> owning transaction
    write_locks: Mutex<HashMap<(String, Key), u64>>,
}

impl PersistentStore {
    /// Open (or create) the store in `directory`, recovering its contents.
    pub fn open<P: AsRef<Path>>(
        directory: P,
        file_stem: &str,
        durability: DurabilityMode,
        compaction_threshold: usize,
    ) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)
            .map_err(|e| DbError::io("Failed to create store directory", e))?;

        let mut persistence = PersistenceManager::new(&directory, file_stem, durability)?;
        persistence
            .wal_mut()
            .set_checkpoint_threshold(compaction_threshold);
        let StoreImage { tables, last_txn } = persistence.recover()?;

        tracing::debug!(
            directory = %directory.display(),
            tables = tables.len(),
            last_txn,
            "store recovered"
        );

        Ok(Self {
            directory,
            file_stem: file_stem.to_string(),
            tables: RwLock::new(tables),
            persistence: Mutex::new(persistence),
            next_txn: AtomicU64::new(last_txn + 1),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_stem(&self) -> &str {
        &self.file_stem
    }

    /// Create `name` if missing; fail if it exists under another logical name.
    pub fn ensure_table(&self, name: &str, logical_name: &str) -> Result<()> {
        let mut persistence = self.persistence.lock()?;
        {
            let tables = self.tables.read()?;
            if let Some(existing) = tables.get(name) {
                if existing.logical_name != logical_name {
                    return Err(DbError::TableNameConflict {
                        table: name.to_string(),
                        existing: existing.logical_name.clone(),
                        requested: logical_name.to_string(),
                    });
                }
                return Ok(());
            }
        }

        persistence.log(&WalEntry::CreateTable {
            name: name.to_string(),
            logical_name: logical_name.to_string(),
        })?;
        self.tables.write()?.insert(
            name.to_string(),
            TableImage {
                logical_name: logical_name.to_string(),
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.tables.read()?.contains_key(name))
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.tables.read()?.keys().cloned().collect())
    }

    pub fn logical_name(&self, name: &str) -> Result<String> {
        self.tables
            .read()?
            .get(name)
            .map(|t| t.logical_name.clone())
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn row_count(&self, name: &str) -> Result<usize> {
        self.tables
            .read()?
            .get(name)
            .map(|t| t.rows.len())
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    /// Committed value of `key`.
    pub fn get(&self, table: &str, key: &[u8]) -> Result<Option<Value>> {
        let tables = self.tables.read()?;
        let image = tables
            .get(table)
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        Ok(image.rows.get(key).cloned())
    }

    /// First committed row strictly after `after` (or the first row).
    pub fn next_row(&self, table: &str, after: Option<&[u8]>) -> Result<Option<(Key, Value)>> {
        let tables = self.tables.read()?;
        let image = tables
            .get(table)
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Ok(image
            .rows
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    pub fn begin_transaction_id(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::SeqCst)
    }

    /// Durably apply `writes` (`None` deletes) to `table`.
    pub fn commit(&self, txn: u64, table: &str, writes: Vec<(Key, Option<Value>)>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut persistence = self.persistence.lock()?;
        if !self.tables.read()?.contains_key(table) {
            return Err(DbError::TableNotFound(table.to_string()));
        }

        let entry = WalEntry::Commit {
            txn,
            table: table.to_string(),
            writes,
        };
        persistence.log(&entry)?;

        if let WalEntry::Commit { writes, .. } = entry
            && let Some(image) = self.tables.write()?.get_mut(table)
        {
            image.apply_writes(writes);
        }
        Ok(())
    }

    /// Remove every row of `table`.
    pub fn clear_table(&self, table: &str) -> Result<()> {
        let mut persistence = self.persistence.lock()?;
        if !self.tables.read()?.contains_key(table) {
            return Err(DbError::TableNotFound(table.to_string()));
        }
        persistence.log(&WalEntry::ClearTable {
            name: table.to_string(),
        })?;
        if let Some(image) = self.tables.write()?.get_mut(table) {
            image.rows.clear();
        }
        Ok(())
    }

    /// Remove `table` and every row in it.
    pub fn drop_table(&self, table: &str) -> Result<()> {
        let mut persistence = self.persistence.lock()?;
        if !self.tables.read()?.contains_key(table) {
            return Err(DbError::TableNotFound(table.to_string()));
        }
        persistence.log(&WalEntry::DropTable {
            name: table.to_string(),
        })?;
        self.tables.write()?.remove(table);
        self.write_locks.lock()?.retain(|(name, _), _| name != table);
        Ok(())
    }

    /// Claim `key` of `table` for writes by `txn`.
    ///
    /// Claiming a key the transaction already owns is a no-op.
    pub fn lock_key(&self, txn: u64, table: &str, key: &[u8]) -> Result<()> {
        let mut locks = self.write_locks.lock()?;
        match locks.get(&(table.to_string(), key.to_vec())) {
            Some(&owner) if owner != txn => Err(DbError::WriteConflict {
                table: table.to_string(),
                txn,
                owner,
            }),
            Some(_) => Ok(()),
            None => {
                locks.insert((table.to_string(), key.to_vec()), txn);
                Ok(())
            }
        }
    }

    /// Release every key claimed by `txn`.
    pub fn release_locks(&self, txn: u64) -> Result<()> {
        self.write_locks.lock()?.retain(|_, owner| *owner != txn);
        Ok(())
    }

    /// Keys currently claimed by open transactions
    pub fn locked_keys(&self) -> Result<usize> {
        Ok(self.write_locks.lock()?.len())
    }

    /// Make every commit so far durable, compacting once the WAL is long.
    pub fn flush(&self) -> Result<()> {
        let mut persistence = self.persistence.lock()?;
        persistence.wal_mut().sync()?;
        if persistence.needs_checkpoint() {
            self.compact_locked(&mut persistence)?;
        }
        Ok(())
    }

    /// Fold the WAL into the snapshot now.
    pub fn compact(&self) -> Result<()> {
        let mut persistence = self.persistence.lock()?;
        self.compact_locked(&mut persistence)
    }

    fn compact_locked(&self, persistence: &mut PersistenceManager) -> Result<()> {
        let image = StoreImage {
            tables: self.tables.read()?.clone(),
            last_txn: self.next_txn.load(Ordering::SeqCst).saturating_sub(1),
        };
        persistence.checkpoint(&image)?;
        tracing::debug!(
            directory = %self.directory.display(),
            rows = image.row_count(),
            "store compacted"
        );
        Ok(())
    }

    /// Run `f` with commits blocked and the WAL synced.
    pub(crate) fn with_quiesced<T>(
        &self,
        f: impl FnOnce(&BTreeMap<String, TableImage>) -> Result<T>,
    ) -> Result<T> {
        let mut persistence = self.persistence.lock()?;
        persistence.wal_mut().sync()?;
        let tables = self.tables.read()?;
        f(&tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &Path) -> PersistentStore {
        PersistentStore::open(dir, "db", DurabilityMode::Sync, 1000).unwrap()
    }

    #[test]
    fn test_commit_and_read() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        store.ensure_table("journal", "fabric:/journal").unwrap();

        let txn = store.begin_transaction_id();
        store
            .commit(txn, "journal", vec![(b"a".to_vec(), Some(b"1".to_vec()))])
            .unwrap();

        assert_eq!(store.get("journal", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.row_count("journal").unwrap(), 1);
    }

    #[test]
    fn test_reopen_recovers_commits() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(dir.path());
            store.ensure_table("journal", "j").unwrap();
            let txn = store.begin_transaction_id();
            store
                .commit(txn, "journal", vec![(b"a".to_vec(), Some(b"1".to_vec()))])
                .unwrap();
            store.compact().unwrap();
            let txn = store.begin_transaction_id();
            store
                .commit(txn, "journal", vec![(b"b".to_vec(), Some(b"2".to_vec()))])
                .unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.row_count("journal").unwrap(), 2);
        assert_eq!(store.logical_name("journal").unwrap(), "j");
        assert!(store.begin_transaction_id() > 2);
    }

    #[test]
    fn test_conflicting_logical_name() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        store.ensure_table("journal", "fabric:/journal").unwrap();
        store.ensure_table("journal", "fabric:/journal").unwrap();

        let err = store.ensure_table("journal", "fabric:/jour.nal").unwrap_err();
        assert!(matches!(err, DbError::TableNameConflict { .. }));
    }

    #[test]
    fn test_next_row_walks_in_key_order() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        store.ensure_table("t", "t").unwrap();
        let txn = store.begin_transaction_id();
        store
            .commit(
                txn,
                "t",
                vec![
                    (b"b".to_vec(), Some(b"2".to_vec())),
                    (b"a".to_vec(), Some(b"1".to_vec())),
                ],
            )
            .unwrap();

        let first = store.next_row("t", None).unwrap().unwrap();
        assert_eq!(first.0, b"a".to_vec());
        let second = store.next_row("t", Some(&first.0)).unwrap().unwrap();
        assert_eq!(second.0, b"b".to_vec());
        assert!(store.next_row("t", Some(&second.0)).unwrap().is_none());
    }

    #[test]
    fn test_second_writer_on_a_key_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        store.ensure_table("journal", "fabric:/journal").unwrap();
        let first = store.begin_transaction_id();
        let second = store.begin_transaction_id();

        store.lock_key(first, "journal", b"k").unwrap();
        store.lock_key(first, "journal", b"k").unwrap();
        let err = store.lock_key(second, "journal", b"k").unwrap_err();
        assert!(matches!(err, DbError::WriteConflict { owner, .. } if owner == first));

        // Other keys and other tables are independent
        store.lock_key(second, "journal", b"other").unwrap();
        store.lock_key(second, "archive", b"k").unwrap();

        store.release_locks(first).unwrap();
        store.lock_key(second, "journal", b"k").unwrap();
        store.release_locks(second).unwrap();
        assert_eq!(store.locked_keys().unwrap(), 0);
    }

    #[test]
    fn test_drop_table_is_durable() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(dir.path());
            store.ensure_table("journal", "fabric:/journal").unwrap();
            let txn = store.begin_transaction_id();
            store
                .commit(txn, "journal", vec![(b"a".to_vec(), Some(b"1".to_vec()))])
                .unwrap();
            store.drop_table("journal").unwrap();
            assert!(matches!(
                store.drop_table("journal"),
                Err(DbError::TableNotFound(_))
            ));
        }

        let store = open(dir.path());
        assert!(!store.table_exists("journal").unwrap());
    }

    #[test]
    fn test_missing_table() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        assert!(matches!(
            store.get("nope", b"k"),
            Err(DbError::TableNotFound(_))
        ));
        assert!(store.commit(1, "nope", vec![(b"k".to_vec(), None)]).is_err());
    }

    #[test]
    fn test_clear_table() {
        let dir = TempDir::new().unwrap();
        let store = open(dir.path());
        store.ensure_table("t", "t").unwrap();
        store
            .commit(1, "t", vec![(b"k".to_vec(), Some(b"v".to_vec()))])
            .unwrap();
        store.clear_table("t").unwrap();
        assert_eq!(store.row_count("t").unwrap(), 0);
    }

    #[test]
    fn test_flush_compacts_past_threshold() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::open(dir.path(), "db", DurabilityMode::Async, 2).unwrap();
        store.ensure_table("t", "t").unwrap();
        store
            .commit(1, "t", vec![(b"k".to_vec(), Some(b"v".to_vec()))])
            .unwrap();
        store.flush().unwrap();

        assert!(dir.path().join("db.snapshot").exists());
        assert_eq!(std::fs::metadata(dir.path().join("db.wal")).unwrap().len(), 0);
    }
}
