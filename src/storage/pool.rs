use super::store::PersistentStore;
use super::table::PersistentTable;
use crate::config::{PoolConfig, TableConfig};
use crate::core::{DbError, Result};
use crate::transaction::DatabaseTransaction;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, TryAcquireError};

/// Table handle pool
///
/// Manages reusable handles to one named table of a physical store. The pool
/// is the sole arbiter of handle reuse: every [`take`](Self::take) must be
/// paired with exactly one [`return_table`](Self::return_table), and a
/// checked-out handle is never shared.
#[derive(Clone)]
pub struct PersistentTablePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    store: Arc<PersistentStore>,
    table_name: String,
    config: PoolConfig,
    /// Idle handles
    available: Mutex<VecDeque<PersistentTable>>,
    /// One permit per handle that may be checked out
    permits: Arc<Semaphore>,
    total_tables: AtomicUsize,
    checked_out: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl PersistentTablePool {
    /// Open the store in `directory`, create `table_name` if needed and pool
    /// handles to it.
    pub fn open<P: AsRef<Path>>(
        directory: P,
        table_name: &str,
        logical_name: &str,
        config: &TableConfig,
    ) -> Result<Self> {
        config.validate().map_err(DbError::ExecutionError)?;
        let store = PersistentStore::open(
            directory,
            &config.store_file_stem,
            config.durability,
            config.compaction_threshold,
        )?;
        store.ensure_table(table_name, logical_name)?;
        Self::new(Arc::new(store), table_name, config.pool.clone())
    }

    /// Pool handles to an existing table of `store`.
    pub fn new(store: Arc<PersistentStore>, table_name: &str, config: PoolConfig) -> Result<Self> {
        config.validate().map_err(DbError::ExecutionError)?;
        if !store.table_exists(table_name)? {
            return Err(DbError::TableNotFound(table_name.to_string()));
        }

        let pool = Self {
            inner: Arc::new(PoolInner {
                store,
                table_name: table_name.to_string(),
                permits: Arc::new(Semaphore::new(config.max_tables)),
                config,
                available: Mutex::new(VecDeque::new()),
                total_tables: AtomicUsize::new(0),
                checked_out: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        };

        // Pre-create minimum handles
        {
            let mut available = pool.inner.available.lock()?;
            while pool.inner.total_tables.load(Ordering::SeqCst) < pool.inner.config.min_tables {
                available.push_back(pool.new_handle());
            }
        }

        Ok(pool)
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.inner.store
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table_name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a handle, waiting up to the acquire timeout for one to free up.
    pub async fn take(&self) -> Result<PersistentTable> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let timeout = self.inner.config.acquire_timeout;
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| {
                DbError::PoolExhausted(format!(
                    "no handle to '{}' available after {:?}",
                    self.inner.table_name, timeout
                ))
            })?
            .map_err(|_| DbError::PoolClosed)?;

        let mut table = self.idle_or_new_handle()?;
        table.check_out(permit);
        self.inner.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(table)
    }

    /// Check out a handle only if one is free right now.
    pub fn try_take(&self) -> Result<Option<PersistentTable>> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Ok(None),
            Err(TryAcquireError::Closed) => return Err(DbError::PoolClosed),
        };

        let mut table = self.idle_or_new_handle()?;
        table.check_out(permit);
        self.inner.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(Some(table))
    }

    /// Give a checked-out handle back to the pool.
    pub fn return_table(&self, mut table: PersistentTable) {
        let Some(permit) = table.check_in() else {
            tracing::warn!(
                table = %self.inner.table_name,
                handle = table.id(),
                "returned a handle that was not checked out"
            );
            return;
        };
        self.inner.checked_out.fetch_sub(1, Ordering::SeqCst);

        if self.is_closed() || !Arc::ptr_eq(table.store(), &self.inner.store) {
            self.inner.total_tables.fetch_sub(1, Ordering::SeqCst);
        } else {
            match self.inner.available.lock() {
                Ok(mut available) => available.push_back(table),
                Err(_) => {
                    tracing::warn!(
                        table = %self.inner.table_name,
                        "pool lock poisoned; discarding returned handle"
                    );
                    self.inner.total_tables.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        drop(permit);
    }

    /// Begin a storage transaction over a pooled handle.
    pub async fn create_transaction(&self) -> Result<DatabaseTransaction> {
        let table = self.take().await?;
        Ok(DatabaseTransaction::begin(self.clone(), table))
    }

    /// Close the pool. Returns `false` if it was already closed.
    ///
    /// Waiters fail with [`DbError::PoolClosed`]; handles still checked out
    /// are discarded when they come back.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.permits.close();
        let drained = match self.inner.available.lock() {
            Ok(mut available) => available.drain(..).count(),
            Err(poisoned) => poisoned.into_inner().drain(..).count(),
        };
        self.inner.total_tables.fetch_sub(drained, Ordering::SeqCst);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether both values are clones of the same pool.
    pub fn same_pool(&self, other: &PersistentTablePool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let available = self
            .inner
            .available
            .lock()
            .map(|available| available.len())
            .unwrap_or(0);
        PoolStats {
            total_tables: self.inner.total_tables.load(Ordering::SeqCst),
            available_tables: available,
            checked_out: self.inner.checked_out.load(Ordering::SeqCst),
            max_tables: self.inner.config.max_tables,
        }
    }

    fn idle_or_new_handle(&self) -> Result<PersistentTable> {
        let mut available = self.inner.available.lock()?;

        // Recycle handles that sat idle too long
        if let Some(idle_timeout) = self.inner.config.idle_timeout {
            let before = available.len();
            available.retain(|table| table.last_used().elapsed() <= idle_timeout);
            let removed = before - available.len();
            if removed > 0 {
                self.inner.total_tables.fetch_sub(removed, Ordering::SeqCst);
            }
        }

        match available.pop_front() {
            Some(table) => Ok(table),
            None => Ok(self.new_handle()),
        }
    }

    fn new_handle(&self) -> PersistentTable {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.total_tables.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(table = %self.inner.table_name, handle = id, "created table handle");
        PersistentTable::new(id, &self.inner.table_name, Arc::clone(&self.inner.store))
    }
}

/// Table pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_tables: usize,
    pub available_tables: usize,
    pub checked_out: usize,
    pub max_tables: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} checked out, {} available, max {}",
            self.checked_out, self.total_tables, self.available_tables, self.max_tables
        )
    }
}
