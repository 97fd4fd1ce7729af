//! Write-Ahead Logging (WAL) and snapshot layer of the physical store

use crate::core::{DbError, Key, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

// ============================================================================
// WAL Entry Types
// ============================================================================

/// Write-Ahead Log entry types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntry {
    CreateTable {
        name: String,
        logical_name: String,
    },
    Commit {
        txn: u64,
        table: String,
        writes: Vec<(Key, Option<Value>)>,
    },
    ClearTable {
        name: String,
    },
    DropTable {
        name: String,
    },
}

// ============================================================================
// Store Image
// ============================================================================

/// Contents of one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableImage {
    /// Name the table was opened under, before sanitizing
    pub logical_name: String,
    pub rows: BTreeMap<Key, Value>,
}

impl TableImage {
    pub fn apply_writes(&mut self, writes: Vec<(Key, Option<Value>)>) {
        for (key, value) in writes {
            match value {
                Some(value) => {
                    self.rows.insert(key, value);
                }
                None => {
                    self.rows.remove(&key);
                }
            }
        }
    }
}

/// In-memory image of every table in a store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreImage {
    pub tables: BTreeMap<String, TableImage>,
    pub last_txn: u64,
}

impl StoreImage {
    /// Replay one WAL entry on top of the image.
    pub fn apply(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::CreateTable { name, logical_name } => {
                self.tables.entry(name).or_insert_with(|| TableImage {
                    logical_name,
                    rows: BTreeMap::new(),
                });
            }
            WalEntry::Commit { txn, table, writes } => {
                self.tables.entry(table).or_default().apply_writes(writes);
                self.last_txn = self.last_txn.max(txn);
            }
            WalEntry::ClearTable { name } => {
                if let Some(image) = self.tables.get_mut(&name) {
                    image.rows.clear();
                }
            }
            WalEntry::DropTable { name } => {
                self.tables.remove(&name);
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    image: StoreImage,
}

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync the WAL on every commit
    Sync,
    /// Flush the WAL to the OS on every commit
    #[default]
    Async,
    /// Keep everything in memory
    None,
}

// ============================================================================
// WAL Manager
// ============================================================================

pub struct WalManager {
    wal_path: PathBuf,
    wal_file: Option<BufWriter<File>>,
    durability_mode: DurabilityMode,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl WalManager {
    pub fn new<P: AsRef<Path>>(wal_path: P, durability_mode: DurabilityMode) -> Result<Self> {
        let wal_path = wal_path.as_ref().to_path_buf();
        if let Some(parent) = wal_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DbError::io("Failed to create WAL directory", e))?;
        }

        let wal_file = if durability_mode != DurabilityMode::None {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&wal_path)
                .map_err(|e| DbError::io("Failed to open WAL file", e))?;
            Some(BufWriter::new(file))
        } else {
            None
        };

        Ok(Self {
            wal_path,
            wal_file,
            durability_mode,
            entries_since_checkpoint: 0,
            checkpoint_threshold: 1000,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        let file = self
            .wal_file
            .as_mut()
            .ok_or_else(|| DbError::ExecutionError("WAL file not initialized".to_string()))?;
        let serialized = rmp_serde::to_vec(entry)?;
        let len = serialized.len() as u32;
        file.write_all(&len.to_le_bytes())
            .map_err(|e| DbError::io("Failed to write WAL", e))?;
        file.write_all(&serialized)
            .map_err(|e| DbError::io("Failed to write WAL", e))?;
        file.flush()
            .map_err(|e| DbError::io("Failed to flush WAL", e))?;
        if self.durability_mode == DurabilityMode::Sync {
            file.get_mut()
                .sync_all()
                .map_err(|e| DbError::io("Failed to sync WAL", e))?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    /// Read every complete entry. A record cut short by a crash ends the log.
    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        if !self.wal_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.wal_path)
            .map_err(|e| DbError::io("Failed to open WAL for reading", e))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(DbError::io("Failed to read WAL entry length", e)),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match reader.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(
                        path = %self.wal_path.display(),
                        recovered = entries.len(),
                        "ignoring torn WAL tail"
                    );
                    break;
                }
                Err(e) => return Err(DbError::io("Failed to read WAL entry data", e)),
            }
            let entry: WalEntry = rmp_serde::from_slice(&data)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.wal_file.as_mut() {
            file.flush()
                .map_err(|e| DbError::io("Failed to flush WAL", e))?;
            file.get_mut()
                .sync_all()
                .map_err(|e| DbError::io("Failed to sync WAL", e))?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.wal_file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.wal_path)
            .map_err(|e| DbError::io("Failed to truncate WAL", e))?;
        self.wal_file = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.entries_since_checkpoint >= self.checkpoint_threshold
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }

    pub fn set_checkpoint_threshold(&mut self, threshold: usize) {
        self.checkpoint_threshold = threshold;
    }
}

// ============================================================================
// Snapshot Manager
// ============================================================================

pub struct SnapshotManager {
    snapshot_path: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Atomically replace the snapshot file.
    pub fn save(&self, image: &StoreImage) -> Result<()> {
        let parent = self
            .snapshot_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|e| DbError::io("Failed to create snapshot directory", e))?;

        let temp_file = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| DbError::io("Failed to create temp file", e))?;
        let snapshot = SnapshotFile {
            version: SNAPSHOT_FORMAT_VERSION,
            image: image.clone(),
        };
        let serialized = rmp_serde::to_vec(&snapshot)?;
        {
            let mut writer = BufWriter::new(temp_file.as_file());
            writer
                .write_all(&serialized)
                .map_err(|e| DbError::io("Failed to write snapshot", e))?;
            writer
                .flush()
                .map_err(|e| DbError::io("Failed to flush snapshot", e))?;
        }
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| DbError::io("Failed to sync snapshot", e))?;
        temp_file
            .persist(&self.snapshot_path)
            .map_err(|e| DbError::io("Failed to rename snapshot", e.error))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreImage>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.snapshot_path)
            .map_err(|e| DbError::io("Failed to open snapshot", e))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| DbError::io("Failed to read snapshot", e))?;
        let snapshot: SnapshotFile = rmp_serde::from_slice(&data)?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(DbError::SerializationError(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot.image))
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }
}

// ============================================================================
// Persistence Manager
// ============================================================================

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    durability_mode: DurabilityMode,
}

impl PersistenceManager {
    pub fn new<P: AsRef<Path>>(
        data_dir: P,
        file_stem: &str,
        durability_mode: DurabilityMode,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let wal = WalManager::new(wal_path(data_dir, file_stem), durability_mode)?;
        let snapshot = SnapshotManager::new(snapshot_path(data_dir, file_stem));
        Ok(Self {
            wal,
            snapshot,
            durability_mode,
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    /// Fold the WAL into a fresh snapshot of `image`.
    pub fn checkpoint(&mut self, image: &StoreImage) -> Result<()> {
        if self.durability_mode == DurabilityMode::None {
            return Ok(());
        }
        self.snapshot.save(image)?;
        self.wal.clear()?;
        Ok(())
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.needs_checkpoint()
    }

    pub fn recover(&self) -> Result<StoreImage> {
        let mut image = self.snapshot.load()?.unwrap_or_default();
        for entry in self.wal.read_all()? {
            image.apply(entry);
        }
        Ok(image)
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }
    pub fn wal_mut(&mut self) -> &mut WalManager {
        &mut self.wal
    }
}

pub(crate) fn wal_path(data_dir: &Path, file_stem: &str) -> PathBuf {
    data_dir.join(format!("{file_stem}.wal"))
}

pub(crate) fn snapshot_path(data_dir: &Path, file_stem: &str) -> PathBuf {
    data_dir.join(format!("{file_stem}.snapshot"))
}
