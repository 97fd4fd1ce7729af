//! File-level backup and restore of a physical store

use super::persistence::{snapshot_path, wal_path};
use super::store::PersistentStore;
use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub const MANIFEST_FILE: &str = "backup.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreFileKind {
    Snapshot,
    Wal,
}

impl StoreFileKind {
    fn path(&self, dir: &Path, file_stem: &str) -> PathBuf {
        match self {
            StoreFileKind::Snapshot => snapshot_path(dir, file_stem),
            StoreFileKind::Wal => wal_path(dir, file_stem),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub kind: StoreFileKind,
    pub size_bytes: u64,
}

/// Describes the contents of a backup directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub created_at: String,
    pub file_stem: String,
    pub files: Vec<BackupFile>,
    pub table_count: usize,
    pub row_count: usize,
}

impl BackupManifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            DbError::io(format!("Failed to read backup manifest {}", path.display()), e)
        })?;
        serde_json::from_slice(&bytes).map_err(|e| DbError::SerializationError(e.to_string()))
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| DbError::SerializationError(e.to_string()))?;
        fs::write(dir.join(MANIFEST_FILE), bytes)
            .map_err(|e| DbError::io("Failed to write backup manifest", e))
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

impl PersistentStore {
    /// Copy the store files into `dir` with commits blocked.
    ///
    /// A cancelled backup removes what it already copied.
    pub fn backup_to(&self, dir: &Path, cancel: &CancellationToken) -> Result<BackupManifest> {
        self.with_quiesced(|tables| {
            fs::create_dir_all(dir)
                .map_err(|e| DbError::io("Failed to create backup directory", e))?;

            let stem = self.file_stem();
            let mut copied = Vec::new();
            for kind in [StoreFileKind::Snapshot, StoreFileKind::Wal] {
                if cancel.is_cancelled() {
                    remove_files(dir, stem, &copied);
                    return Err(DbError::Cancelled("backup".to_string()));
                }
                let source = kind.path(self.directory(), stem);
                if !source.exists() {
                    continue;
                }
                let size_bytes = fs::copy(&source, kind.path(dir, stem))
                    .map_err(|e| DbError::io(format!("Failed to copy {}", source.display()), e))?;
                copied.push(BackupFile { kind, size_bytes });
            }

            if cancel.is_cancelled() {
                remove_files(dir, stem, &copied);
                return Err(DbError::Cancelled("backup".to_string()));
            }

            let manifest = BackupManifest {
                created_at: chrono::Utc::now().to_rfc3339(),
                file_stem: stem.to_string(),
                files: copied,
                table_count: tables.len(),
                row_count: tables.values().map(|t| t.rows.len()).sum(),
            };
            manifest.save(dir)?;
            Ok(manifest)
        })
    }
}

/// Replace the store files in `target_dir` with those of a backup.
///
/// The store in `target_dir` must not be open.
pub fn restore_from(
    backup_dir: &Path,
    target_dir: &Path,
    file_stem: &str,
    cancel: &CancellationToken,
) -> Result<BackupManifest> {
    let manifest = BackupManifest::load(backup_dir)?;
    for file in &manifest.files {
        let path = file.kind.path(backup_dir, &manifest.file_stem);
        let size = fs::metadata(&path)
            .map_err(|e| DbError::io(format!("Backup file {} unreadable", path.display()), e))?
            .len();
        if size != file.size_bytes {
            return Err(DbError::ExecutionError(format!(
                "Backup file {} has {} bytes, manifest says {}",
                path.display(),
                size,
                file.size_bytes
            )));
        }
    }

    if cancel.is_cancelled() {
        return Err(DbError::Cancelled("restore".to_string()));
    }

    fs::create_dir_all(target_dir)
        .map_err(|e| DbError::io("Failed to create store directory", e))?;
    for kind in [StoreFileKind::Snapshot, StoreFileKind::Wal] {
        let existing = kind.path(target_dir, file_stem);
        if existing.exists() {
            fs::remove_file(&existing)
                .map_err(|e| DbError::io(format!("Failed to remove {}", existing.display()), e))?;
        }
    }
    for file in &manifest.files {
        let source = file.kind.path(backup_dir, &manifest.file_stem);
        fs::copy(&source, file.kind.path(target_dir, file_stem))
            .map_err(|e| DbError::io(format!("Failed to copy {}", source.display()), e))?;
    }
    Ok(manifest)
}

fn remove_files(dir: &Path, file_stem: &str, files: &[BackupFile]) {
    for file in files {
        let _ = fs::remove_file(file.kind.path(dir, file_stem));
    }
}
