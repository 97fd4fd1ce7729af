use replicated_table::replication::simulated::SimulatedReplicator;
use replicated_table::storage::BackupManifest;
use replicated_table::{
    DbError, InitializationParameters, ReliableTable, ReplicatorTransaction, StateProvider,
    TableConfig,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn open_table(dir: &TempDir, partition_id: Uuid) -> Arc<ReliableTable> {
    let table = ReliableTable::new(TableConfig::new(dir.path())).unwrap();
    table
        .initialize(InitializationParameters::new(partition_id, "fabric:/journal"))
        .unwrap();
    table.open().await.unwrap();
    Arc::new(table)
}

async fn commit_set(table: &Arc<ReliableTable>, key: &str, value: &str) {
    let replicator = SimulatedReplicator::new(table.clone());
    let txn = replicator.begin_transaction();
    let handle: Arc<dyn ReplicatorTransaction> = txn.clone();
    table.set(&handle, key.as_bytes(), value.as_bytes()).await.unwrap();
    replicator.commit(&txn).await.unwrap();
}

#[tokio::test]
async fn test_restore_returns_to_backed_up_state() {
    let dir = TempDir::new().unwrap();
    let backup_dir = TempDir::new().unwrap();
    let table = open_table(&dir, Uuid::new_v4()).await;
    let cancel = CancellationToken::new();

    commit_set(&table, "k", "before").await;
    table.backup_checkpoint(backup_dir.path(), &cancel).await.unwrap();

    let manifest = BackupManifest::load(backup_dir.path()).unwrap();
    assert_eq!(manifest.row_count, 1);
    assert_eq!(manifest.table_count, 1);

    commit_set(&table, "k", "after").await;
    commit_set(&table, "other", "x").await;

    table.restore_checkpoint(backup_dir.path(), &cancel).await.unwrap();
    assert!(table.is_open());
    assert_eq!(table.get(b"k").await.unwrap(), Some(b"before".to_vec()));
    assert_eq!(table.get(b"other").await.unwrap(), None);
}

#[tokio::test]
async fn test_restore_into_another_partition() {
    let dir = TempDir::new().unwrap();
    let backup_dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let source = open_table(&dir, Uuid::new_v4()).await;
    commit_set(&source, "a", "1").await;
    commit_set(&source, "b", "2").await;
    source.backup_checkpoint(backup_dir.path(), &cancel).await.unwrap();

    let target = open_table(&dir, Uuid::new_v4()).await;
    target.restore_checkpoint(backup_dir.path(), &cancel).await.unwrap();
    assert_eq!(target.entries().await.unwrap(), source.entries().await.unwrap());
}

#[tokio::test]
async fn test_cancelled_backup_leaves_no_manifest() {
    let dir = TempDir::new().unwrap();
    let backup_dir = TempDir::new().unwrap();
    let table = open_table(&dir, Uuid::new_v4()).await;
    commit_set(&table, "k", "v").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = table.backup_checkpoint(backup_dir.path(), &cancel).await;

    assert!(matches!(result, Err(DbError::Cancelled(_))));
    assert!(BackupManifest::load(backup_dir.path()).is_err());
}

#[tokio::test]
async fn test_backup_requires_open_table() {
    let dir = TempDir::new().unwrap();
    let backup_dir = TempDir::new().unwrap();
    let table = open_table(&dir, Uuid::new_v4()).await;
    table.close().await.unwrap();

    let result = table
        .backup_checkpoint(backup_dir.path(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(DbError::NotOpen)));
}

#[tokio::test]
async fn test_rejected_restore_keeps_table_open() {
    let dir = TempDir::new().unwrap();
    let not_a_backup = TempDir::new().unwrap();
    let table = open_table(&dir, Uuid::new_v4()).await;
    let cancel = CancellationToken::new();
    commit_set(&table, "k", "v").await;

    let result = table.restore_checkpoint(not_a_backup.path(), &cancel).await;

    assert!(result.is_err());
    assert!(table.is_open());
    assert_eq!(table.get(b"k").await.unwrap(), Some(b"v".to_vec()));
    commit_set(&table, "k2", "v2").await;
    assert_eq!(table.len().await.unwrap(), 2);
}
