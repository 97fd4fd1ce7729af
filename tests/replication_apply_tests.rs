use replicated_table::replication::simulated::{SimulatedReplicator, SimulatedTransaction};
use replicated_table::{
    ApplyContext, ApplyOutcome, DbError, InitializationParameters, Operation, OperationEnvelope,
    OperationId, ReliableTable, ReplicaRole, ReplicatorTransaction, StateProvider, TableConfig,
};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

async fn open_table(dir: &TempDir, name: &str) -> Arc<ReliableTable> {
    let table = ReliableTable::new(TableConfig::new(dir.path())).unwrap();
    table
        .initialize(InitializationParameters::new(Uuid::new_v4(), name))
        .unwrap();
    table.open().await.unwrap();
    Arc::new(table)
}

fn handle(txn: &Arc<SimulatedTransaction>) -> Arc<dyn ReplicatorTransaction> {
    txn.clone()
}

fn assert_baseline(table: &ReliableTable) {
    assert_eq!(table.in_flight_count(), 0);
    assert_eq!(table.pool_stats().unwrap().checked_out, 0);
}

#[tokio::test]
async fn test_pre_apply_matches_direct_apply() {
    let dir = TempDir::new().unwrap();
    let primary = open_table(&dir, "fabric:/journal").await;
    let secondary = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(primary.clone());
    replicator.change_role(ReplicaRole::Primary).await.unwrap();

    let txn = replicator.begin_transaction();
    primary.set(&handle(&txn), b"a".to_vec(), b"1".to_vec()).await.unwrap();
    primary.set(&handle(&txn), b"b".to_vec(), b"2".to_vec()).await.unwrap();
    primary.set(&handle(&txn), b"c".to_vec(), b"3".to_vec()).await.unwrap();
    assert_eq!(primary.in_flight_count(), 3);

    // Uncommitted writes are not visible
    assert_eq!(primary.get(b"a").await.unwrap(), None);

    let outcomes = replicator.commit(&txn).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, ApplyOutcome::Committed { resumed: true, .. }))
    );

    let txn = replicator.begin_transaction();
    let previous = primary.delete(&handle(&txn), b"b".to_vec()).await.unwrap();
    assert_eq!(previous, Some(b"2".to_vec()));
    replicator.commit(&txn).await.unwrap();

    let replayed = replicator
        .replay_to(secondary.as_ref(), ApplyContext::SECONDARY_REDO)
        .await
        .unwrap();
    assert_eq!(replayed, 4);

    let expected = vec![
        (b"a".to_vec(), b"1".to_vec()),
        (b"c".to_vec(), b"3".to_vec()),
    ];
    assert_eq!(primary.entries().await.unwrap(), expected);
    assert_eq!(secondary.entries().await.unwrap(), expected);
    assert_baseline(&primary);
    assert_baseline(&secondary);
}

#[tokio::test]
async fn test_set_returns_previous_value() {
    let dir = TempDir::new().unwrap();
    let table = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(table.clone());

    let txn = replicator.begin_transaction();
    let first = table.set(&handle(&txn), b"k".to_vec(), b"v1".to_vec()).await.unwrap();
    replicator.commit(&txn).await.unwrap();
    assert_eq!(first, None);

    let txn = replicator.begin_transaction();
    let second = table.set(&handle(&txn), b"k".to_vec(), b"v2".to_vec()).await.unwrap();
    replicator.commit(&txn).await.unwrap();
    assert_eq!(second, Some(b"v1".to_vec()));
    assert_eq!(table.get(b"k").await.unwrap(), Some(b"v2".to_vec()));
}

#[tokio::test]
async fn test_abort_rolls_back_pre_applied_work() {
    let dir = TempDir::new().unwrap();
    let table = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(table.clone());

    let txn = replicator.begin_transaction();
    table.set(&handle(&txn), b"k".to_vec(), b"v1".to_vec()).await.unwrap();
    replicator.commit(&txn).await.unwrap();

    let txn = replicator.begin_transaction();
    table.set(&handle(&txn), b"k".to_vec(), b"v2".to_vec()).await.unwrap();
    table.delete(&handle(&txn), b"other".to_vec()).await.unwrap();
    let outcomes = replicator.abort(&txn).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| matches!(o, ApplyOutcome::Discarded { .. })));
    assert_eq!(table.get(b"k").await.unwrap(), Some(b"v1".to_vec()));
    assert_baseline(&table);
}

#[tokio::test]
async fn test_duplicate_operation_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let table = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(table.clone());
    let id = OperationId::new();

    let txn = replicator.begin_transaction();
    table
        .execute_with_id(&handle(&txn), id, Operation::set(b"k".to_vec(), b"first".to_vec()))
        .await
        .unwrap();

    let err = table
        .execute_with_id(&handle(&txn), id, Operation::set(b"k2".to_vec(), b"second".to_vec()))
        .await
        .unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(err.to_string().contains("already in-progress"));

    // The original entry and its handle are untouched
    assert_eq!(table.in_flight_count(), 1);
    assert_eq!(table.pool_stats().unwrap().checked_out, 1);
    assert_eq!(txn.operation_count(), 1);

    replicator.commit(&txn).await.unwrap();
    assert_eq!(table.get(b"k").await.unwrap(), Some(b"first".to_vec()));
    assert_eq!(table.get(b"k2").await.unwrap(), None);
    assert_baseline(&table);
}

#[tokio::test]
async fn test_replicator_failure_discards_pre_applied_work() {
    let dir = TempDir::new().unwrap();
    let table = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(table.clone());

    let txn = replicator.begin_transaction();
    txn.fail_next_add_operation();
    let result = table.set(&handle(&txn), b"k".to_vec(), b"v".to_vec()).await;

    assert!(matches!(result, Err(DbError::ExecutionError(_))));
    assert_baseline(&table);
    assert_eq!(table.get(b"k").await.unwrap(), None);

    // The id is free again and the table keeps working
    table.set(&handle(&txn), b"k".to_vec(), b"v".to_vec()).await.unwrap();
    replicator.commit(&txn).await.unwrap();
    assert_eq!(table.get(b"k").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_false_progress_applies_undo_directly() {
    let dir = TempDir::new().unwrap();
    let primary = open_table(&dir, "fabric:/journal").await;
    let secondary = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(primary.clone());

    let txn = replicator.begin_transaction();
    primary.set(&handle(&txn), b"k".to_vec(), b"v".to_vec()).await.unwrap();
    replicator.commit(&txn).await.unwrap();
    replicator
        .replay_to(secondary.as_ref(), ApplyContext::SECONDARY_REDO)
        .await
        .unwrap();
    assert_eq!(secondary.get(b"k").await.unwrap(), Some(b"v".to_vec()));

    let undo = OperationEnvelope::new(OperationId::new(), Operation::delete(b"k".to_vec()))
        .to_data()
        .unwrap();
    let local = SimulatedReplicator::new(secondary.clone());
    let outcome = local
        .deliver(&undo, ApplyContext::SECONDARY_FALSE_PROGRESS)
        .await
        .unwrap();

    assert!(matches!(outcome, ApplyOutcome::Committed { resumed: false, .. }));
    assert_eq!(secondary.get(b"k").await.unwrap(), None);
    assert_baseline(&secondary);
}

#[tokio::test]
async fn test_malformed_payload_fails_without_leaking() {
    let dir = TempDir::new().unwrap();
    let table = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(table.clone());

    let garbage = replicated_table::OperationData::single(vec![0xc1, 0x00, 0x17]);
    let result = replicator.deliver(&garbage, ApplyContext::SECONDARY_REDO).await;

    assert!(matches!(result, Err(DbError::SerializationError(_))));
    assert_baseline(&table);
}

#[tokio::test]
async fn test_recovery_replay_is_direct_apply() {
    let dir = TempDir::new().unwrap();
    let primary = open_table(&dir, "fabric:/journal").await;
    let recovering = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(primary.clone());

    let txn = replicator.begin_transaction();
    for i in 0..10u8 {
        primary.set(&handle(&txn), vec![i], vec![i, i]).await.unwrap();
    }
    replicator.commit(&txn).await.unwrap();

    replicator
        .replay_to(recovering.as_ref(), ApplyContext::RECOVERY_REDO)
        .await
        .unwrap();
    assert_eq!(recovering.len().await.unwrap(), 10);
    assert_eq!(recovering.get(&[4]).await.unwrap(), Some(vec![4, 4]));
    assert_baseline(&recovering);
}

#[tokio::test]
async fn test_concurrent_writers_on_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let table = open_table(&dir, "fabric:/journal").await;
    let replicator = Arc::new(SimulatedReplicator::new(table.clone()));

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let table = table.clone();
        let replicator = replicator.clone();
        tasks.push(tokio::spawn(async move {
            let txn = replicator.begin_transaction();
            let handle: Arc<dyn ReplicatorTransaction> = txn.clone();
            table.set(&handle, vec![i], vec![i]).await.unwrap();
            replicator.commit(&txn).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(table.len().await.unwrap(), 8);
    assert_baseline(&table);
}

#[tokio::test]
async fn test_second_writer_on_pending_key_conflicts() {
    let dir = TempDir::new().unwrap();
    let primary = open_table(&dir, "fabric:/journal").await;
    let secondary = open_table(&dir, "fabric:/journal").await;
    let replicator = SimulatedReplicator::new(primary.clone());

    let first = replicator.begin_transaction();
    primary.set(&handle(&first), b"k".to_vec(), b"a".to_vec()).await.unwrap();

    let second = replicator.begin_transaction();
    let err = primary
        .set(&handle(&second), b"k".to_vec(), b"b".to_vec())
        .await
        .unwrap_err();
    assert!(err.is_write_conflict());
    let err = primary.delete(&handle(&second), b"k".to_vec()).await.unwrap_err();
    assert!(err.is_write_conflict());

    // Only the first writer's work is parked
    assert_eq!(primary.in_flight_count(), 1);
    assert_eq!(primary.pool_stats().unwrap().checked_out, 1);
    assert_eq!(second.operation_count(), 0);

    replicator.commit(&first).await.unwrap();
    let previous = primary
        .set(&handle(&second), b"k".to_vec(), b"b".to_vec())
        .await
        .unwrap();
    assert_eq!(previous, Some(b"a".to_vec()));
    replicator.commit(&second).await.unwrap();

    replicator
        .replay_to(secondary.as_ref(), ApplyContext::SECONDARY_REDO)
        .await
        .unwrap();
    let expected = vec![(b"k".to_vec(), b"b".to_vec())];
    assert_eq!(primary.entries().await.unwrap(), expected);
    assert_eq!(secondary.entries().await.unwrap(), expected);
    assert_baseline(&primary);
    assert_baseline(&secondary);
}

#[tokio::test]
async fn test_concurrent_writers_on_one_key_stay_convergent() {
    let dir = TempDir::new().unwrap();
    let primary = open_table(&dir, "fabric:/journal").await;
    let secondary = open_table(&dir, "fabric:/journal").await;
    let replicator = Arc::new(SimulatedReplicator::new(primary.clone()));

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let primary = primary.clone();
        let replicator = replicator.clone();
        tasks.push(tokio::spawn(async move {
            let txn = replicator.begin_transaction();
            let handle: Arc<dyn ReplicatorTransaction> = txn.clone();
            match primary.set(&handle, b"k".to_vec(), vec![i]).await {
                Ok(_) => {
                    replicator.commit(&txn).await.unwrap();
                    true
                }
                Err(err) => {
                    assert!(err.is_write_conflict());
                    assert_eq!(txn.operation_count(), 0);
                    false
                }
            }
        }));
    }
    let mut committed = 0;
    for task in tasks {
        if task.await.unwrap() {
            committed += 1;
        }
    }
    assert!(committed >= 1);

    replicator
        .replay_to(secondary.as_ref(), ApplyContext::SECONDARY_REDO)
        .await
        .unwrap();
    assert_eq!(primary.entries().await.unwrap(), secondary.entries().await.unwrap());
    assert_baseline(&primary);
    assert_baseline(&secondary);
}
