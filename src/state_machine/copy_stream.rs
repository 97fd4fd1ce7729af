use crate::core::{DbError, OperationId, Result};
use crate::operation::{Operation, OperationData, OperationEnvelope};
use crate::replication::OperationDataStream;
use crate::storage::{PersistentTable, PersistentTablePool, TableCursor};
use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

/// Full-state stream used to build a new replica.
///
/// Holds one pooled handle from creation until the first end-of-stream, and
/// yields one encoded `Set` per committed row in key order. Once exhausted it
/// keeps answering with the end marker.
pub struct CopyStream {
    pool: PersistentTablePool,
    table: Option<PersistentTable>,
    cursor: TableCursor,
    records: u64,
}

impl CopyStream {
    pub async fn new(pool: PersistentTablePool) -> Result<Self> {
        let table = pool.take().await?;
        let cursor = table.get_range();
        Ok(Self {
            pool,
            table: Some(table),
            cursor,
            records: 0,
        })
    }

    /// Records produced so far
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn is_finished(&self) -> bool {
        self.table.is_none()
    }

    pub fn next_record(&mut self) -> Result<Option<OperationData>> {
        if self.table.is_none() {
            return Ok(None);
        }

        match self.cursor.advance()? {
            Some((key, value)) => {
                let envelope = OperationEnvelope::new(OperationId::new(), Operation::set(key, value));
                self.records += 1;
                Ok(Some(envelope.to_data()?))
            }
            None => {
                if let Some(table) = self.table.take() {
                    tracing::debug!(
                        table = %table.name(),
                        records = self.records,
                        "copy stream exhausted"
                    );
                    self.pool.return_table(table);
                }
                Ok(None)
            }
        }
    }

    /// Adapt into a `futures` stream that ends at the first end marker or error.
    pub fn into_stream(self) -> impl Stream<Item = Result<OperationData>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.next_record() {
                Ok(Some(data)) => Some((Ok(data), Some(stream))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

#[async_trait]
impl OperationDataStream for CopyStream {
    async fn get_next(&mut self, cancel: &CancellationToken) -> Result<Option<OperationData>> {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled("copy stream".to_string()));
        }
        self.next_record()
    }
}

impl Drop for CopyStream {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            tracing::debug!(
                table = %table.name(),
                records = self.records,
                "copy stream dropped before exhaustion"
            );
            self.pool.return_table(table);
        }
    }
}
