use super::Operation;
use crate::core::{DbError, OperationId, Result};
use serde::{Deserialize, Serialize};

const ENVELOPE_FORMAT_VERSION: u8 = 1;

/// Payload handed to and received from the replicator.
///
/// Kept segmented so a single log record can carry several buffers; the
/// operation envelope always travels in the first segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationData {
    segments: Vec<Vec<u8>>,
}

impl OperationData {
    pub fn single(bytes: Vec<u8>) -> Self {
        Self {
            segments: vec![bytes],
        }
    }

    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn first(&self) -> Option<&[u8]> {
        self.segments.first().map(Vec::as_slice)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Vec::is_empty)
    }
}

/// Operation plus the id that ties its pre-apply to its later apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    version: u8,
    pub id: OperationId,
    pub operation: Operation,
}

impl OperationEnvelope {
    pub fn new(id: OperationId, operation: Operation) -> Self {
        Self {
            version: ENVELOPE_FORMAT_VERSION,
            id,
            operation,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: OperationEnvelope = rmp_serde::from_slice(bytes)?;
        if envelope.version != ENVELOPE_FORMAT_VERSION {
            return Err(DbError::SerializationError(format!(
                "unsupported operation envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    pub fn to_data(&self) -> Result<OperationData> {
        Ok(OperationData::single(self.encode()?))
    }

    pub fn from_data(data: &OperationData) -> Result<Self> {
        let bytes = data.first().ok_or_else(|| {
            DbError::SerializationError("operation data has no segments".to_string())
        })?;
        Self::decode(bytes)
    }
}
