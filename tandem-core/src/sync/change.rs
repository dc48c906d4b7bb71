use serde::{Deserialize, Serialize};

use crate::ops::Operation;

/// Emitted after a transaction whose origin is not the local user.
///
/// `ops` replays the transaction against the text as it was before the
/// transaction (see [`crate::ops`] for cursor semantics).
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub document_id: String,
    pub origin: String,
    pub version: u64,
    pub ops: Vec<Operation>,
}

/// Encoded update authored by this replica that peers still need.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub document_id: String,
    pub origin: String,
    pub version: u64,
    pub update: Vec<u8>,
}

/// An operation refused by [`super::SyncEngine::apply_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedOperation {
    /// Index into the submitted batch.
    pub index: usize,
    pub error: super::SyncError,
}

/// Result of applying a batch of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub rejected: Vec<RejectedOperation>,
    /// Document version after the batch.
    pub version: u64,
}

impl BatchOutcome {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Batching hint for [`super::SyncEngine::apply_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// The whole batch commits as one transaction and one update.
    #[default]
    Merge,
    /// Every operation commits in its own transaction.
    Isolated,
}
