//! Document Sync Engine: one replicated text per open document.
//!
//! ```text
//!  insert/delete/apply_batch          apply_update(bytes, origin)
//!            │                                  │
//!            ▼                                  ▼
//!   ┌──────────────────────── yrs Doc ──────────────────────┐
//!   │  TextRef "content"  (YATA sequence, UTF-16 offsets)  │
//!   └───────────┬─────────────────────────────┬─────────────┘
//!               │ local origin                │ foreign origin
//!               ▼                             ▼
//!        on_update(LocalUpdate)        on_change(DocumentChange)
//!        (re-broadcast bytes)          (replayable op delta)
//! ```
//!
//! Every mutation runs inside one transaction; observers only see committed
//! state. Positions past the end of the text are rejected with
//! [`SyncError::OutOfRange`] and never clamped. An offset between the two
//! code units of a surrogate pair is rejected with
//! [`SyncError::InvalidOffset`] rather than snapped to a neighbour.

mod change;

pub use change::{BatchOutcome, ConflictStrategy, DocumentChange, LocalUpdate, RejectedOperation};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use yrs::types::Delta;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, Observable, OffsetKind, Options, Origin, ReadTxn, StateVector, Text, TextRef,
    Transact, TransactionMut, Update,
};

use crate::events::{Emitter, Subscription};
use crate::ops::{utf16_len, Operation};

/// Name of the shared text inside every document.
const TEXT_NAME: &str = "content";

/// Origin used when seeding initial content.
const SEED_ORIGIN: &str = "seed";

/// Errors raised by the sync engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Operation out of range: {position}+{length} exceeds text length {len}")]
    OutOfRange { position: u32, length: u32, len: u32 },
    /// The offset lands between the two halves of a surrogate pair.
    #[error("Offset {position} splits a surrogate pair")]
    InvalidOffset { position: u32 },
    /// Bytes were not a valid state vector or update.
    #[error("Decode error: {0}")]
    Decode(String),
    /// The update decoded but could not be integrated.
    #[error("Merge error: {0}")]
    Merge(String),
    #[error("Document is closed")]
    Closed,
}

impl From<yrs::encoding::read::Error> for SyncError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

/// Replicated plain-text document.
pub struct SyncEngine {
    document_id: String,
    /// Transaction origin for local edits (the local user id).
    local_origin: String,
    strategy: ConflictStrategy,

    doc: Doc,
    text: TextRef,

    version: AtomicU64,
    online: AtomicBool,
    /// Local updates produced while offline.
    unsynced: AtomicU64,
    closed: AtomicBool,

    /// Serializes all transactions on `doc`.
    txn_lock: Mutex<()>,
    /// Deltas captured by the text observer, drained after commit.
    pending: Arc<Mutex<Vec<Vec<Operation>>>>,
    observer: Mutex<Option<yrs::Subscription>>,

    changes: Emitter<DocumentChange>,
    updates: Emitter<LocalUpdate>,
}

impl SyncEngine {
    /// Create an engine seeded with `initial_content`.
    ///
    /// Seeding is deterministic: replicas opened with the same initial
    /// content share the same seed items, so merging them does not
    /// duplicate the text.
    pub fn new(
        document_id: impl Into<String>,
        local_origin: impl Into<String>,
        initial_content: &str,
    ) -> Result<Self, SyncError> {
        Self::with_strategy(
            document_id,
            local_origin,
            initial_content,
            ConflictStrategy::default(),
        )
    }

    pub fn with_strategy(
        document_id: impl Into<String>,
        local_origin: impl Into<String>,
        initial_content: &str,
        strategy: ConflictStrategy,
    ) -> Result<Self, SyncError> {
        let document_id = document_id.into();
        let local_origin = local_origin.into();

        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);

        if !initial_content.is_empty() {
            let seed = Update::decode_v1(&seed_update(initial_content))?;
            let mut txn = doc.transact_mut_with(SEED_ORIGIN);
            txn.apply_update(seed)
                .map_err(|e| SyncError::Merge(e.to_string()))?;
        }

        let pending: Arc<Mutex<Vec<Vec<Operation>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = pending.clone();
        let local = Origin::from(local_origin.as_str());
        let observer = text.observe(move |txn, event| {
            if txn.origin() == Some(&local) {
                return;
            }
            let ops: Vec<Operation> = event
                .delta(txn)
                .iter()
                .map(|delta| delta_to_operation(txn, delta))
                .collect();
            if !ops.is_empty() {
                sink.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(ops);
            }
        });

        log::debug!("Opened sync engine for document {document_id}");

        Ok(Self {
            document_id,
            local_origin,
            strategy,
            doc,
            text,
            version: AtomicU64::new(0),
            online: AtomicBool::new(true),
            unsynced: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            txn_lock: Mutex::new(()),
            pending,
            observer: Mutex::new(Some(observer)),
            changes: Emitter::new(),
            updates: Emitter::new(),
        })
    }

    // ── Local edits ─────────────────────────────────────────────

    /// Insert `content` at `position`. Returns the new version.
    pub fn insert(&self, position: u32, content: &str) -> Result<u64, SyncError> {
        self.apply_operation(Operation::insert(position, content))
    }

    /// Delete `length` code units starting at `position`. Returns the new version.
    pub fn delete(&self, position: u32, length: u32) -> Result<u64, SyncError> {
        self.apply_operation(Operation::delete(position, length))
    }

    /// Apply one operation as a local transaction. Returns the new version.
    pub fn apply_operation(&self, op: Operation) -> Result<u64, SyncError> {
        self.ensure_open()?;
        let origin = self.local_origin.clone();
        let run = self.run(&origin, std::slice::from_ref(&op), 0, 0)?;
        if let Some(rejected) = run.outcome.rejected.into_iter().next() {
            return Err(rejected.error);
        }
        Ok(self.commit(&origin, run.update, run.mutated, true))
    }

    /// Apply `ops` under `origin`, keeping a running cursor across the batch.
    ///
    /// Out-of-range operations are rejected individually; the rest of the
    /// batch still applies.
    pub fn apply_batch(&self, ops: &[Operation], origin: &str) -> Result<BatchOutcome, SyncError> {
        self.ensure_open()?;

        match self.strategy {
            ConflictStrategy::Merge => {
                let run = self.run(origin, ops, 0, 0)?;
                let version = self.commit(origin, run.update, run.mutated, run.mutated);
                Ok(BatchOutcome {
                    version,
                    ..run.outcome
                })
            }
            ConflictStrategy::Isolated => {
                let mut total = BatchOutcome::default();
                let mut cursor = 0;
                for (index, op) in ops.iter().enumerate() {
                    let run = self.run(origin, std::slice::from_ref(op), cursor, index)?;
                    cursor = run.cursor;
                    self.commit(origin, run.update, run.mutated, run.mutated);
                    total.applied += run.outcome.applied;
                    total.rejected.extend(run.outcome.rejected);
                }
                total.version = self.version();
                Ok(total)
            }
        }
    }

    // ── Remote sync ─────────────────────────────────────────────

    /// Encoded summary of everything this replica has integrated.
    pub fn state_vector(&self) -> Result<Vec<u8>, SyncError> {
        self.ensure_open()?;
        let _guard = self.guard();
        let txn = self.doc.transact();
        Ok(txn.state_vector().encode_v1())
    }

    /// Encode what a peer with `peer_state_vector` is missing.
    ///
    /// `None` encodes the full state, used to bring a new peer up to date.
    pub fn state_update(&self, peer_state_vector: Option<&[u8]>) -> Result<Vec<u8>, SyncError> {
        self.ensure_open()?;
        let sv = match peer_state_vector {
            Some(bytes) => StateVector::decode_v1(bytes)?,
            None => StateVector::default(),
        };
        let _guard = self.guard();
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge an update produced by any replica's [`Self::state_update`].
    ///
    /// Idempotent and order-independent. Returns whether the text changed.
    pub fn apply_update(&self, update: &[u8], origin: &str) -> Result<bool, SyncError> {
        self.ensure_open()?;
        let update = Update::decode_v1(update)?;
        {
            let _guard = self.guard();
            let mut txn = self.doc.transact_mut_with(origin);
            txn.apply_update(update)
                .map_err(|e| SyncError::Merge(e.to_string()))?;
        }
        Ok(self.flush_changes(origin))
    }

    /// Pull the complete state of another in-process replica.
    pub fn merge_with(&self, other: &SyncEngine) -> Result<bool, SyncError> {
        let update = other.state_update(None)?;
        self.apply_update(&update, &other.local_origin)
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Materialized text.
    pub fn content(&self) -> String {
        let _guard = self.guard();
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length of the text in UTF-16 code units.
    pub fn len(&self) -> u32 {
        let _guard = self.guard();
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn local_origin(&self) -> &str {
        &self.local_origin
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    // ── Connectivity bookkeeping ────────────────────────────────

    /// Mark whether updates are currently reaching peers.
    ///
    /// Going online clears the unsynced counter.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            self.unsynced.store(0, Ordering::SeqCst);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Local updates produced since the engine went offline.
    pub fn unsynced_updates(&self) -> u64 {
        self.unsynced.load(Ordering::SeqCst)
    }

    // ── Listeners ───────────────────────────────────────────────

    /// Subscribe to foreign-origin changes.
    ///
    /// Listeners run after the transaction committed and may read the
    /// document, but must not mutate it from inside the callback.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.changes.subscribe(listener)
    }

    /// Subscribe to updates authored by this replica.
    pub fn on_update<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LocalUpdate) + Send + Sync + 'static,
    {
        self.updates.subscribe(listener)
    }

    // ── Teardown ────────────────────────────────────────────────

    /// Detach the observer and every listener. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(observer);
        self.changes.clear();
        self.updates.clear();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        log::debug!("Closed sync engine for document {}", self.document_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Internals ───────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.is_closed() {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.txn_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `ops` in one transaction starting from `cursor`.
    fn run(
        &self,
        origin: &str,
        ops: &[Operation],
        cursor: u32,
        index_base: usize,
    ) -> Result<Run, SyncError> {
        let _guard = self.guard();
        let mut txn = self.doc.transact_mut_with(origin);
        let mut run = Run {
            outcome: BatchOutcome::default(),
            update: Vec::new(),
            cursor,
            mutated: false,
        };

        for (offset, op) in ops.iter().enumerate() {
            match apply_one(&self.text, &mut txn, run.cursor, op) {
                Ok(next) => {
                    run.cursor = next;
                    run.outcome.applied += 1;
                    run.mutated |= op.is_mutation();
                }
                Err(error) => {
                    log::warn!(
                        "Rejected operation {} on document {}: {error}",
                        index_base + offset,
                        self.document_id
                    );
                    run.outcome.rejected.push(RejectedOperation {
                        index: index_base + offset,
                        error,
                    });
                }
            }
        }

        if run.mutated {
            run.update = txn.encode_update_v1();
        }
        Ok(run)
    }

    /// Bump the version, publish the authored update and flush observer output.
    fn commit(&self, origin: &str, update: Vec<u8>, mutated: bool, bump: bool) -> u64 {
        let version = if bump {
            self.version.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.version()
        };

        if mutated {
            if !self.is_online() {
                self.unsynced.fetch_add(1, Ordering::SeqCst);
            }
            self.updates.emit(&LocalUpdate {
                document_id: self.document_id.clone(),
                origin: origin.to_string(),
                version,
                update,
            });
        }

        if origin != self.local_origin {
            self.emit_pending(origin, version);
        }
        version
    }

    /// Emit changes captured during a remote merge; bumps the version once
    /// if the text changed.
    fn flush_changes(&self, origin: &str) -> bool {
        let has_pending = !self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty();
        if !has_pending {
            return false;
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit_pending(origin, version);
        true
    }

    fn emit_pending(&self, origin: &str, version: u64) {
        let drained: Vec<Vec<Operation>> = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for ops in drained {
            self.changes.emit(&DocumentChange {
                document_id: self.document_id.clone(),
                origin: origin.to_string(),
                version,
                ops,
            });
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("document_id", &self.document_id)
            .field("local_origin", &self.local_origin)
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct Run {
    outcome: BatchOutcome,
    update: Vec<u8>,
    cursor: u32,
    mutated: bool,
}

/// Apply one operation at `cursor + op.position()`; returns the next cursor.
fn apply_one(
    text: &TextRef,
    txn: &mut TransactionMut,
    cursor: u32,
    op: &Operation,
) -> Result<u32, SyncError> {
    let len = text.len(&*txn);
    let at = cursor.saturating_add(op.position());

    match op {
        Operation::Insert { content, .. } => {
            if at > len {
                return Err(SyncError::OutOfRange {
                    position: at,
                    length: 0,
                    len,
                });
            }
            check_boundary(text, txn, &[at])?;
            if !content.is_empty() {
                text.insert(txn, at, content);
            }
            Ok(at + utf16_len(content))
        }
        Operation::Delete { length, .. } => {
            if at.saturating_add(*length) > len {
                return Err(SyncError::OutOfRange {
                    position: at,
                    length: *length,
                    len,
                });
            }
            check_boundary(text, txn, &[at, at + length])?;
            if *length > 0 {
                text.remove_range(txn, at, *length);
            }
            Ok(at)
        }
        Operation::Retain { length, .. } => {
            if at.saturating_add(*length) > len {
                return Err(SyncError::OutOfRange {
                    position: at,
                    length: *length,
                    len,
                });
            }
            check_boundary(text, txn, &[at, at + length])?;
            Ok(at + length)
        }
    }
}

/// Reject offsets that fall between a high and a low surrogate.
fn check_boundary(text: &TextRef, txn: &TransactionMut, offsets: &[u32]) -> Result<(), SyncError> {
    let content = text.get_string(txn);
    if content.is_ascii() {
        return Ok(());
    }
    for &offset in offsets {
        let mut units = 0u32;
        for ch in content.chars() {
            if units >= offset {
                break;
            }
            units += ch.len_utf16() as u32;
        }
        if units > offset {
            return Err(SyncError::InvalidOffset { position: offset });
        }
    }
    Ok(())
}

fn delta_to_operation(txn: &TransactionMut, delta: &Delta) -> Operation {
    match delta {
        Delta::Inserted(value, _) => Operation::insert(0, value.clone().to_string(txn)),
        Delta::Deleted(length) => Operation::delete(0, *length),
        Delta::Retain(length, _) => Operation::retain(*length),
    }
}

/// Deterministic update holding `content` as authored by a content-derived
/// client id.
fn seed_update(content: &str) -> Vec<u8> {
    let seed = Doc::with_client_id(seed_client_id(content).into());
    let text = seed.get_or_insert_text(TEXT_NAME);
    let mut txn = seed.transact_mut();
    text.insert(&mut txn, 0, content);
    txn.encode_update_v1()
}

/// 32-bit FNV-1a of the content. Distinct seeds never share item ids.
fn seed_client_id(content: &str) -> u64 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in content.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    u64::from(hash)
}
