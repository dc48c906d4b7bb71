//! # tandem-core: Replicated text for Tandem rooms
//!
//! ## Architecture
//!
//! ```text
//!  local edit intents            encoded updates from peers
//!  (Operation / insert)          (lib0 v1 bytes)
//!         │                              │
//!         ▼                              ▼
//!  ┌──────────────────────────────────────────────┐
//!  │ SyncEngine (one per document)                │
//!  │   yrs Doc ── TextRef "content"               │
//!  │   version clock, online flag                 │
//!  └───────┬───────────────────────────┬──────────┘
//!          │ Emitter<LocalUpdate>      │ Emitter<DocumentChange>
//!          ▼                           ▼
//!     transport broadcast         UI patching
//! ```
//!
//! ## Modules
//!
//! - [`sync`]: the Document Sync Engine
//! - [`ops`]: intent-level insert/delete/retain operations
//! - [`events`]: listener fan-out with drop-to-unsubscribe handles

pub mod events;
pub mod ops;
pub mod sync;

pub use events::{Emitter, Subscription};
pub use ops::{utf16_len, Operation};
pub use sync::{
    BatchOutcome, ConflictStrategy, DocumentChange, LocalUpdate, RejectedOperation, SyncEngine,
    SyncError,
};
