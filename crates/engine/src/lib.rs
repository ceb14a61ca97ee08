//! Deduplicating storage engine for the vault blob store.
//!
//! Upload pipeline: stream to staging while hashing, find or create the
//! unique payload for the hash, then link a reference. Delete pipeline:
//! unlink and decrement atomically, then remove the blob once its last
//! reference is gone.

pub mod dedup;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod references;
pub mod stream;

pub use dedup::{DedupCoordinator, Resolution};
pub use engine::{Engine, ReferenceView, StorageStats, UploadItem, UploadOutcome};
pub use error::{EngineError, EngineResult};
pub use references::{NewReference, ReferenceManager, RemovalOutcome};
pub use stream::{StagedBlob, stage_stream};
