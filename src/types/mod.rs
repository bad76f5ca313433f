//! Common types shared by the snapshot store, change log and notification pipeline.

pub mod candidate;
pub mod payload;

pub use candidate::{session_candidates, NotifyCandidate};
pub use payload::{content_tag, DataPayload, ItemKind, ItemMap};
