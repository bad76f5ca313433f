//! # confsync
//!
//! Consistency and caching core for a read-heavy dataset service: full
//! versioned snapshots, an incremental change log, a notification dedup set
//! and a signing-key cache, all on top of a pluggable keyed cache and backing
//! store.
//!
//! ## Overview
//!
//! Writers publish a complete snapshot and the diff that produced it.
//! Clients either:
//!
//! - **Fetch current state**: `SnapshotStore::read_latest`, served from a
//!   sharded cache and answered with not-modified when the client's version
//!   tag still matches.
//! - **Fetch what changed**: `ChangeLog::since`, a consolidated delta of every
//!   entry after a timestamp, newest value per item winning.
//!
//! Changed sessions flow through the `DedupSet` before reaching a
//! `NotificationDispatcher`, so each `(session, version)` is announced once.
//!
//! ## Architecture
//!
//! ### Backends
//! `KeyedCache` (in-process or Redis) holds disposable derived state.
//! `BackingStore` (in-memory or PostgreSQL) holds snapshots, change entries
//! and dedup markers.
//!
//! ### Components
//! `SnapshotStore`, `ChangeLog`, `DedupSet`, `CertCache` and the
//! `NotificationPipeline`, owned together by a `SyncContext` built once from
//! `Settings`.

// Core Types
/// Dataset payloads and notification candidates
pub mod types;

// Backends
/// Byte-blob cache with TTL (memory, Redis)
pub mod keyed_cache;
/// Durable record store (memory, PostgreSQL)
pub mod store;

// Components
/// Versioned snapshots with conditional reads
pub mod snapshot_store;
/// Append-only change log with consolidated deltas
pub mod change_log;
/// Durable "already notified" markers
pub mod dedup_set;
/// Signing-key cache honoring HTTP freshness
pub mod cert_cache;
/// Change log → dedup → dispatcher
pub mod notification_pipeline;
/// Explicitly constructed handle owning every component
pub mod context;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use cert_cache::{CertCache, SigningKeySet};
pub use change_log::{ChangeLog, ConsolidatedDelta};
pub use context::SyncContext;
pub use dedup_set::DedupSet;
pub use keyed_cache::KeyedCache;
pub use notification_pipeline::{NotificationDispatcher, NotificationPipeline};
pub use settings::Settings;
pub use snapshot_store::{Snapshot, SnapshotRead, SnapshotStore};
pub use store::BackingStore;
pub use types::{DataPayload, NotifyCandidate};
