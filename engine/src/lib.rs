//! # Mise Engine
//!
//! Deterministic reconciliation logic for the Mise recipe sync.
//!
//! This crate decides how a device-local recipe collection and its remote
//! copy are merged. It never performs IO: callers pass in entity snapshots
//! and the current time, and apply the resulting decisions themselves.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platform
//! - **Deterministic**: Same inputs always produce same outputs (the only
//!   randomness, retry jitter, comes from a caller-supplied RNG)
//! - **Testable**: Pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! An [`Entity`] has a stable id, an `updated_at` merge clock and three field
//! partitions, tagged per field by an [`EntitySchema`]:
//! - shared content (title, ingredients, steps, ...)
//! - local-only state (favorite flag, cached image path)
//! - remote linkage (remote handle, asset handle, asset modification time)
//!
//! ### Resolution
//!
//! [`resolve`] compares one local and one remote copy and returns a
//! [`Decision`]. Last-write-wins on `updated_at` at entity granularity;
//! local-only fields are always preserved and linkage is combined.
//!
//! ### Tombstones
//!
//! A [`Tombstone`] records a local deletion. While it is live (30 days by
//! default) the entity is never recreated from a stale remote copy.
//!
//! ### Sync operations
//!
//! A [`SyncOperation`] is a queued remote write with a small state machine
//! and a jittered exponential [`BackoffPolicy`].
//!
//! ## Quick Start
//!
//! ```rust
//! use mise_engine::{resolve, Decision, Entity, EntitySchema};
//! use serde_json::json;
//!
//! let schema = EntitySchema::recipe();
//! let remote = schema
//!     .decode(&json!({
//!         "id": "r1",
//!         "ownerId": "alice",
//!         "updatedAt": 2000,
//!         "title": "Dal",
//!         "cloudRecordName": "rec-r1"
//!     }))
//!     .unwrap();
//!
//! let local = Entity::new("r1", "alice", 1000)
//!     .with_shared("title", json!("Lentils"))
//!     .with_local("isFavorite", json!(true));
//!
//! match resolve(Some(&local), Some(&remote), false, "alice") {
//!     Decision::PullRemoteIntoLocal { merged, .. } => {
//!         assert_eq!(merged.shared["title"], "Dal");
//!         assert!(merged.is_favorite());
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```
//!
//! ## Clocks
//!
//! Timestamps are milliseconds since the Unix epoch (UTC). Last-write-wins
//! assumes device clocks agree; skew between devices is not compensated.

pub mod backoff;
pub mod entity;
pub mod error;
pub mod operation;
pub mod resolver;
pub mod schema;
pub mod tombstone;

// Re-export main types at crate root
pub use backoff::BackoffPolicy;
pub use entity::{Entity, FieldMap, Linkage, FAVORITE_FIELD};
pub use error::Error;
pub use operation::{OperationId, OperationStatus, OperationType, SyncOperation};
pub use resolver::{pair_by_id, resolve, Decision, EntityPair};
pub use schema::{EntitySchema, FieldClass, FieldDef, FieldType, LinkageSlot};
pub use tombstone::{expiry_cutoff, Tombstone, TombstoneLedger, TOMBSTONE_RETENTION};

/// Type aliases for clarity
pub type EntityId = String;
pub type OwnerId = String;
/// Milliseconds since Unix epoch
pub type Timestamp = u64;
