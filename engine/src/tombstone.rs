//! Deletion markers that keep deleted entities from being resurrected.

use crate::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How long a tombstone suppresses recreation before it is purged.
pub const TOMBSTONE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Record that an entity was deleted locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub entity_id: EntityId,
    /// When the deletion happened (milliseconds since epoch)
    pub deleted_at: Timestamp,
}

impl Tombstone {
    pub fn new(entity_id: impl Into<EntityId>, deleted_at: Timestamp) -> Self {
        Self {
            entity_id: entity_id.into(),
            deleted_at,
        }
    }

    /// Whether the tombstone is older than `retention` at `now`.
    pub fn is_expired(&self, now: Timestamp, retention: Duration) -> bool {
        now.saturating_sub(self.deleted_at) > retention_millis(retention)
    }
}

/// Cutoff timestamp: tombstones deleted before it are expired.
pub fn expiry_cutoff(now: Timestamp, retention: Duration) -> Timestamp {
    now.saturating_sub(retention_millis(retention))
}

fn retention_millis(retention: Duration) -> u64 {
    u64::try_from(retention.as_millis()).unwrap_or(u64::MAX)
}

/// In-memory set of tombstones keyed by entity id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TombstoneLedger {
    tombstones: BTreeMap<EntityId, Tombstone>,
    retention: Option<Duration>,
}

impl TombstoneLedger {
    /// Empty ledger with the default retention window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty ledger with a custom retention window.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            tombstones: BTreeMap::new(),
            retention: Some(retention),
        }
    }

    /// Retention window in effect.
    pub fn retention(&self) -> Duration {
        self.retention.unwrap_or(TOMBSTONE_RETENTION)
    }

    /// Record a deletion. An existing tombstone keeps its original time.
    ///
    /// Returns `true` if a new tombstone was created.
    pub fn record(&mut self, entity_id: impl Into<EntityId>, now: Timestamp) -> bool {
        let entity_id = entity_id.into();
        if self.tombstones.contains_key(&entity_id) {
            return false;
        }
        self.tombstones
            .insert(entity_id.clone(), Tombstone::new(entity_id, now));
        true
    }

    /// Insert a tombstone as-is, e.g. when loading from storage.
    pub fn insert(&mut self, tombstone: Tombstone) {
        self.tombstones
            .insert(tombstone.entity_id.clone(), tombstone);
    }

    /// Whether a live (non-expired) tombstone exists for `entity_id`.
    pub fn is_deleted(&self, entity_id: &str, now: Timestamp) -> bool {
        self.tombstones
            .get(entity_id)
            .is_some_and(|t| !t.is_expired(now, self.retention()))
    }

    /// Get a tombstone, expired or not.
    pub fn get(&self, entity_id: &str) -> Option<&Tombstone> {
        self.tombstones.get(entity_id)
    }

    /// Drop tombstones older than `retention`. Returns how many were removed.
    pub fn purge_older_than(&mut self, retention: Duration, now: Timestamp) -> usize {
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, t| !t.is_expired(now, retention));
        before - self.tombstones.len()
    }

    /// Number of tombstones held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.tombstones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tombstone> {
        self.tombstones.values()
    }
}
