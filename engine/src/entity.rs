//! Entity types for syncable recipes.
//!
//! An entity's fields are partitioned into three groups that the merge
//! treats differently: shared content, device-local state and remote
//! linkage. See [`crate::schema`] for how a flat document maps onto them.

use crate::{EntityId, OwnerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field map used for the shared and local-only partitions.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Local-only key holding the favorite flag.
pub const FAVORITE_FIELD: &str = "isFavorite";

/// Fields binding a local entity to its remote counterpart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linkage {
    /// Opaque handle of the remote record
    pub remote_handle: Option<String>,
    /// Opaque handle of the remote image asset
    pub asset_handle: Option<String>,
    /// When the remote asset was last modified (milliseconds since epoch)
    pub asset_modified_at: Option<Timestamp>,
}

impl Linkage {
    /// Linkage with only a remote handle.
    pub fn with_handle(handle: impl Into<String>) -> Self {
        Self {
            remote_handle: Some(handle.into()),
            ..Self::default()
        }
    }

    /// True when no slot is populated.
    pub fn is_empty(&self) -> bool {
        self.remote_handle.is_none() && self.asset_handle.is_none() && self.asset_modified_at.is_none()
    }

    /// Combine local and remote linkage.
    ///
    /// Each slot takes whichever side is non-null. When both sides hold an
    /// asset, the remote asset wins if its modification time is equal or
    /// newer. The remote handle always prefers the remote value.
    pub fn reconcile(local: &Linkage, remote: &Linkage) -> Linkage {
        let remote_handle = remote
            .remote_handle
            .clone()
            .or_else(|| local.remote_handle.clone());

        let remote_asset_wins = match (&local.asset_handle, &remote.asset_handle) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(_), Some(_)) => remote.asset_modified_at >= local.asset_modified_at,
        };

        let (asset_handle, asset_modified_at) = if remote_asset_wins {
            (
                remote.asset_handle.clone(),
                remote.asset_modified_at.or(local.asset_modified_at),
            )
        } else {
            (
                local.asset_handle.clone(),
                local.asset_modified_at.or(remote.asset_modified_at),
            )
        };

        Linkage {
            remote_handle,
            asset_handle,
            asset_modified_at,
        }
    }

    /// Keep this linkage, filling empty slots from `fallback`.
    ///
    /// The asset handle and its modification time move as a pair.
    pub fn filled_from(&self, fallback: &Linkage) -> Linkage {
        let (asset_handle, asset_modified_at) = if self.asset_handle.is_some() {
            (self.asset_handle.clone(), self.asset_modified_at)
        } else {
            (fallback.asset_handle.clone(), fallback.asset_modified_at)
        };
        Linkage {
            remote_handle: self
                .remote_handle
                .clone()
                .or_else(|| fallback.remote_handle.clone()),
            asset_handle,
            asset_modified_at,
        }
    }
}

/// A syncable entity (a recipe).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Stable identity shared by every copy of the entity
    pub id: EntityId,
    /// User who owns the entity, if known
    pub owner_id: Option<OwnerId>,
    /// Last content change (milliseconds since epoch, UTC); the merge clock
    pub updated_at: Timestamp,
    /// Content fields; the merge winner supplies all of them
    pub shared: FieldMap,
    /// Device-local fields; never taken from the remote copy
    pub local: FieldMap,
    /// Remote linkage fields
    pub linkage: Linkage,
}

impl Entity {
    /// Create a new unlinked entity.
    pub fn new(id: impl Into<EntityId>, owner_id: impl Into<OwnerId>, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            owner_id: Some(owner_id.into()),
            updated_at,
            shared: FieldMap::new(),
            local: FieldMap::new(),
            linkage: Linkage::default(),
        }
    }

    /// Builder-style setter for a shared field.
    pub fn with_shared(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.shared.insert(name.into(), value);
        self
    }

    /// Builder-style setter for a local-only field.
    pub fn with_local(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.local.insert(name.into(), value);
        self
    }

    /// Builder-style setter for linkage.
    pub fn with_linkage(mut self, linkage: Linkage) -> Self {
        self.linkage = linkage;
        self
    }

    /// Whether the user marked this entity as a favorite.
    pub fn is_favorite(&self) -> bool {
        self.local
            .get(FAVORITE_FIELD)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Whether this entity has ever been linked to the remote store.
    pub fn is_linked(&self) -> bool {
        self.linkage.remote_handle.is_some()
    }

    /// Whether `owner` owns this entity.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner_id.as_deref() == Some(owner)
    }

    /// Advance `updated_at` for a content change. Never moves backwards.
    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = self.updated_at.max(now);
    }

    /// Build a merged entity from the given partitions.
    ///
    /// `content` supplies identity, owner, `updated_at` and shared fields.
    pub fn merged(content: &Entity, local: &FieldMap, linkage: Linkage) -> Self {
        Self {
            id: content.id.clone(),
            owner_id: content.owner_id.clone(),
            updated_at: content.updated_at,
            shared: content.shared.clone(),
            local: local.clone(),
            linkage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn favorite_defaults_to_false() {
        let entity = Entity::new("r1", "alice", 1000);
        assert!(!entity.is_favorite());

        let entity = entity.with_local(FAVORITE_FIELD, json!(true));
        assert!(entity.is_favorite());
    }

    #[test]
    fn touch_is_monotonic() {
        let mut entity = Entity::new("r1", "alice", 5000);
        entity.touch(4000);
        assert_eq!(entity.updated_at, 5000);
        entity.touch(6000);
        assert_eq!(entity.updated_at, 6000);
    }

    #[test]
    fn ownership() {
        let mut entity = Entity::new("r1", "alice", 1000);
        assert!(entity.is_owned_by("alice"));
        assert!(!entity.is_owned_by("bob"));
        entity.owner_id = None;
        assert!(!entity.is_owned_by("alice"));
    }

    #[test]
    fn reconcile_takes_non_null_slots() {
        let local = Linkage {
            remote_handle: None,
            asset_handle: Some("asset-local".into()),
            asset_modified_at: Some(100),
        };
        let remote = Linkage::with_handle("rec-1");

        let merged = Linkage::reconcile(&local, &remote);
        assert_eq!(merged.remote_handle.as_deref(), Some("rec-1"));
        assert_eq!(merged.asset_handle.as_deref(), Some("asset-local"));
        assert_eq!(merged.asset_modified_at, Some(100));
    }

    #[test]
    fn reconcile_prefers_equal_or_newer_remote_asset() {
        let local = Linkage {
            remote_handle: Some("rec-1".into()),
            asset_handle: Some("asset-a".into()),
            asset_modified_at: Some(200),
        };
        let mut remote = Linkage {
            remote_handle: Some("rec-1".into()),
            asset_handle: Some("asset-b".into()),
            asset_modified_at: Some(200),
        };

        assert_eq!(
            Linkage::reconcile(&local, &remote).asset_handle.as_deref(),
            Some("asset-b")
        );

        remote.asset_modified_at = Some(100);
        assert_eq!(
            Linkage::reconcile(&local, &remote).asset_handle.as_deref(),
            Some("asset-a")
        );
    }

    #[test]
    fn filled_from_keeps_own_values() {
        let local = Linkage {
            remote_handle: None,
            asset_handle: Some("asset-local".into()),
            asset_modified_at: Some(5),
        };
        let remote = Linkage {
            remote_handle: Some("rec-1".into()),
            asset_handle: Some("asset-remote".into()),
            asset_modified_at: Some(9),
        };

        let merged = local.filled_from(&remote);
        assert_eq!(merged.remote_handle.as_deref(), Some("rec-1"));
        assert_eq!(merged.asset_handle.as_deref(), Some("asset-local"));
        assert_eq!(merged.asset_modified_at, Some(5));

        let merged = Linkage::default().filled_from(&remote);
        assert_eq!(merged, remote);
    }

    #[test]
    fn reconcile_is_stable_for_identical_sides() {
        let linkage = Linkage {
            remote_handle: Some("rec-1".into()),
            asset_handle: Some("asset".into()),
            asset_modified_at: Some(10),
        };
        assert_eq!(Linkage::reconcile(&linkage, &linkage), linkage);
        assert!(Linkage::default().is_empty());
    }
}
