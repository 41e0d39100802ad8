//! Conflict resolution between a local and a remote copy of one entity.
//!
//! This is the core of determinism. Given the two snapshots of an entity and
//! whether it carries a live tombstone, [`resolve`] produces a [`Decision`]
//! without touching any state.
//!
//! # Algorithm
//!
//! 1. A live tombstone suppresses the entity unconditionally
//! 2. Remote-only entities are pulled
//! 3. Local-only entities are pushed when owned by the syncing user
//! 4. Otherwise the strictly newer `updated_at` wins (last-write-wins);
//!    on a tie only linkage is reconciled
//!
//! The winner supplies every shared field. Local-only fields always come
//! from the local copy and linkage is combined from both sides.

use crate::{Entity, EntityId, Linkage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of resolving one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Decision {
    /// Write `merged` to the local store.
    #[serde(rename_all = "camelCase")]
    PullRemoteIntoLocal {
        merged: Entity,
        /// No local copy existed
        is_new: bool,
        /// The asset link differs from what the local copy had
        asset_changed: bool,
    },
    /// Write `merged` to the remote store, then relink locally.
    #[serde(rename_all = "camelCase")]
    PushLocalToRemote { merged: Entity },
    /// Same `updated_at` on both sides but different linkage. Only linkage
    /// moves; `updated_at` and content stay untouched.
    #[serde(rename_all = "camelCase")]
    ReconcileLinkage {
        linkage: Linkage,
        update_local: bool,
        update_remote: bool,
    },
    /// Local-only entity owned by another user; never pushed.
    KeepLocalOnly,
    /// Both sides already agree.
    Noop,
    /// A live tombstone forbids recreating the entity. Any local copy is
    /// stale and gets removed.
    SuppressedByTombstone,
}

impl Decision {
    /// Short name for logs and summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::PullRemoteIntoLocal { .. } => "pull",
            Decision::PushLocalToRemote { .. } => "push",
            Decision::ReconcileLinkage { .. } => "relink",
            Decision::KeepLocalOnly => "keepLocalOnly",
            Decision::Noop => "noop",
            Decision::SuppressedByTombstone => "tombstoned",
        }
    }

    /// Whether applying this decision writes anything.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Decision::PullRemoteIntoLocal { .. }
                | Decision::PushLocalToRemote { .. }
                | Decision::ReconcileLinkage { .. }
        )
    }
}

/// Resolve one entity.
///
/// `owner` is the user on whose behalf the sync runs.
pub fn resolve(
    local: Option<&Entity>,
    remote: Option<&Entity>,
    tombstoned: bool,
    owner: &str,
) -> Decision {
    if tombstoned {
        return Decision::SuppressedByTombstone;
    }

    match (local, remote) {
        (None, None) => Decision::Noop,
        (None, Some(remote)) => Decision::PullRemoteIntoLocal {
            merged: remote.clone(),
            is_new: true,
            asset_changed: remote.linkage.asset_handle.is_some(),
        },
        (Some(local), None) => {
            if local.is_owned_by(owner) {
                Decision::PushLocalToRemote {
                    merged: local.clone(),
                }
            } else {
                Decision::KeepLocalOnly
            }
        }
        (Some(local), Some(remote)) => resolve_both(local, remote),
    }
}

fn resolve_both(local: &Entity, remote: &Entity) -> Decision {
    if remote.updated_at > local.updated_at {
        let linkage = Linkage::reconcile(&local.linkage, &remote.linkage);
        let asset_changed = linkage.asset_handle.is_some()
            && (linkage.asset_handle != local.linkage.asset_handle
                || linkage.asset_modified_at != local.linkage.asset_modified_at);
        Decision::PullRemoteIntoLocal {
            merged: Entity::merged(remote, &local.local, linkage),
            is_new: false,
            asset_changed,
        }
    } else if local.updated_at > remote.updated_at {
        let linkage = local.linkage.filled_from(&remote.linkage);
        Decision::PushLocalToRemote {
            merged: Entity::merged(local, &local.local, linkage),
        }
    } else {
        let linkage = Linkage::reconcile(&local.linkage, &remote.linkage);
        let update_local = linkage != local.linkage;
        let update_remote = linkage != remote.linkage;
        if update_local || update_remote {
            Decision::ReconcileLinkage {
                linkage,
                update_local,
                update_remote,
            }
        } else {
            Decision::Noop
        }
    }
}

/// Local and remote copies of one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPair {
    pub local: Option<Entity>,
    pub remote: Option<Entity>,
}

/// Pair local and remote entities by id over the union of both id sets.
///
/// Uses a BTreeMap so iteration order is deterministic.
pub fn pair_by_id(
    locals: impl IntoIterator<Item = Entity>,
    remotes: impl IntoIterator<Item = Entity>,
) -> BTreeMap<EntityId, EntityPair> {
    let mut pairs: BTreeMap<EntityId, EntityPair> = BTreeMap::new();
    for entity in locals {
        let id = entity.id.clone();
        pairs.entry(id).or_default().local = Some(entity);
    }
    for entity in remotes {
        let id = entity.id.clone();
        pairs.entry(id).or_default().remote = Some(entity);
    }
    pairs
}
