//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C3 — Local manifest store: a key→manifest map backed by a local
//! database, with "placeholder" and "needs sync" bookkeeping (§4.3).
//!
//! Entries are locked with an external RW lock per entry id: readers
//! snapshot the manifest, writers exclude other writers and readers for
//! the duration of the mutation (§7's locking rule).

use crate::error::ManifestStoreError;
use parsec_sync_types::{Access, EntryId, LocalManifest};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A beacon is the workspace-level realm whose `events_subscribe` a writer
/// notifies after a sync (§4.6, §4.7 step COMMIT). `beacon_key` encrypts
/// the beacon message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub beacon_id: EntryId,
    pub beacon_key: [u8; 32],
}

/// One entry's place in the tree: its human-readable path, the access used
/// to reach it, and the chain of ancestor entry ids from the root.
#[derive(Debug, Clone)]
pub struct EntryPath {
    pub path: String,
    pub access: Access,
    pub ancestors: Vec<EntryId>,
}

struct Entry {
    manifest: RwLock<Option<LocalManifest>>,
    path: EntryPath,
}

/// In-memory local manifest store. A production deployment backs this with
/// sqlite or an equivalent embedded database; the in-memory map here
/// implements the same `get`/`set`/`mark_outdated` contract so the rest of
/// the engine is storage-agnostic (§4.3).
#[derive(Default)]
pub struct ManifestStore {
    entries: RwLock<HashMap<EntryId, Arc<Entry>>>,
    beacons: RwLock<HashMap<String, Vec<Beacon>>>,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or update) an entry's location in the tree. Called by the
    /// FS facade whenever a directory operation changes an entry's parent.
    pub async fn register_path(&self, access: Access, path: String, ancestors: Vec<EntryId>) {
        let mut entries = self.entries.write().await;
        let id = access.id;
        entries
            .entry(id)
            .and_modify(|e| {
                if e.path.path != path {
                    debug!(entry = %id, old = %e.path.path, new = %path, "entry path changed");
                }
            })
            .or_insert_with(|| {
                Arc::new(Entry {
                    manifest: RwLock::new(None),
                    path: EntryPath { path, access, ancestors },
                })
            });
    }

    /// Fetch the locally cached manifest for `access.id`. `LocalDBMissingEntry`
    /// means "nothing to sync" to every caller (§4.3).
    pub async fn get(&self, access: &Access) -> Result<LocalManifest, ManifestStoreError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(&access.id)
            .ok_or(ManifestStoreError::LocalDBMissingEntry)?
            .clone();
        drop(entries);
        entry
            .manifest
            .read()
            .await
            .clone()
            .ok_or(ManifestStoreError::LocalDBMissingEntry)
    }

    /// Store `manifest` under `access.id`, creating the entry if unknown.
    pub async fn set(&self, access: &Access, manifest: LocalManifest) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(access.id).or_insert_with(|| {
            Arc::new(Entry {
                manifest: RwLock::new(None),
                path: EntryPath {
                    path: String::new(),
                    access: access.clone(),
                    ancestors: Vec::new(),
                },
            })
        });
        *entry.manifest.write().await = Some(manifest);
    }

    /// Drop the local copy so the next read re-fetches from the backend
    /// (§4.3). Used after a sync confirms there is nothing left to upload.
    pub async fn mark_outdated(&self, access: &Access) {
        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(&access.id) {
            *entry.manifest.write().await = None;
        }
    }

    /// Resolve `id` to its path, access and ancestor chain.
    pub async fn get_entry_path(&self, id: EntryId) -> Result<EntryPath, ManifestStoreError> {
        let entries = self.entries.read().await;
        entries
            .get(&id)
            .map(|e| e.path.clone())
            .ok_or(ManifestStoreError::LocalDBMissingEntry)
    }

    /// Register the beacons (workspace realms) reachable from `path`.
    pub async fn set_beacons(&self, path: &str, beacons: Vec<Beacon>) {
        self.beacons.write().await.insert(path.to_string(), beacons);
    }

    /// Beacons a sync at `path` must notify after a successful publish.
    pub async fn get_beacons(&self, path: &str) -> Vec<Beacon> {
        self.beacons
            .read()
            .await
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Find the folder currently listing `child_id` as a child, returning
    /// its access and the child's current name. Used to reparent a
    /// conflict fork back into the tree (§4.7, §4.8).
    pub async fn find_parent(&self, child_id: EntryId) -> Option<(Access, String)> {
        let entries = self.entries.read().await;
        for entry in entries.values() {
            let manifest = entry.manifest.read().await;
            let Some(folder) = manifest.as_ref().and_then(LocalManifest::as_folder) else {
                continue;
            };
            if let Some((name, _)) = folder.children.iter().find(|(_, access)| access.id == child_id) {
                return Some((entry.path.access.clone(), name.clone()));
            }
        }
        None
    }

    /// Walk every locally known entry whose manifest is cached, in no
    /// particular order. Used by `Syncer::full_sync`'s group-check sweep
    /// (confirms the backend agrees on each entry's version before
    /// deciding what needs publishing).
    pub async fn collect_group_check_entries(&self) -> Vec<(EntryId, u32)> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for (id, entry) in entries.iter() {
            if let Some(manifest) = entry.manifest.read().await.as_ref() {
                out.push((*id, manifest.base_version()));
            }
        }
        out
    }
}

impl Clone for EntryPath {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            access: self.access.clone(),
            ancestors: self.ancestors.clone(),
        }
    }
}

/// Beacons grouped by the common ancestor realm, used when composing a
/// sync's notification fan-out (§4.6).
pub fn group_beacons_by_id(beacons: &[Beacon]) -> BTreeMap<EntryId, [u8; 32]> {
    beacons.iter().map(|b| (b.beacon_id, b.beacon_key)).collect()
}
