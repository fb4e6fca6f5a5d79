//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C7 — Syncer: the reconciliation engine (§4.7).
//!
//! One process-wide lock serializes top-level `sync` calls; a per-entry
//! lock serializes concurrent syncs of the same access. A file sync walks
//! PREPARE → MARKER → FLUSH → UPLOAD DATA → UPLOAD META → COMMIT, rolling
//! back to leave dirty blocks and the marker untouched on upload failure
//! so the next sync resumes where this one left off. A folder sync
//! recurses into children first (deferring the parent's own publish until
//! every placeholder child has resolved) then republishes itself if still
//! dirty.

use crate::backend::{BackendClient, BeaconNotification, GroupCheckEntry};
use crate::block_store::BlockStore;
use crate::buffer::{new_dirty_ranges, Payload};
use crate::crypto::{self, DeviceKeypair};
use crate::error::{BackendError, SyncError};
use crate::event_bus::{Event, EventBus};
use crate::manifest_store::{Beacon, ManifestStore};
use crate::opened_file::OpenedFilesTable;
use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use parsec_sync_types::{
    Access, BlockId, BlockRef, DeviceId, EntryId, FileManifest, FolderManifest, LocalManifest,
    ManifestKind, RemoteManifest,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Consecutive transient `Unavailable` failures before an entry is marked
/// offline-dirty and background sync stops retrying it (§7).
pub const MAX_CONSECUTIVE_UNAVAILABLE: u32 = 5;

#[derive(Serialize, Deserialize)]
struct BeaconPointer {
    id: EntryId,
}

/// The reconciliation engine. Holds shared handles to every other
/// component it orchestrates; cheaply cloneable (everything inside is an
/// `Arc`).
pub struct Syncer {
    device_id: DeviceId,
    keypair: Arc<DeviceKeypair>,
    backend: Arc<dyn BackendClient>,
    manifest_store: Arc<ManifestStore>,
    opened_files: Arc<Mutex<OpenedFilesTable>>,
    block_store: Arc<BlockStore>,
    events: EventBus,
    global_lock: Arc<Mutex<()>>,
    entry_locks: Mutex<HashMap<EntryId, Arc<Mutex<()>>>>,
    device_keys: Mutex<HashMap<DeviceId, VerifyingKey>>,
    offline_failures: Mutex<HashMap<EntryId, u32>>,
}

impl Syncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: DeviceId,
        keypair: Arc<DeviceKeypair>,
        backend: Arc<dyn BackendClient>,
        manifest_store: Arc<ManifestStore>,
        opened_files: Arc<Mutex<OpenedFilesTable>>,
        block_store: Arc<BlockStore>,
        events: EventBus,
    ) -> Self {
        let mut device_keys = HashMap::new();
        device_keys.insert(device_id.clone(), keypair.verifying_key());
        Self {
            device_id,
            keypair,
            backend,
            manifest_store,
            opened_files,
            block_store,
            events,
            global_lock: Arc::new(Mutex::new(())),
            entry_locks: Mutex::new(HashMap::new()),
            device_keys: Mutex::new(device_keys),
            offline_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Trust a peer device's verify key so its manifests can be verified
    /// (e.g. after a conflict fork fetches a remote version). Certificate
    /// chain validation that would normally populate this is out of scope.
    pub async fn register_device_key(&self, device_id: DeviceId, key: VerifyingKey) {
        self.device_keys.lock().await.insert(device_id, key);
    }

    async fn entry_lock(&self, id: EntryId) -> Arc<Mutex<()>> {
        self.entry_locks.lock().await.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Sign and encrypt `{id: entry_id}` under each beacon's key, ready to
    /// attach as a vlob write's `notify[]` (§4.7, §6).
    pub fn build_beacon_messages(&self, notify: &[Beacon], entry_id: EntryId) -> Vec<BeaconNotification> {
        let pointer = BeaconPointer { id: entry_id };
        let raw = bincode::serialize(&pointer).expect("beacon pointer serialization cannot fail");
        let signed = crypto::sign(&self.keypair, self.device_id.clone(), Utc::now(), raw);
        let signed_bytes = bincode::serialize(&signed).expect("signed envelope serialization cannot fail");
        notify
            .iter()
            .map(|beacon| BeaconNotification {
                beacon_id: beacon.beacon_id,
                ciphertext: crypto::encrypt(&beacon.beacon_key, &signed_bytes),
            })
            .collect()
    }

    /// Entry point: acquire the process-wide lock, then sync `access` and
    /// (if `recursive`) its descendants.
    pub async fn sync(&self, access: &Access, recursive: bool, notify: Vec<Beacon>) -> Result<(), SyncError> {
        let global = self.global_lock.clone();
        let _guard = global.lock().await;
        self.sync_entry(access, recursive, &notify).await
    }

    /// Sweep every locally known entry via `vlob_group_check` and sync
    /// whichever ones the backend reports as changed (§4.7's `full_sync`).
    pub async fn full_sync(&self) -> Result<(), SyncError> {
        let local_entries = self.manifest_store.collect_group_check_entries().await;
        if local_entries.is_empty() {
            return Ok(());
        }
        let to_check: Vec<GroupCheckEntry> = local_entries
            .into_iter()
            .map(|(id, version)| GroupCheckEntry { id, read_token: Vec::new(), version })
            .collect();
        let changed = self.backend.vlob_group_check(to_check).await?;
        for entry in changed {
            self.sync_by_id(entry.id).await?;
        }
        Ok(())
    }

    /// Sync a single entry by id, resolving its path/access/beacons first.
    /// A no-op if the entry isn't locally present.
    pub async fn sync_by_id(&self, id: EntryId) -> Result<(), SyncError> {
        let Ok(entry_path) = self.manifest_store.get_entry_path(id).await else {
            return Ok(());
        };
        let beacons = self.manifest_store.get_beacons(&entry_path.path).await;
        self.sync(&entry_path.access, true, beacons).await
    }

    async fn note_backend_result<T>(&self, id: EntryId, result: Result<T, BackendError>) -> Result<T, SyncError> {
        match result {
            Ok(v) => {
                self.offline_failures.lock().await.remove(&id);
                Ok(v)
            }
            Err(BackendError::Unavailable(msg)) => {
                let mut failures = self.offline_failures.lock().await;
                let count = failures.entry(id).or_insert(0);
                *count += 1;
                if *count >= MAX_CONSECUTIVE_UNAVAILABLE {
                    warn!(%id, count = *count, "entry offline-dirty after repeated transient failures");
                    self.events.publish(Event::BackendOffline);
                    return Err(SyncError::OfflineDirty(*count));
                }
                Err(SyncError::Backend(BackendError::Unavailable(msg)))
            }
            Err(e) => Err(SyncError::Backend(e)),
        }
    }

    fn boxed<'a>(&'a self, access: &'a Access, recursive: bool, notify: &'a [Beacon]) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SyncError>> + Send + 'a>> {
        Box::pin(self.sync_entry(access, recursive, notify))
    }

    async fn sync_entry(&self, access: &Access, recursive: bool, notify: &[Beacon]) -> Result<(), SyncError> {
        let lock = self.entry_lock(access.id).await;
        let _guard = lock.lock().await;

        let manifest = match self.manifest_store.get(access).await {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };

        let notify_msgs = self.build_beacon_messages(notify, access.id);

        match manifest {
            LocalManifest::File(file) => self.sync_file(access, file, &notify_msgs).await,
            LocalManifest::Folder(folder) => {
                self.sync_folder(access, folder, ManifestKind::Folder, recursive, notify).await
            }
            LocalManifest::Workspace(folder) => {
                self.sync_folder(access, folder, ManifestKind::Workspace, recursive, notify).await
            }
            LocalManifest::User(folder) => {
                self.sync_folder(access, folder, ManifestKind::User, recursive, notify).await
            }
        }
    }

    async fn sync_file(
        &self,
        access: &Access,
        mut manifest: FileManifest,
        notify_msgs: &[BeaconNotification],
    ) -> Result<(), SyncError> {
        let is_open = self.opened_files.lock().await.is_opened(access.id);
        let opened_handle = if is_open {
            let mut table = self.opened_files.lock().await;
            Some(table.open_file(access.clone(), &LocalManifest::File(manifest.clone())))
        } else {
            None
        };

        let needs_sync = if let Some(handle) = &opened_handle {
            let file = handle.lock().await;
            file.need_sync(&LocalManifest::File(manifest.clone()))
        } else {
            manifest.need_sync
        };

        // PREPARE
        if !needs_sync {
            self.manifest_store.mark_outdated(access).await;
            self.events.publish(Event::EntrySynced { id: access.id, at: Utc::now() });
            return Ok(());
        }

        // MARKER
        let marker = if let Some(handle) = &opened_handle {
            let mut file = handle.lock().await;
            file.begin_sync()?;
            Some(file.create_marker()?)
        } else {
            None
        };

        // FLUSH — C4 emits a block-aligned flush map for C7 to upload. A
        // prior `flush()` through the FS facade may have already recorded
        // some of this range as dirty; only the portion `manifest.dirty_blocks`
        // doesn't already cover is materialized into a new block, so a
        // flush-then-sync round never double-counts the same bytes.
        let mut new_dirty_refs: Vec<BlockRef> = Vec::new();
        if let Some(handle) = &opened_handle {
            let file = handle.lock().await;
            let sync_map = file.get_sync_map(&LocalManifest::File(manifest.clone()))?;
            manifest.size = file.size;
            let candidates: Vec<(u64, Vec<u8>)> = sync_map
                .slices
                .into_iter()
                .filter_map(|s| match s.payload {
                    Payload::Ram(data) => Some((s.start, data)),
                    _ => None,
                })
                .collect();
            let buffers = new_dirty_ranges(&manifest.dirty_blocks, candidates)?;
            for (offset, data) in buffers {
                let digest = crypto::digest(&data);
                let block_access = Access::new_placeholder();
                let block_ref = BlockRef { access: block_access.clone(), offset, size: data.len() as u32, digest };
                self.block_store.set_dirty(BlockId(block_access.id.0), data).await;
                new_dirty_refs.push(block_ref);
            }
        }
        manifest.dirty_blocks.extend(new_dirty_refs);
        manifest.updated = Utc::now();
        self.manifest_store.set(access, LocalManifest::File(manifest.clone())).await;

        // UPLOAD DATA
        for block_ref in &manifest.dirty_blocks {
            let id = BlockId(block_ref.access.id.0);
            if let Some(plaintext) = self.block_store.get_dirty_plaintext(id).await {
                let ciphertext = crypto::encrypt(block_ref.access.key.as_bytes(), &plaintext);
                let result = self.backend.block_create(id, access.id, ciphertext).await;
                if let Err(e) = self.note_backend_result(access.id, result).await {
                    if let Some(handle) = &opened_handle {
                        handle.lock().await.end_sync();
                    }
                    return Err(e);
                }
            }
        }

        // UPLOAD META
        let blocks = compact_blocks(&manifest.blocks, &manifest.dirty_blocks);
        let version = manifest.base_version + 1;
        let remote = RemoteManifest::File {
            version,
            size: manifest.size,
            created: manifest.created,
            updated: manifest.updated,
            blocks: blocks.clone(),
            author: self.device_id.clone(),
        };
        let ciphertext = self.sign_and_encrypt(access, &remote)?;

        let push_result = if manifest.is_placeholder {
            self.backend
                .vlob_create(access.id, &access.read_token.0, &access.write_token.0, ciphertext, notify_msgs.to_vec())
                .await
        } else {
            self.backend
                .vlob_update(access.id, &access.write_token.0, version, ciphertext, notify_msgs.to_vec())
                .await
        };

        match self.note_backend_result(access.id, push_result).await {
            Ok(()) => {}
            Err(SyncError::Backend(BackendError::BadVersion { expected, actual })) => {
                self.fork_on_conflict(access, &manifest, expected, actual).await?;
                if let Some(handle) = &opened_handle {
                    handle.lock().await.end_sync();
                }
                return Ok(());
            }
            Err(e) => {
                // ROLLBACK: leave dirty blocks and marker in place.
                if let Some(handle) = &opened_handle {
                    handle.lock().await.end_sync();
                }
                return Err(e);
            }
        }

        // COMMIT
        for block_ref in &manifest.dirty_blocks {
            self.block_store.clear_dirty(BlockId(block_ref.access.id.0)).await;
        }
        let local = parsec_sync_types::manifest::remote_to_local(remote, ManifestKind::File);
        self.manifest_store.set(access, local).await;
        if let (Some(handle), Some(marker)) = (&opened_handle, marker) {
            let mut file = handle.lock().await;
            file.drop_until_marker(marker)?;
            file.base_version = version;
            file.end_sync();
        }
        info!(id = %access.id, version, "file synced");
        self.events.publish(Event::EntrySynced { id: access.id, at: Utc::now() });
        Ok(())
    }

    async fn sync_folder(
        &self,
        access: &Access,
        mut manifest: FolderManifest,
        kind: ManifestKind,
        recursive: bool,
        notify: &[Beacon],
    ) -> Result<(), SyncError> {
        if recursive {
            // Children first: a parent publish must not reference a
            // placeholder child whose own state hasn't been pushed yet.
            for child_access in manifest.children.values() {
                self.boxed(child_access, true, notify).await?;
            }
        }

        if !manifest.need_sync {
            self.manifest_store.mark_outdated(access).await;
            self.events.publish(Event::EntrySynced { id: access.id, at: Utc::now() });
            return Ok(());
        }

        let notify_msgs = self.build_beacon_messages(notify, access.id);
        let version = manifest.base_version + 1;
        manifest.updated = Utc::now();
        let remote = RemoteManifest::Folder {
            version,
            created: manifest.created,
            updated: manifest.updated,
            children: manifest.children.clone(),
            author: self.device_id.clone(),
        };
        let ciphertext = self.sign_and_encrypt(access, &remote)?;

        let push_result = if manifest.is_placeholder {
            self.backend
                .vlob_create(access.id, &access.read_token.0, &access.write_token.0, ciphertext, notify_msgs)
                .await
        } else {
            self.backend
                .vlob_update(access.id, &access.write_token.0, version, ciphertext, notify_msgs)
                .await
        };

        match self.note_backend_result(access.id, push_result).await {
            Ok(()) => {}
            Err(SyncError::Backend(BackendError::BadVersion { expected, actual })) => {
                warn!(id = %access.id, expected, actual, "folder sync version conflict, skipping publish this round");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let local = parsec_sync_types::manifest::remote_to_local(remote, kind);
        self.manifest_store.set(access, local).await;
        self.events.publish(Event::EntrySynced { id: access.id, at: Utc::now() });
        Ok(())
    }

    fn sign_and_encrypt(&self, access: &Access, remote: &RemoteManifest) -> Result<Vec<u8>, SyncError> {
        let raw = bincode::serialize(remote).expect("remote manifest serialization cannot fail");
        let signed = crypto::sign(&self.keypair, self.device_id.clone(), Utc::now(), raw);
        let signed_bytes = bincode::serialize(&signed).expect("signed envelope serialization cannot fail");
        Ok(crypto::encrypt(access.key.as_bytes(), &signed_bytes))
    }

    /// Conflict resolution (§4.7): a `BadVersion` on `vlob_update` means
    /// someone else published first. Fetch their version, adopt it under
    /// the original access, and fork our local state into a freshly
    /// allocated placeholder so no local writes are lost.
    async fn fork_on_conflict(
        &self,
        access: &Access,
        local: &FileManifest,
        expected: u32,
        actual: u32,
    ) -> Result<(), SyncError> {
        warn!(id = %access.id, expected, actual, "version conflict, forking local state");
        let remote = self.backend.vlob_read(access.id, &access.read_token.0, None).await?;
        let verify_key = self
            .device_keys
            .lock()
            .await
            .get(&local.author)
            .copied();
        if let Some(verify_key) = verify_key {
            let signed: crypto::Signed = bincode::deserialize(
                &crypto::decrypt(access.key.as_bytes(), &remote.blob).map_err(crate::error::CryptoError::from)?,
            )
            .map_err(|_| crate::error::CryptoError::DecryptionFailed)?;
            let _ = crypto::verify(&signed, &local.author, &verify_key, None);
        }

        let forked_access = Access::new_placeholder();
        let forked_manifest = FileManifest {
            base_version: 0,
            size: local.size,
            created: local.created,
            updated: Utc::now(),
            blocks: local.blocks.clone(),
            dirty_blocks: local.dirty_blocks.clone(),
            need_sync: true,
            is_placeholder: true,
            author: self.device_id.clone(),
        };
        self.manifest_store.set(&forked_access, LocalManifest::File(forked_manifest)).await;

        // Reparent the fork under a conflict-suffixed name so the local
        // writes it carries stay reachable from the tree (§4.7, §4.8).
        if let Some((parent_access, name)) = self.manifest_store.find_parent(access.id).await {
            if let Ok(mut parent_manifest) = self.manifest_store.get(&parent_access).await {
                if let Some(folder) = parent_manifest.as_folder_mut() {
                    let conflict_name =
                        format!("{name} (conflict {} {})", self.device_id, Utc::now().to_rfc3339());
                    folder.children.insert(conflict_name, forked_access.clone());
                    folder.need_sync = true;
                    self.manifest_store.set(&parent_access, parent_manifest).await;
                }
            }
        } else {
            warn!(id = %access.id, "conflict fork has no known parent, forked state is unreachable until re-parented");
        }

        {
            let mut table = self.opened_files.lock().await;
            table.move_modifications(access.id, forked_access.clone());
        }

        let remote_manifest = RemoteManifest::File {
            version: remote.version,
            size: local.size,
            created: local.created,
            updated: local.updated,
            blocks: local.blocks.clone(),
            author: local.author.clone(),
        };
        let adopted = parsec_sync_types::manifest::remote_to_local(remote_manifest, ManifestKind::File);
        self.manifest_store.set(access, adopted).await;

        self.events.publish(Event::EntryUpdated { id: access.id });
        Ok(())
    }
}

/// Merge `existing` blocks with freshly flushed `dirty` blocks into the
/// final, non-overlapping block list for a published manifest: any
/// existing block whose range overlaps a new dirty block is superseded by
/// it (the dirty block's bytes are the merged, up-to-date content for
/// that range — see `OpenedFile::get_sync_map`), then the two sets are
/// combined and sorted by offset.
///
/// This appends `dirty` into `blocks` exactly once — the source this
/// engine was modeled on constructs the equivalent list twice, which
/// would duplicate coverage and violate the non-overlap invariant.
fn compact_blocks(existing: &[BlockRef], dirty: &[BlockRef]) -> Vec<BlockRef> {
    let mut result: Vec<BlockRef> = existing
        .iter()
        .filter(|b| !dirty.iter().any(|d| d.offset < b.end() && d.end() > b.offset))
        .cloned()
        .collect();
    result.extend(dirty.iter().cloned());
    result.sort_by_key(|b| b.offset);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackendClient;
    use parsec_sync_types::FolderManifest;

    fn new_syncer() -> (Syncer, Arc<ManifestStore>, Arc<Mutex<OpenedFilesTable>>, Arc<dyn BackendClient>) {
        let device_id = DeviceId::new("alice", "laptop");
        let keypair = Arc::new(DeviceKeypair::generate());
        let backend: Arc<dyn BackendClient> = Arc::new(InMemoryBackendClient::new());
        let manifest_store = Arc::new(ManifestStore::new());
        let opened_files = Arc::new(Mutex::new(OpenedFilesTable::new()));
        let block_store = Arc::new(BlockStore::new());
        let events = EventBus::new();
        let syncer = Syncer::new(
            device_id,
            keypair,
            backend.clone(),
            manifest_store.clone(),
            opened_files.clone(),
            block_store,
            events,
        );
        (syncer, manifest_store, opened_files, backend)
    }

    #[tokio::test]
    async fn sync_of_unmodified_manifest_only_marks_outdated() {
        let (syncer, manifest_store, _, _) = new_syncer();
        let access = Access::new_placeholder();
        let mut manifest = FileManifest::new_placeholder(DeviceId::new("alice", "laptop"));
        manifest.need_sync = false;
        manifest.is_placeholder = false;
        manifest.base_version = 1;
        manifest_store.set(&access, LocalManifest::File(manifest)).await;
        syncer.sync(&access, false, vec![]).await.unwrap();
        assert!(manifest_store.get(&access).await.is_err());
    }

    #[tokio::test]
    async fn placeholder_file_publishes_and_resolves() {
        let (syncer, manifest_store, opened_files, _) = new_syncer();
        let access = Access::new_placeholder();
        let manifest = LocalManifest::File(FileManifest::new_placeholder(DeviceId::new("alice", "laptop")));
        manifest_store.set(&access, manifest.clone()).await;

        let handle = {
            let mut table = opened_files.lock().await;
            table.open_file(access.clone(), &manifest)
        };
        handle.lock().await.write(b"hello".to_vec(), None);

        syncer.sync(&access, false, vec![]).await.unwrap();

        let synced = manifest_store.get(&access).await.unwrap();
        assert!(!synced.is_placeholder());
        assert_eq!(synced.base_version(), 1);
        let file = synced.as_file().unwrap();
        assert_eq!(file.size, 5);
        assert!(file.dirty_blocks.is_empty());
    }

    #[tokio::test]
    async fn flushing_twice_before_sync_does_not_duplicate_dirty_blocks() {
        let (syncer, manifest_store, opened_files, _) = new_syncer();
        let access = Access::new_placeholder();
        let manifest = LocalManifest::File(FileManifest::new_placeholder(DeviceId::new("alice", "laptop")));
        manifest_store.set(&access, manifest.clone()).await;

        let handle = {
            let mut table = opened_files.lock().await;
            table.open_file(access.clone(), &manifest)
        };
        handle.lock().await.write(b"hello".to_vec(), None);

        // A facade flush stages a dirty block for the same bytes the
        // syncer's own FLUSH step is about to recompute.
        {
            let file = handle.lock().await;
            let (size, buffers) = file.get_flush_map();
            let mut staged = manifest_store.get(&access).await.unwrap();
            let file_manifest = staged.as_file_mut().unwrap();
            file_manifest.size = size;
            for (offset, data) in buffers {
                file_manifest.dirty_blocks.push(BlockRef {
                    access: Access::new_placeholder(),
                    offset,
                    size: data.len() as u32,
                    digest: [0u8; 32],
                });
            }
            manifest_store.set(&access, staged).await;
        }

        syncer.sync(&access, false, vec![]).await.unwrap();

        let synced = manifest_store.get(&access).await.unwrap();
        let file = synced.as_file().unwrap();
        assert_eq!(file.blocks.len(), 1, "duplicate dirty blocks must not survive publish");
        assert_eq!(file.blocks[0].offset, 0);
        assert_eq!(file.blocks[0].size, 5);
    }

    #[tokio::test]
    async fn fork_on_conflict_reparents_forked_access_under_parent() {
        let (syncer, manifest_store, opened_files, backend) = new_syncer();

        let child_access = Access::new_placeholder();
        let child_manifest = LocalManifest::File(FileManifest::new_placeholder(DeviceId::new("alice", "laptop")));
        manifest_store.set(&child_access, child_manifest.clone()).await;

        let parent_access = Access::new_placeholder();
        let mut parent_manifest = FolderManifest::new_placeholder(DeviceId::new("alice", "laptop"));
        parent_manifest.children.insert("notes.txt".into(), child_access.clone());
        manifest_store.register_path(parent_access.clone(), "/notes.txt".into(), vec![]).await;
        manifest_store.set(&parent_access, LocalManifest::Folder(parent_manifest)).await;

        let handle = {
            let mut table = opened_files.lock().await;
            table.open_file(child_access.clone(), &child_manifest)
        };
        handle.lock().await.write(b"hello".to_vec(), None);

        syncer.sync(&child_access, false, vec![]).await.unwrap();

        // Simulate another device publishing version 2 first.
        let other_device = DeviceId::new("bob", "desktop");
        let other_keypair = DeviceKeypair::generate();
        let bumped = RemoteManifest::File {
            version: 2,
            size: 0,
            created: Utc::now(),
            updated: Utc::now(),
            blocks: vec![],
            author: other_device.clone(),
        };
        let raw = bincode::serialize(&bumped).unwrap();
        let signed = crypto::sign(&other_keypair, other_device, Utc::now(), raw);
        let signed_bytes = bincode::serialize(&signed).unwrap();
        let ciphertext = crypto::encrypt(child_access.key.as_bytes(), &signed_bytes);
        backend.vlob_update(child_access.id, &child_access.write_token.0, 2, ciphertext, vec![]).await.unwrap();

        handle.lock().await.write(b" world".to_vec(), None);
        syncer.sync(&child_access, false, vec![]).await.unwrap();

        let parent_synced = manifest_store.get(&parent_access).await.unwrap();
        let folder = parent_synced.as_folder().unwrap();
        assert!(folder.need_sync);
        assert_eq!(folder.children.len(), 2);
        let (forked_name, forked_access) = folder
            .children
            .iter()
            .find(|(_, a)| a.id != child_access.id)
            .expect("forked access must be reparented under the folder");
        assert!(forked_name.starts_with("notes.txt (conflict "));
        assert_ne!(forked_access.id, child_access.id);
    }

    #[tokio::test]
    async fn compact_blocks_replaces_overlapping_existing_range() {
        let old = BlockRef { access: Access::new_placeholder(), offset: 0, size: 10, digest: [1; 32] };
        let fresh = BlockRef { access: Access::new_placeholder(), offset: 5, size: 5, digest: [2; 32] };
        let merged = compact_blocks(&[old], &[fresh.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].digest, fresh.digest);
    }

    #[tokio::test]
    async fn recursive_folder_sync_publishes_children_before_parent() {
        let (syncer, manifest_store, _) = new_syncer();
        let child_access = Access::new_placeholder();
        let child_manifest = LocalManifest::File(FileManifest::new_placeholder(DeviceId::new("alice", "laptop")));
        manifest_store.set(&child_access, child_manifest).await;

        let parent_access = Access::new_placeholder();
        let mut parent_manifest = FolderManifest::new_placeholder(DeviceId::new("alice", "laptop"));
        parent_manifest.children.insert("child".into(), child_access.clone());
        manifest_store.set(&parent_access, LocalManifest::Folder(parent_manifest)).await;

        syncer.sync(&parent_access, true, vec![]).await.unwrap();

        let child_synced = manifest_store.get(&child_access).await.unwrap();
        assert!(!child_synced.is_placeholder());
        let parent_synced = manifest_store.get(&parent_access).await.unwrap();
        assert!(!parent_synced.is_placeholder());
    }
}
