//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C6 — Backend client: typed request/response over the vault protocol
//! (§4.6, §6).
//!
//! `BackendClient` abstracts the wire transport the way `Transport`
//! abstracts TCP/QUIC elsewhere in this workspace — callers depend on the
//! trait, not a concrete connection, so the syncer can run unmodified
//! against an in-memory mock in tests and a real connection in production.

use crate::error::BackendError;
use async_trait::async_trait;
use parsec_sync_types::{BlockId, EntryId};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// One entry to check in a `vlob_group_check` request.
#[derive(Debug, Clone)]
pub struct GroupCheckEntry {
    pub id: EntryId,
    pub read_token: Vec<u8>,
    pub version: u32,
}

/// An entry the backend reports as changed since the version the caller
/// last saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedEntry {
    pub id: EntryId,
    pub version: u32,
}

/// A beacon-updated notification attached to a vlob write (§6's `notify[]`).
#[derive(Debug, Clone)]
pub struct BeaconNotification {
    pub beacon_id: EntryId,
    /// `sym_encrypt(beacon_key, sign(signer_key, {id: entry_id}))`.
    pub ciphertext: Vec<u8>,
}

/// A vlob read's ok response: the stored version and ciphertext.
#[derive(Debug, Clone)]
pub struct VlobReadResponse {
    pub version: u32,
    pub blob: Vec<u8>,
}

/// Typed surface over the vault protocol (§6). Every call validates the
/// envelope and partitions failures into `Unavailable` (transport),
/// `InvalidRequest`/`InvalidResponse` (schema), or a domain-specific
/// `BackendError` variant carrying the backend's own error status.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn vlob_create(
        &self,
        id: EntryId,
        read_token: &[u8],
        write_token: &[u8],
        blob: Vec<u8>,
        notify: Vec<BeaconNotification>,
    ) -> Result<(), BackendError>;

    async fn vlob_update(
        &self,
        id: EntryId,
        write_token: &[u8],
        version: u32,
        blob: Vec<u8>,
        notify: Vec<BeaconNotification>,
    ) -> Result<(), BackendError>;

    async fn vlob_read(
        &self,
        id: EntryId,
        read_token: &[u8],
        version: Option<u32>,
    ) -> Result<VlobReadResponse, BackendError>;

    async fn vlob_group_check(
        &self,
        to_check: Vec<GroupCheckEntry>,
    ) -> Result<Vec<ChangedEntry>, BackendError>;

    async fn block_create(&self, id: BlockId, realm: EntryId, block: Vec<u8>) -> Result<(), BackendError>;

    async fn block_read(&self, id: BlockId) -> Result<Vec<u8>, BackendError>;

    async fn ping(&self, payload: &str) -> Result<String, BackendError>;
}

struct Vlob {
    version: u32,
    blob: Vec<u8>,
    read_token: Vec<u8>,
    write_token: Vec<u8>,
}

/// An in-memory backend used in tests and by the demonstration CLI. Not a
/// real network client — exercises the same trait contract the syncer
/// depends on, including `BadVersion` and idempotent `block_create`.
#[derive(Default)]
pub struct InMemoryBackendClient {
    vlobs: Mutex<HashMap<EntryId, Vlob>>,
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
}

impl InMemoryBackendClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackendClient for InMemoryBackendClient {
    async fn vlob_create(
        &self,
        id: EntryId,
        read_token: &[u8],
        write_token: &[u8],
        blob: Vec<u8>,
        _notify: Vec<BeaconNotification>,
    ) -> Result<(), BackendError> {
        let mut vlobs = self.vlobs.lock().await;
        if vlobs.contains_key(&id) {
            return Err(BackendError::AlreadyExists);
        }
        vlobs.insert(
            id,
            Vlob { version: 1, blob, read_token: read_token.to_vec(), write_token: write_token.to_vec() },
        );
        Ok(())
    }

    async fn vlob_update(
        &self,
        id: EntryId,
        write_token: &[u8],
        version: u32,
        blob: Vec<u8>,
        _notify: Vec<BeaconNotification>,
    ) -> Result<(), BackendError> {
        let mut vlobs = self.vlobs.lock().await;
        let vlob = vlobs.get_mut(&id).ok_or(BackendError::NotFound)?;
        if vlob.write_token != write_token {
            return Err(BackendError::TrustSeed);
        }
        if version != vlob.version + 1 {
            return Err(BackendError::BadVersion { expected: vlob.version + 1, actual: version });
        }
        vlob.version = version;
        vlob.blob = blob;
        Ok(())
    }

    async fn vlob_read(
        &self,
        id: EntryId,
        read_token: &[u8],
        version: Option<u32>,
    ) -> Result<VlobReadResponse, BackendError> {
        let vlobs = self.vlobs.lock().await;
        let vlob = vlobs.get(&id).ok_or(BackendError::NotFound)?;
        if vlob.read_token != read_token {
            return Err(BackendError::TrustSeed);
        }
        if let Some(v) = version {
            if v != vlob.version {
                return Err(BackendError::NotFound);
            }
        }
        Ok(VlobReadResponse { version: vlob.version, blob: vlob.blob.clone() })
    }

    async fn vlob_group_check(
        &self,
        to_check: Vec<GroupCheckEntry>,
    ) -> Result<Vec<ChangedEntry>, BackendError> {
        let vlobs = self.vlobs.lock().await;
        let mut changed = Vec::new();
        for entry in to_check {
            if let Some(vlob) = vlobs.get(&entry.id) {
                if vlob.version != entry.version {
                    changed.push(ChangedEntry { id: entry.id, version: vlob.version });
                }
            }
        }
        Ok(changed)
    }

    async fn block_create(&self, id: BlockId, _realm: EntryId, block: Vec<u8>) -> Result<(), BackendError> {
        // Blockstore is idempotent (§4.7 step UPLOAD DATA): a duplicate id
        // is a success, not an error.
        self.blocks.lock().await.entry(id).or_insert(block);
        Ok(())
    }

    async fn block_read(&self, id: BlockId) -> Result<Vec<u8>, BackendError> {
        self.blocks
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn ping(&self, payload: &str) -> Result<String, BackendError> {
        Ok(payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vlob_create_then_read_round_trips() {
        let backend = InMemoryBackendClient::new();
        let id = EntryId::new();
        backend
            .vlob_create(id, b"rts", b"wts", b"ciphertext".to_vec(), vec![])
            .await
            .unwrap();
        let read = backend.vlob_read(id, b"rts", None).await.unwrap();
        assert_eq!(read.version, 1);
        assert_eq!(read.blob, b"ciphertext");
    }

    #[tokio::test]
    async fn vlob_update_requires_next_version() {
        let backend = InMemoryBackendClient::new();
        let id = EntryId::new();
        backend.vlob_create(id, b"rts", b"wts", b"v1".to_vec(), vec![]).await.unwrap();
        let err = backend
            .vlob_update(id, b"wts", 5, b"v5".to_vec(), vec![])
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::BadVersion { expected: 2, actual: 5 });
    }

    #[tokio::test]
    async fn block_create_is_idempotent() {
        let backend = InMemoryBackendClient::new();
        let id = BlockId::new();
        backend.block_create(id, EntryId::new(), b"data".to_vec()).await.unwrap();
        backend.block_create(id, EntryId::new(), b"data".to_vec()).await.unwrap();
        assert_eq!(backend.block_read(id).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn vlob_create_twice_fails() {
        let backend = InMemoryBackendClient::new();
        let id = EntryId::new();
        backend.vlob_create(id, b"rts", b"wts", b"a".to_vec(), vec![]).await.unwrap();
        let err = backend
            .vlob_create(id, b"rts", b"wts", b"b".to_vec(), vec![])
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::AlreadyExists);
    }

    #[tokio::test]
    async fn group_check_reports_only_changed_entries() {
        let backend = InMemoryBackendClient::new();
        let id = EntryId::new();
        backend.vlob_create(id, b"rts", b"wts", b"v1".to_vec(), vec![]).await.unwrap();
        let changed = backend
            .vlob_group_check(vec![GroupCheckEntry { id, read_token: b"rts".to_vec(), version: 1 }])
            .await
            .unwrap();
        assert!(changed.is_empty());
        let changed = backend
            .vlob_group_check(vec![GroupCheckEntry { id, read_token: b"rts".to_vec(), version: 0 }])
            .await
            .unwrap();
        assert_eq!(changed, vec![ChangedEntry { id, version: 1 }]);
    }
}
