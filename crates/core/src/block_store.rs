//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C5 — Block store: the local content store for dirty and fetched clean
//! blocks (§4.5).
//!
//! `dirty_blocks` is locally authoritative — it holds bytes the syncer has
//! not yet pushed. `clean_blocks` is a size-bounded LRU cache of blocks
//! already confirmed by the backend; it may be evicted and refetched at
//! will.

use crate::backend::BackendClient;
use crate::crypto;
use crate::error::BlockStoreError;
use parsec_sync_types::{Access, BlockId, DeviceId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::warn;

/// Bound on the clean-block cache, in bytes (§4.5: "size-bounded LRU").
pub const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;

struct CleanCache {
    capacity_bytes: u64,
    used_bytes: u64,
    entries: HashMap<BlockId, Vec<u8>>,
    lru: VecDeque<BlockId>,
}

impl CleanCache {
    fn new(capacity_bytes: u64) -> Self {
        Self { capacity_bytes, used_bytes: 0, entries: HashMap::new(), lru: VecDeque::new() }
    }

    fn touch(&mut self, id: BlockId) {
        self.lru.retain(|x| *x != id);
        self.lru.push_back(id);
    }

    fn insert(&mut self, id: BlockId, data: Vec<u8>) {
        if let Some(old) = self.entries.remove(&id) {
            self.used_bytes -= old.len() as u64;
        }
        self.used_bytes += data.len() as u64;
        self.entries.insert(id, data);
        self.touch(id);
        while self.used_bytes > self.capacity_bytes {
            let Some(victim) = self.lru.pop_front() else { break };
            if let Some(removed) = self.entries.remove(&victim) {
                self.used_bytes -= removed.len() as u64;
            }
        }
    }

    fn get(&mut self, id: BlockId) -> Option<Vec<u8>> {
        let data = self.entries.get(&id).cloned();
        if data.is_some() {
            self.touch(id);
        }
        data
    }

    fn evict(&mut self, id: BlockId) {
        if let Some(removed) = self.entries.remove(&id) {
            self.used_bytes -= removed.len() as u64;
        }
        self.lru.retain(|x| *x != id);
    }
}

/// Local block store: dirty blocks authoritative, clean blocks an LRU
/// cache fronting the backend.
pub struct BlockStore {
    dirty_blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
    clean_blocks: Mutex<CleanCache>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY_BYTES)
    }

    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            dirty_blocks: Mutex::new(HashMap::new()),
            clean_blocks: Mutex::new(CleanCache::new(capacity_bytes)),
        }
    }

    /// Persist a freshly flushed dirty block. Called by the syncer's FLUSH
    /// step (§4.7).
    pub async fn set_dirty(&self, id: BlockId, data: Vec<u8>) {
        self.dirty_blocks.lock().await.insert(id, data);
    }

    /// Drop a dirty block once its upload has been confirmed, so the next
    /// sync doesn't re-upload it.
    pub async fn clear_dirty(&self, id: BlockId) {
        self.dirty_blocks.lock().await.remove(&id);
    }

    pub async fn evict_clean(&self, id: BlockId) {
        self.clean_blocks.lock().await.evict(id);
    }

    /// Peek a dirty block's plaintext directly, without the read-path's
    /// author/digest checks. Used internally by the syncer's UPLOAD DATA
    /// step, which is pushing bytes it just flushed itself.
    pub async fn get_dirty_plaintext(&self, id: BlockId) -> Option<Vec<u8>> {
        self.dirty_blocks.lock().await.get(&id).cloned()
    }

    /// Read a block: local dirty, then local clean cache, then fetch from
    /// the backend — verifying digest and author policy on fetch (§4.5).
    pub async fn get(
        &self,
        access: &Access,
        offset: u64,
        size: u32,
        digest: &[u8; 32],
        manifest_author: &DeviceId,
        block_author: &DeviceId,
        backend: &dyn BackendClient,
    ) -> Result<Vec<u8>, BlockStoreError> {
        let id = BlockId(access.id.0);

        if let Some(data) = self.dirty_blocks.lock().await.get(&id).cloned() {
            return Ok(data);
        }
        if let Some(data) = self.clean_blocks.lock().await.get(id) {
            return Ok(data);
        }

        if manifest_author != block_author {
            return Err(BlockStoreError::AuthorMismatch);
        }

        let ciphertext = backend
            .block_read(id)
            .await
            .map_err(|_| BlockStoreError::NotFound)?;
        let plaintext = crypto::decrypt(access.key.as_bytes(), &ciphertext)
            .map_err(|_| BlockStoreError::NotFound)?;
        if plaintext.len() != size as usize {
            return Err(BlockStoreError::DigestMismatch);
        }
        if &crypto::digest(&plaintext) != digest {
            warn!(block = %id.0, %offset, "fetched block failed digest verification");
            return Err(BlockStoreError::DigestMismatch);
        }

        self.clean_blocks.lock().await.insert(id, plaintext.clone());
        Ok(plaintext)
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}
