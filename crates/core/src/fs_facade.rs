//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C9 — FS facade: a thin request router mapping filesystem primitives to
//! C3 (local manifest store) and C4 (opened-file table) calls (§4.9).
//!
//! This is the seam a FUSE/Dokan adapter would sit behind; it is not that
//! adapter. `open` returns an `EntryId` standing in for a file descriptor —
//! the mount bridge owns the numeric-fd-to-entry mapping in a real
//! deployment (§1, §9's "FUSE/Dokan thread ↔ core scheduler" note).

use crate::backend::BackendClient;
use crate::block_store::BlockStore;
use crate::buffer::Payload;
use crate::crypto;
use crate::error::FsError;
use crate::manifest_store::ManifestStore;
use crate::opened_file::OpenedFilesTable;
use parsec_sync_types::{Access, BlockId, BlockRef, DeviceId, EntryId, FileManifest, FolderManifest, LocalManifest};
use std::sync::Arc;
use tokio::sync::Mutex;

/// `stat`'s result: enough to answer the mount adapter's `getattr` without
/// exposing the manifest's internal shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub id: EntryId,
    pub size: u64,
    pub is_dir: bool,
    pub base_version: u32,
    pub need_sync: bool,
    pub is_placeholder: bool,
}

/// Thin router over C3/C4 (§4.9). Holds shared handles to the components it
/// delegates to; cheap to clone.
#[derive(Clone)]
pub struct FsFacade {
    manifest_store: Arc<ManifestStore>,
    opened_files: Arc<Mutex<OpenedFilesTable>>,
    block_store: Arc<BlockStore>,
    backend: Arc<dyn BackendClient>,
}

impl FsFacade {
    pub fn new(
        manifest_store: Arc<ManifestStore>,
        opened_files: Arc<Mutex<OpenedFilesTable>>,
        block_store: Arc<BlockStore>,
        backend: Arc<dyn BackendClient>,
    ) -> Self {
        Self { manifest_store, opened_files, block_store, backend }
    }

    async fn handle(&self, id: EntryId) -> Result<Arc<Mutex<crate::opened_file::OpenedFile>>, FsError> {
        self.opened_files.lock().await.get(id).ok_or(FsError::NotFound)
    }

    /// Allocate a placeholder file access under `parent/name` (§3's
    /// lifecycle: placeholders exist only locally until their first sync).
    pub async fn create_file(&self, parent: &Access, name: &str, author: DeviceId) -> Result<Access, FsError> {
        let access = Access::new_placeholder();
        self.manifest_store
            .set(&access, LocalManifest::File(FileManifest::new_placeholder(author)))
            .await;
        self.link_child(parent, name, access.clone()).await?;
        Ok(access)
    }

    /// Allocate a placeholder folder access under `parent/name`.
    pub async fn create_folder(&self, parent: &Access, name: &str, author: DeviceId) -> Result<Access, FsError> {
        let access = Access::new_placeholder();
        self.manifest_store
            .set(&access, LocalManifest::Folder(FolderManifest::new_placeholder(author)))
            .await;
        self.link_child(parent, name, access.clone()).await?;
        Ok(access)
    }

    /// `mkdir` is `create_folder` under the FS facade's naming (§4.9).
    pub async fn mkdir(&self, parent: &Access, name: &str, author: DeviceId) -> Result<Access, FsError> {
        self.create_folder(parent, name, author).await
    }

    async fn link_child(&self, parent: &Access, name: &str, child: Access) -> Result<(), FsError> {
        let mut manifest = self.manifest_store.get(parent).await.map_err(|_| FsError::NotFound)?;
        let folder = manifest.as_folder_mut().ok_or(FsError::NotADirectory)?;
        folder.children.insert(name.to_string(), child);
        folder.need_sync = true;
        self.manifest_store.set(parent, manifest).await;
        Ok(())
    }

    /// Open `access`, returning the handle the mount adapter uses for
    /// subsequent `read`/`write`/`truncate`/`flush`/`close` calls.
    pub async fn open(&self, access: &Access) -> Result<EntryId, FsError> {
        let manifest = self.manifest_store.get(access).await.map_err(|_| FsError::NotFound)?;
        self.opened_files.lock().await.open_file(access.clone(), &manifest);
        Ok(access.id)
    }

    /// Compose the readable view of `[offset, offset + size)`, resolving
    /// any `DirtyBlock`/`CleanBlock` payloads through C5 (§4.4, §4.5). A
    /// negative `size` means "to end of file".
    pub async fn read(&self, id: EntryId, size: i64, offset: u64) -> Result<Vec<u8>, FsError> {
        let handle = self.handle(id).await?;
        let file = handle.lock().await;
        let manifest = self.manifest_store.get(&file.access).await.map_err(|_| FsError::NotFound)?;
        let space = file.get_read_map(&manifest, size, offset).map_err(|_| FsError::CorruptedData)?;
        let author = manifest.as_file().map(|f| f.author.clone());

        let mut out = Vec::new();
        let mut cursor = offset;
        for slice in space.slices {
            if slice.start > cursor {
                out.resize(out.len() + (slice.start - cursor) as usize, 0);
                cursor = slice.start;
            }
            match slice.payload {
                Payload::Ram(data) => out.extend_from_slice(&data),
                Payload::DirtyBlock(block_ref) | Payload::CleanBlock(block_ref) => {
                    let author = author.clone().unwrap_or_else(|| DeviceId::new("unknown", "unknown"));
                    let bytes = self
                        .block_store
                        .get(
                            &block_ref.access,
                            block_ref.offset,
                            block_ref.size,
                            &block_ref.digest,
                            &author,
                            &author,
                            self.backend.as_ref(),
                        )
                        .await
                        .map_err(|_| FsError::CorruptedData)?;
                    let skip = (slice.start - block_ref.offset) as usize;
                    let take = (slice.end - slice.start) as usize;
                    out.extend_from_slice(&bytes[skip..skip + take]);
                }
            }
            cursor = slice.end;
        }
        Ok(out)
    }

    /// Append a command to `id`'s in-memory log. An `offset` of `None`
    /// means "append at current size" (§4.4).
    pub async fn write(&self, id: EntryId, buf: Vec<u8>, offset: Option<u64>) -> Result<(), FsError> {
        let handle = self.handle(id).await?;
        handle.lock().await.write(buf, offset);
        Ok(())
    }

    /// Shrink or grow `id` to `len`. Growth is expressed as a zero-fill
    /// write, matching §4.4's truncate semantics.
    pub async fn truncate(&self, id: EntryId, len: u64) -> Result<(), FsError> {
        let handle = self.handle(id).await?;
        let mut file = handle.lock().await;
        if len > file.size {
            let pad = (len - file.size) as usize;
            let current = file.size;
            file.write(vec![0u8; pad], Some(current));
        } else {
            file.truncate(len);
        }
        Ok(())
    }

    /// Drain pending in-RAM writes into new dirty blocks in C5 and record
    /// them against the manifest in C3. Does not remove the underlying
    /// `Cmd::Write` entries — a subsequent `read` still composes correctly
    /// since writes outrank the dirty blocks they were flushed from (§8
    /// property 3, "flush equivalence"). A range this or a prior flush
    /// already recorded as dirty is not re-materialized, so calling `flush`
    /// more than once before a sync doesn't duplicate block coverage.
    pub async fn flush(&self, id: EntryId) -> Result<(), FsError> {
        let handle = self.handle(id).await?;
        let file = handle.lock().await;
        let manifest = self.manifest_store.get(&file.access).await.map_err(|_| FsError::NotFound)?;
        let Some(mut file_manifest) = manifest.as_file().cloned() else {
            return Ok(());
        };
        let (size, buffers) = file.get_flush_map();
        file_manifest.size = size;
        let buffers = crate::buffer::new_dirty_ranges(&file_manifest.dirty_blocks, buffers).map_err(|_| FsError::CorruptedData)?;
        for (offset, data) in buffers {
            let digest = crypto::digest(&data);
            let block_access = Access::new_placeholder();
            let block_ref = BlockRef { access: block_access.clone(), offset, size: data.len() as u32, digest };
            self.block_store.set_dirty(BlockId(block_access.id.0), data).await;
            file_manifest.dirty_blocks.push(block_ref);
        }
        file_manifest.need_sync = true;
        self.manifest_store.set(&file.access, LocalManifest::File(file_manifest)).await;
        Ok(())
    }

    /// Flush and drop the open handle. Sync is the caller's responsibility
    /// (the syncer, not the facade, decides when to publish — §4.7).
    pub async fn close(&self, id: EntryId) -> Result<(), FsError> {
        self.flush(id).await?;
        self.opened_files.lock().await.close_file(id);
        Ok(())
    }

    /// Detach `name` from `parent`'s children, marking `parent` dirty.
    /// Used by both `unlink` (files) and, after an emptiness check, `rmdir`
    /// (folders) — the access id the child referenced is untouched, only
    /// the parent's pointer is removed (§4.9).
    pub async fn unlink(&self, parent: &Access, name: &str) -> Result<(), FsError> {
        let mut manifest = self.manifest_store.get(parent).await.map_err(|_| FsError::NotFound)?;
        let folder = manifest.as_folder_mut().ok_or(FsError::NotADirectory)?;
        folder.children.remove(name).ok_or(FsError::NotFound)?;
        folder.need_sync = true;
        self.manifest_store.set(parent, manifest).await;
        Ok(())
    }

    /// `rmdir`: same removal as `unlink`, refusing a non-empty target.
    pub async fn rmdir(&self, parent: &Access, name: &str) -> Result<(), FsError> {
        let manifest = self.manifest_store.get(parent).await.map_err(|_| FsError::NotFound)?;
        let folder = manifest.as_folder().ok_or(FsError::NotADirectory)?;
        let child_access = folder.children.get(name).cloned().ok_or(FsError::NotFound)?;
        let child_manifest = self.manifest_store.get(&child_access).await.map_err(|_| FsError::NotFound)?;
        let child_folder = child_manifest.as_folder().ok_or(FsError::NotADirectory)?;
        if !child_folder.children.is_empty() {
            return Err(FsError::NotEmpty);
        }
        self.unlink(parent, name).await
    }

    /// Move `src_name` from `src_parent` to `dst_name` under `dst_parent`.
    /// The entry's access id is unchanged; only the two parent manifests
    /// are rewritten and marked `need_sync` (§4.9, §8 scenario S6).
    pub async fn rename(
        &self,
        src_parent: &Access,
        src_name: &str,
        dst_parent: &Access,
        dst_name: &str,
    ) -> Result<(), FsError> {
        let mut src_manifest = self.manifest_store.get(src_parent).await.map_err(|_| FsError::NotFound)?;
        let moved = src_manifest
            .as_folder_mut()
            .ok_or(FsError::NotADirectory)?
            .children
            .remove(src_name)
            .ok_or(FsError::NotFound)?;
        src_manifest.as_folder_mut().unwrap().need_sync = true;
        self.manifest_store.set(src_parent, src_manifest).await;

        let mut dst_manifest = if src_parent.id == dst_parent.id {
            self.manifest_store.get(src_parent).await.map_err(|_| FsError::NotFound)?
        } else {
            self.manifest_store.get(dst_parent).await.map_err(|_| FsError::NotFound)?
        };
        let dst_folder = dst_manifest.as_folder_mut().ok_or(FsError::NotADirectory)?;
        dst_folder.children.insert(dst_name.to_string(), moved);
        dst_folder.need_sync = true;
        self.manifest_store.set(dst_parent, dst_manifest).await;
        Ok(())
    }

    /// `stat`: the manifest's externally visible shape, no internal block
    /// layout exposed.
    pub async fn stat(&self, access: &Access) -> Result<Stat, FsError> {
        let manifest = self.manifest_store.get(access).await.map_err(|_| FsError::NotFound)?;
        Ok(Stat {
            id: access.id,
            size: manifest.as_file().map(|f| f.size).unwrap_or(0),
            is_dir: manifest.as_folder().is_some(),
            base_version: manifest.base_version(),
            need_sync: manifest.need_sync(),
            is_placeholder: manifest.is_placeholder(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackendClient;

    fn author() -> DeviceId {
        DeviceId::new("alice", "laptop")
    }

    async fn new_facade() -> (FsFacade, Access) {
        let manifest_store = Arc::new(ManifestStore::new());
        let opened_files = Arc::new(Mutex::new(OpenedFilesTable::new()));
        let block_store = Arc::new(BlockStore::new());
        let backend: Arc<dyn BackendClient> = Arc::new(InMemoryBackendClient::new());
        let facade = FsFacade::new(manifest_store.clone(), opened_files, block_store, backend);

        let root = Access::new_placeholder();
        manifest_store
            .set(&root, LocalManifest::Folder(FolderManifest::new_placeholder(author())))
            .await;
        (facade, root)
    }

    #[tokio::test]
    async fn s1_write_read_flush() {
        let (facade, root) = new_facade().await;
        let file_access = facade.create_file(&root, "a.txt", author()).await.unwrap();
        let fd = facade.open(&file_access).await.unwrap();

        facade.write(fd, b"hello".to_vec(), Some(0)).await.unwrap();
        facade.write(fd, b" world".to_vec(), Some(5)).await.unwrap();
        let read = facade.read(fd, 11, 0).await.unwrap();
        assert_eq!(read, b"hello world");

        facade.flush(fd).await.unwrap();
        let stat = facade.stat(&file_access).await.unwrap();
        assert_eq!(stat.size, 11);
        assert!(stat.need_sync);
    }

    #[tokio::test]
    async fn flushing_twice_does_not_duplicate_dirty_blocks() {
        let (facade, root) = new_facade().await;
        let file_access = facade.create_file(&root, "a.txt", author()).await.unwrap();
        let fd = facade.open(&file_access).await.unwrap();

        facade.write(fd, b"hello".to_vec(), Some(0)).await.unwrap();
        facade.flush(fd).await.unwrap();
        facade.flush(fd).await.unwrap();

        let manifest = facade.manifest_store.get(&file_access).await.unwrap();
        let file = manifest.as_file().unwrap();
        assert_eq!(file.dirty_blocks.len(), 1, "re-flushing unchanged writes must not duplicate dirty blocks");
    }

    #[tokio::test]
    async fn s2_truncate_after_write() {
        let (facade, root) = new_facade().await;
        let file_access = facade.create_file(&root, "b.txt", author()).await.unwrap();
        let fd = facade.open(&file_access).await.unwrap();

        facade.write(fd, b"abcdef".to_vec(), Some(0)).await.unwrap();
        facade.truncate(fd, 3).await.unwrap();
        let read = facade.read(fd, 10, 0).await.unwrap();
        assert_eq!(read, b"abc");
    }

    #[tokio::test]
    async fn truncate_grow_zero_fills() {
        let (facade, root) = new_facade().await;
        let file_access = facade.create_file(&root, "c.txt", author()).await.unwrap();
        let fd = facade.open(&file_access).await.unwrap();

        facade.write(fd, b"ab".to_vec(), Some(0)).await.unwrap();
        facade.truncate(fd, 5).await.unwrap();
        let read = facade.read(fd, 5, 0).await.unwrap();
        assert_eq!(read, b"ab\0\0\0");
    }

    #[tokio::test]
    async fn s6_rename_across_folders_marks_both_dirty() {
        let (facade, root) = new_facade().await;
        let a = facade.create_folder(&root, "a", author()).await.unwrap();
        let b = facade.create_folder(&root, "b", author()).await.unwrap();
        let file_access = facade.create_file(&a, "f", author()).await.unwrap();

        // Clear the parents' need_sync so the test isolates rename's effect.
        for parent in [&a, &b] {
            let mut m = facade.manifest_store.get(parent).await.unwrap();
            m.as_folder_mut().unwrap().need_sync = false;
            facade.manifest_store.set(parent, m).await;
        }

        facade.rename(&a, "f", &b, "f").await.unwrap();

        let a_stat = facade.stat(&a).await.unwrap();
        let b_stat = facade.stat(&b).await.unwrap();
        assert!(a_stat.need_sync);
        assert!(b_stat.need_sync);

        let a_manifest = facade.manifest_store.get(&a).await.unwrap();
        assert!(!a_manifest.as_folder().unwrap().children.contains_key("f"));
        let b_manifest = facade.manifest_store.get(&b).await.unwrap();
        let moved = b_manifest.as_folder().unwrap().children.get("f").unwrap();
        assert_eq!(moved.id, file_access.id, "access id unchanged by rename");
    }

    #[tokio::test]
    async fn rmdir_refuses_non_empty_folder() {
        let (facade, root) = new_facade().await;
        let dir = facade.create_folder(&root, "dir", author()).await.unwrap();
        facade.create_file(&dir, "f", author()).await.unwrap();
        let err = facade.rmdir(&root, "dir").await.unwrap_err();
        assert_eq!(err, FsError::NotEmpty);
    }

    #[tokio::test]
    async fn rmdir_removes_empty_folder() {
        let (facade, root) = new_facade().await;
        facade.create_folder(&root, "dir", author()).await.unwrap();
        facade.rmdir(&root, "dir").await.unwrap();
        let manifest = facade.manifest_store.get(&root).await.unwrap();
        assert!(!manifest.as_folder().unwrap().children.contains_key("dir"));
    }

    #[tokio::test]
    async fn unlink_removes_file_reference() {
        let (facade, root) = new_facade().await;
        facade.create_file(&root, "f", author()).await.unwrap();
        facade.unlink(&root, "f").await.unwrap();
        let manifest = facade.manifest_store.get(&root).await.unwrap();
        assert!(!manifest.as_folder().unwrap().children.contains_key("f"));
    }
}
