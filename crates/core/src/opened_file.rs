//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C4 — Opened-file table: the append-only command log for a file between
//! `open` and `close`, and the table tracking every currently open file
//! (§4.4).
//!
//! Reads compose the command log over the manifest's committed blocks
//! (C2). Sync drops a marker fencing the commands eligible for this sync
//! round, drains everything before it into a block-aligned flush map, and
//! the sync gate (`begin_sync`/`end_sync`) keeps flushes and syncs from
//! racing each other on the same file.

use crate::buffer::{merge_buffers, quick_filter, BufferSlice, ContiguousSpace, MergeLimits, Payload, UncontiguousSpace};
use crate::error::OpenedFileError;
use chrono::Utc;
use parsec_sync_types::{Access, BlockRef, Cmd, EntryId, LocalManifest};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default block alignment for sync uploads, matching the size at which
/// blocks are stored remotely (§4.4).
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// One file's in-memory state while it is open: its current access
/// (mutable — a placeholder is resolved to a real id on first sync), its
/// size as observed by the application, and the append-only log of writes,
/// truncations and sync markers issued since `open`.
pub struct OpenedFile {
    pub access: Access,
    pub size: u64,
    pub base_version: u32,
    cmds: Vec<Cmd>,
    block_size: u64,
    syncing: bool,
}

impl OpenedFile {
    pub fn new(access: Access, size: u64, base_version: u32) -> Self {
        Self {
            access,
            size,
            base_version,
            cmds: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            syncing: false,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.base_version == 0
    }

    /// Whether this file needs a sync at all: a placeholder, a manifest
    /// already marked dirty, or local writes pending flush.
    pub fn need_sync(&self, manifest: &LocalManifest) -> bool {
        self.is_placeholder() || manifest.need_sync() || self.need_flush(manifest)
    }

    /// Whether there are bytes in RAM that haven't made it into a block yet.
    pub fn need_flush(&self, manifest: &LocalManifest) -> bool {
        let manifest_size = manifest.as_file().map(|m| m.size).unwrap_or(self.size);
        manifest_size != self.size || self.cmds.iter().any(Cmd::is_write)
    }

    /// Enter the sync-in-progress state. Flushes are refused while held.
    pub fn begin_sync(&mut self) -> Result<(), OpenedFileError> {
        if self.syncing {
            return Err(OpenedFileError::SyncInProgress);
        }
        self.syncing = true;
        Ok(())
    }

    pub fn end_sync(&mut self) {
        self.syncing = false;
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Append a write. An offset of `None` means "append at current size".
    /// A no-op on empty content, matching the original's early return.
    pub fn write(&mut self, content: Vec<u8>, offset: Option<u64>) {
        if content.is_empty() {
            return;
        }
        let offset = match offset {
            Some(o) if o <= self.size => o,
            _ => self.size,
        };
        let end = offset + content.len() as u64;
        self.cmds.push(Cmd::Write { offset, data: content, at: Utc::now() });
        if end > self.size {
            self.size = end;
        }
    }

    /// Shrink the file. Growing via truncate is not supported here — the
    /// FS facade fills the gap with explicit zero writes instead (§4.9).
    pub fn truncate(&mut self, length: u64) {
        if length < self.size {
            self.cmds.push(Cmd::Truncate { length });
            self.size = length;
        }
    }

    /// The `[start, end)` range not yet reflected in the manifest's
    /// committed blocks: covers every dirty block and every pending write.
    pub fn get_not_synced_bounds(&self, manifest: &LocalManifest) -> (u64, u64) {
        if self.is_placeholder() {
            return (0, self.size);
        }
        let file = manifest.as_file();
        let mut start = u64::MAX;
        let mut end = 0u64;
        let mut any = false;
        if let Some(file) = file {
            for dba in &file.dirty_blocks {
                any = true;
                start = start.min(dba.offset);
                end = end.max(dba.end());
            }
        }
        for cmd in &self.cmds {
            if let Cmd::Write { offset, .. } = cmd {
                any = true;
                start = start.min(*offset);
                end = end.max(cmd.write_end().unwrap_or(*offset));
            }
        }
        if !any {
            start = 0;
        }
        if let Some(file) = file {
            if let Some(last_block) = file.blocks.last() {
                let original_size = last_block.end();
                if original_size != self.size {
                    end = self.size;
                }
            }
        }
        if end > self.size {
            end = self.size;
        }
        (start, end)
    }

    fn quick_filtered_space(&self, manifest: &LocalManifest, start: u64, end: u64) -> UncontiguousSpace {
        let mut space = UncontiguousSpace::new();
        if let Some(file) = manifest.as_file() {
            for b in &file.blocks {
                if let Ok(slice) = BufferSlice::new(b.offset, b.end(), 0, Payload::CleanBlock(b.clone())) {
                    space.push(slice);
                }
            }
            for b in &file.dirty_blocks {
                if let Ok(slice) = BufferSlice::new(b.offset, b.end(), 1, Payload::DirtyBlock(b.clone())) {
                    space.push(slice);
                }
            }
        }
        for (i, cmd) in self.cmds.iter().enumerate() {
            if let Cmd::Write { offset, data, .. } = cmd {
                if let Ok(slice) = BufferSlice::new(*offset, offset + data.len() as u64, 2 + i as u64, Payload::Ram(data.clone())) {
                    space.push(slice);
                }
            }
        }
        quick_filter(&space, start, end)
    }

    /// Compose the readable view of `[offset, offset + size)`, clamped to
    /// the file's current size.
    pub fn get_read_map(&self, manifest: &LocalManifest, size: i64, offset: u64) -> Result<ContiguousSpace, crate::error::BufferError> {
        if offset >= self.size {
            return Ok(ContiguousSpace::default());
        }
        let size = if size < 0 { self.size } else { size as u64 };
        let size = if offset + size > self.size { self.size - offset } else { size };
        let space = self.quick_filtered_space(manifest, offset, offset + size);
        let limits = MergeLimits { max_slices: usize::MAX, max_total_size: u64::MAX };
        crate::buffer::merge_buffers_with_limits(&space, offset, offset + size, limits)
    }

    /// Compose the block-aligned view the syncer uploads from: the
    /// not-synced bounds, rounded out to `block_size`.
    pub fn get_sync_map(&self, manifest: &LocalManifest) -> Result<ContiguousSpace, crate::error::BufferError> {
        let (start, mut end) = self.get_not_synced_bounds(manifest);
        let aligned_start = start - start % self.block_size;
        if end % self.block_size != 0 {
            let aligned_end = end + self.block_size - (end % self.block_size);
            end = if aligned_end < self.size { aligned_end } else { self.size };
        }
        let space = self.quick_filtered_space(manifest, 0, self.size);
        crate::buffer::merge_buffers_with_limits_and_alignment(
            &space,
            aligned_start,
            end,
            MergeLimits { max_slices: usize::MAX, max_total_size: u64::MAX },
            self.block_size,
        )
    }

    /// Drop a fence into the command log. At most one live marker per
    /// file (§4.4); the syncer drains every command before the marker and
    /// removes it before releasing the entry lock.
    pub fn create_marker(&mut self) -> Result<usize, OpenedFileError> {
        if self.cmds.iter().any(Cmd::is_marker) {
            return Err(OpenedFileError::MarkerAlreadySet);
        }
        self.cmds.push(Cmd::marker(self.size));
        Ok(self.cmds.len() - 1)
    }

    /// Drop every command up to and including the marker at `marker_index`.
    pub fn drop_until_marker(&mut self, marker_index: usize) -> Result<(), OpenedFileError> {
        if marker_index >= self.cmds.len() || !self.cmds[marker_index].is_marker() {
            return Err(OpenedFileError::MarkerNotFound);
        }
        self.cmds.drain(0..=marker_index);
        debug_assert!(!self.cmds.iter().any(Cmd::is_marker), "concurrent marker despite entry lock");
        Ok(())
    }

    /// Materialize pending in-RAM writes into a list of `(offset, bytes)`
    /// buffers ready to become dirty blocks. A `Cmd::Truncate` clips or
    /// elides every write collected before it to its new length, and the
    /// result is never allowed to exceed the file's current `size`, so a
    /// write fully shadowed by a later truncate produces no buffer at all
    /// (§4.4).
    pub fn get_flush_map(&self) -> (u64, Vec<(u64, Vec<u8>)>) {
        let mut space = UncontiguousSpace::new();
        for (i, cmd) in self.cmds.iter().enumerate() {
            match cmd {
                Cmd::Write { offset, data, .. } => {
                    if let Ok(slice) = BufferSlice::new(*offset, offset + data.len() as u64, i as u64, Payload::Ram(data.clone())) {
                        space.push(slice);
                    }
                }
                Cmd::Truncate { length } => {
                    space.slices = space.slices.iter().filter_map(|s| s.clip(0, *length)).collect();
                }
                Cmd::Marker { .. } => {}
            }
        }
        if space.slices.is_empty() {
            return (self.size, Vec::new());
        }
        let lo = space.slices.iter().map(|s| s.start).min().unwrap_or(0);
        let hi = space.slices.iter().map(|s| s.end).max().unwrap_or(0).min(self.size);
        if lo >= hi {
            return (self.size, Vec::new());
        }
        let merged = merge_buffers(&space, lo, hi).unwrap_or_default();
        let mut buffers = Vec::new();
        for slice in merged.slices {
            if let Payload::Ram(data) = slice.payload {
                buffers.push((slice.start, data));
            }
        }
        (self.size, buffers)
    }
}

/// The live table of open files, keyed by entry id. An id never changes
/// across an ordinary publish (a placeholder and its published form share
/// the same id); only a conflict fork (`move_modifications`) re-keys an
/// open file to a different access.
#[derive(Default)]
pub struct OpenedFilesTable {
    opened: HashMap<EntryId, Arc<Mutex<OpenedFile>>>,
}

impl OpenedFilesTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_opened(&self, id: EntryId) -> bool {
        self.opened.contains_key(&id)
    }

    /// Fetch the handle for `id`, if open. Used by the FS facade (C9) to
    /// route `read`/`write`/`truncate`/`flush` to the right in-memory state.
    pub fn get(&self, id: EntryId) -> Option<Arc<Mutex<OpenedFile>>> {
        self.opened.get(&id).cloned()
    }

    /// Open `access`, returning the existing handle if already open.
    pub fn open_file(&mut self, access: Access, manifest: &LocalManifest) -> Arc<Mutex<OpenedFile>> {
        if let Some(existing) = self.opened.get(&access.id) {
            return existing.clone();
        }
        let size = manifest.as_file().map(|m| m.size).unwrap_or(0);
        let handle = Arc::new(Mutex::new(OpenedFile::new(access.clone(), size, manifest.base_version())));
        self.opened.insert(access.id, handle.clone());
        handle
    }

    /// Close `id`, returning the handle so the caller can flush anything
    /// outstanding before it's dropped.
    pub fn close_file(&mut self, id: EntryId) -> Option<Arc<Mutex<OpenedFile>>> {
        self.opened.remove(&id)
    }

    /// Move an open file's modifications to a new access without going
    /// through placeholder resolution (e.g. a conflict fork, §4.8).
    pub fn move_modifications(&mut self, old_id: EntryId, new_access: Access) {
        let Some(handle) = self.opened.remove(&old_id) else {
            return;
        };
        self.opened.insert(new_access.id, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsec_sync_types::{DeviceId, FileManifest};

    fn placeholder_manifest() -> LocalManifest {
        LocalManifest::File(FileManifest::new_placeholder(DeviceId::new("alice", "laptop")))
    }

    #[test]
    fn write_extends_size() {
        let mut f = OpenedFile::new(Access::new_placeholder(), 0, 0);
        f.write(b"hello".to_vec(), None);
        assert_eq!(f.size, 5);
        f.write(b"!!".to_vec(), Some(5));
        assert_eq!(f.size, 7);
    }

    #[test]
    fn write_past_size_clamps_to_append() {
        let mut f = OpenedFile::new(Access::new_placeholder(), 3, 0);
        f.write(b"xx".to_vec(), Some(100));
        assert_eq!(f.size, 5);
    }

    #[test]
    fn truncate_shrinks_and_logs() {
        let mut f = OpenedFile::new(Access::new_placeholder(), 10, 0);
        f.truncate(4);
        assert_eq!(f.size, 4);
        f.truncate(20);
        assert_eq!(f.size, 4, "growing via truncate is not supported");
    }

    #[test]
    fn marker_can_only_be_set_once() {
        let mut f = OpenedFile::new(Access::new_placeholder(), 0, 0);
        f.create_marker().unwrap();
        assert!(f.create_marker().is_err());
    }

    #[test]
    fn drop_until_marker_removes_prefix() {
        let mut f = OpenedFile::new(Access::new_placeholder(), 0, 0);
        f.write(b"a".to_vec(), None);
        let marker = f.create_marker().unwrap();
        f.write(b"b".to_vec(), None);
        f.drop_until_marker(marker).unwrap();
        assert_eq!(f.cmds.len(), 1);
        assert!(f.cmds[0].is_write());
    }

    #[test]
    fn flush_map_materializes_writes() {
        let mut f = OpenedFile::new(Access::new_placeholder(), 0, 0);
        f.write(b"hello".to_vec(), None);
        let (size, buffers) = f.get_flush_map();
        assert_eq!(size, 5);
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0], (0, b"hello".to_vec()));
    }

    #[test]
    fn flush_map_clips_writes_above_a_later_truncate() {
        let mut f = OpenedFile::new(Access::new_placeholder(), 0, 0);
        f.write(b"abcdef".to_vec(), Some(0));
        f.truncate(3);
        let (size, buffers) = f.get_flush_map();
        assert_eq!(size, 3);
        assert_eq!(buffers, vec![(0, b"abc".to_vec())]);
    }

    #[test]
    fn flush_map_elides_write_entirely_above_truncate() {
        let mut f = OpenedFile::new(Access::new_placeholder(), 0, 0);
        f.write(b"hello".to_vec(), Some(0));
        f.write(b"world".to_vec(), Some(10));
        f.truncate(5);
        let (size, buffers) = f.get_flush_map();
        assert_eq!(size, 5);
        assert_eq!(buffers, vec![(0, b"hello".to_vec())]);
    }

    #[test]
    fn placeholder_always_needs_sync() {
        let f = OpenedFile::new(Access::new_placeholder(), 0, 0);
        assert!(f.need_sync(&placeholder_manifest()));
    }

    #[tokio::test]
    async fn open_then_close_round_trips() {
        let mut table = OpenedFilesTable::new();
        let access = Access::new_placeholder();
        let manifest = placeholder_manifest();
        let handle = table.open_file(access.clone(), &manifest);
        assert!(table.is_opened(access.id));
        drop(handle);
        assert!(table.close_file(access.id).is_some());
        assert!(!table.is_opened(access.id));
    }

    #[tokio::test]
    async fn move_modifications_rekeys_lookup() {
        let mut table = OpenedFilesTable::new();
        let old = Access::new_placeholder();
        let manifest = placeholder_manifest();
        table.open_file(old.clone(), &manifest);
        let forked = Access::new_placeholder();
        table.move_modifications(old.id, forked.clone());
        assert!(!table.is_opened(old.id));
        assert!(table.is_opened(forked.id));
    }
}
