//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

use crate::access::Access;
use crate::ids::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A reference to an immutable, encrypted block (§3). `digest` is the
/// plaintext hash (blake3), checked after decryption so a corrupted
/// ciphertext never masquerades as valid content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub access: Access,
    pub offset: u64,
    pub size: u32,
    pub digest: [u8; 32],
}

impl BlockRef {
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }
}

/// Tag discriminating the four manifest variants (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    File,
    Folder,
    Workspace,
    User,
}

/// The file manifest, local form. `dirty_blocks` and `need_sync` only make
/// sense locally — the remote form (`RemoteManifest`) never carries them
/// (invariant 4: `need_sync == false` implies `dirty_blocks == []`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub base_version: u32,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Non-overlapping, offset-sorted, contiguous from 0, covering exactly
    /// `size` bytes except for the tail (invariant 1).
    pub blocks: Vec<BlockRef>,
    /// May overlap `blocks` and each other; later entries win (invariant 2).
    pub dirty_blocks: Vec<BlockRef>,
    pub need_sync: bool,
    pub is_placeholder: bool,
    pub author: DeviceId,
}

impl FileManifest {
    /// A brand new, empty, unpublished file manifest (invariant 3:
    /// `base_version == 0 iff is_placeholder`).
    pub fn new_placeholder(author: DeviceId) -> Self {
        let now = Utc::now();
        Self {
            base_version: 0,
            size: 0,
            created: now,
            updated: now,
            blocks: Vec::new(),
            dirty_blocks: Vec::new(),
            need_sync: true,
            is_placeholder: true,
            author,
        }
    }

    /// Check the manifest's structural invariants. Used by tests and by
    /// the syncer before publishing.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.base_version == 0 && !self.is_placeholder {
            return Err("base_version == 0 but is_placeholder == false".into());
        }
        if self.base_version != 0 && self.is_placeholder {
            return Err("base_version != 0 but is_placeholder == true".into());
        }
        if !self.need_sync && !self.dirty_blocks.is_empty() {
            return Err("need_sync == false but dirty_blocks is non-empty".into());
        }
        let mut expected_offset = 0u64;
        for (i, b) in self.blocks.iter().enumerate() {
            if b.offset != expected_offset {
                return Err(format!(
                    "blocks not contiguous at index {i}: expected offset {expected_offset}, got {}",
                    b.offset
                ));
            }
            expected_offset = b.end();
        }
        if !self.blocks.is_empty() && expected_offset != self.size {
            return Err(format!(
                "blocks cover {expected_offset} bytes but size is {}",
                self.size
            ));
        }
        Ok(())
    }
}

/// Folder/workspace/user manifests share the same shape: a name→access
/// mapping plus sync bookkeeping (§3). Workspace and user manifests are
/// folder manifests at the root of their respective trees; the engine does
/// not distinguish them structurally, only by where they sit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderManifest {
    pub base_version: u32,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub children: BTreeMap<String, Access>,
    pub need_sync: bool,
    pub is_placeholder: bool,
    pub author: DeviceId,
}

impl FolderManifest {
    pub fn new_placeholder(author: DeviceId) -> Self {
        let now = Utc::now();
        Self {
            base_version: 0,
            created: now,
            updated: now,
            children: BTreeMap::new(),
            need_sync: true,
            is_placeholder: true,
            author,
        }
    }
}

/// A manifest as the opened-file/manifest-store layer sees it: tagged by
/// kind so callers can match without downcasting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LocalManifest {
    File(FileManifest),
    Folder(FolderManifest),
    Workspace(FolderManifest),
    User(FolderManifest),
}

impl LocalManifest {
    pub fn kind(&self) -> ManifestKind {
        match self {
            LocalManifest::File(_) => ManifestKind::File,
            LocalManifest::Folder(_) => ManifestKind::Folder,
            LocalManifest::Workspace(_) => ManifestKind::Workspace,
            LocalManifest::User(_) => ManifestKind::User,
        }
    }

    pub fn need_sync(&self) -> bool {
        match self {
            LocalManifest::File(m) => m.need_sync,
            LocalManifest::Folder(m) | LocalManifest::Workspace(m) | LocalManifest::User(m) => {
                m.need_sync
            }
        }
    }

    pub fn is_placeholder(&self) -> bool {
        match self {
            LocalManifest::File(m) => m.is_placeholder,
            LocalManifest::Folder(m) | LocalManifest::Workspace(m) | LocalManifest::User(m) => {
                m.is_placeholder
            }
        }
    }

    pub fn base_version(&self) -> u32 {
        match self {
            LocalManifest::File(m) => m.base_version,
            LocalManifest::Folder(m) | LocalManifest::Workspace(m) | LocalManifest::User(m) => {
                m.base_version
            }
        }
    }

    pub fn as_file(&self) -> Option<&FileManifest> {
        match self {
            LocalManifest::File(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileManifest> {
        match self {
            LocalManifest::File(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_folder(&self) -> Option<&FolderManifest> {
        match self {
            LocalManifest::Folder(m) | LocalManifest::Workspace(m) | LocalManifest::User(m) => {
                Some(m)
            }
            _ => None,
        }
    }

    pub fn as_folder_mut(&mut self) -> Option<&mut FolderManifest> {
        match self {
            LocalManifest::Folder(m) | LocalManifest::Workspace(m) | LocalManifest::User(m) => {
                Some(m)
            }
            _ => None,
        }
    }
}

/// The wire form of a manifest, as it is signed and published. Never
/// carries `dirty_blocks`, `need_sync` or `is_placeholder` — those are
/// purely local bookkeeping (§3, §4.7 step UPLOAD META).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteManifest {
    File {
        version: u32,
        size: u64,
        created: DateTime<Utc>,
        updated: DateTime<Utc>,
        blocks: Vec<BlockRef>,
        author: DeviceId,
    },
    Folder {
        version: u32,
        created: DateTime<Utc>,
        updated: DateTime<Utc>,
        children: BTreeMap<String, Access>,
        author: DeviceId,
    },
}

impl RemoteManifest {
    pub fn version(&self) -> u32 {
        match self {
            RemoteManifest::File { version, .. } => *version,
            RemoteManifest::Folder { version, .. } => *version,
        }
    }
}

/// Convert a just-confirmed remote manifest back into local form: clears
/// `dirty_blocks`, `need_sync` and `is_placeholder` (§4.7 step COMMIT).
pub fn remote_to_local(remote: RemoteManifest, kind: ManifestKind) -> LocalManifest {
    match remote {
        RemoteManifest::File {
            version,
            size,
            created,
            updated,
            blocks,
            author,
        } => LocalManifest::File(FileManifest {
            base_version: version,
            size,
            created,
            updated,
            blocks,
            dirty_blocks: Vec::new(),
            need_sync: false,
            is_placeholder: false,
            author,
        }),
        RemoteManifest::Folder {
            version,
            created,
            updated,
            children,
            author,
        } => {
            let folder = FolderManifest {
                base_version: version,
                created,
                updated,
                children,
                need_sync: false,
                is_placeholder: false,
                author,
            };
            match kind {
                ManifestKind::Workspace => LocalManifest::Workspace(folder),
                ManifestKind::User => LocalManifest::User(folder),
                _ => LocalManifest::Folder(folder),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> DeviceId {
        DeviceId::new("alice", "laptop")
    }

    #[test]
    fn new_placeholder_satisfies_invariants() {
        let m = FileManifest::new_placeholder(author());
        assert!(m.check_invariants().is_ok());
        assert_eq!(m.base_version, 0);
        assert!(m.is_placeholder);
    }

    #[test]
    fn empty_blocks_with_nonzero_size_violates_invariant() {
        let mut m = FileManifest::new_placeholder(author());
        m.size = 10;
        assert!(m.check_invariants().is_err());
    }

    #[test]
    fn remote_round_trip_clears_local_only_fields() {
        let remote = RemoteManifest::File {
            version: 1,
            size: 0,
            created: Utc::now(),
            updated: Utc::now(),
            blocks: Vec::new(),
            author: author(),
        };
        let local = remote_to_local(remote, ManifestKind::File);
        assert!(!local.need_sync());
        assert!(!local.is_placeholder());
        assert_eq!(local.base_version(), 1);
    }
}
