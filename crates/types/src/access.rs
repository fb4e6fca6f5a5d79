//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

use crate::ids::EntryId;
use serde::{Deserialize, Serialize};

/// The symmetric key guarding a single vault slot. Zeroized on drop, same
/// discipline as the device signing key in the crypto envelope.
#[derive(Clone, Serialize, Deserialize)]
pub struct SymKey(pub [u8; 32]);

impl SymKey {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SymKey").field(&"<redacted>").finish()
    }
}

impl Drop for SymKey {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.0.zeroize();
    }
}

/// An opaque trust-seed token (`rts`/`wts`). Authorizes read or write on a
/// specific vlob slot; mismatch is a hard, non-retryable failure (§6).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustSeed(pub Vec<u8>);

impl std::fmt::Debug for TrustSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TrustSeed").field(&"<redacted>").finish()
    }
}

impl TrustSeed {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// `(id, read_token, write_token, key)` — grants cryptographic and
/// authorization rights on a vault slot (§3). A placeholder access is one
/// whose `id` has never been published; this crate does not track that
/// state on `Access` itself, since it is a property of the manifest
/// (`base_version == 0 iff is_placeholder`, invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Access {
    pub id: EntryId,
    pub read_token: TrustSeed,
    pub write_token: TrustSeed,
    pub key: SymKey,
}

impl Access {
    /// Allocate a fresh access for a to-be-created entry. The returned
    /// access is a placeholder until the owning manifest is first
    /// published (see `FileManifest::is_placeholder`).
    pub fn new_placeholder() -> Self {
        Self {
            id: EntryId::new(),
            read_token: TrustSeed::generate(),
            write_token: TrustSeed::generate(),
            key: SymKey::generate(),
        }
    }
}

// `SymKey` zeroizes on drop but does not derive `Eq`; compare by raw bytes.
// Used only in tests to compare manifests structurally.
impl PartialEq for Access {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.read_token == other.read_token
            && self.write_token == other.write_token
            && self.key.0 == other.key.0
    }
}
impl Eq for Access {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_accesses_have_distinct_ids() {
        let a = Access::new_placeholder();
        let b = Access::new_placeholder();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        let a = Access::new_placeholder();
        let rendered = format!("{a:?}");
        assert!(rendered.contains("<redacted>"));
    }
}
