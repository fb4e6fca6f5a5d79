//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! Unified error hierarchy for the Parsec sync engine.

use thiserror::Error;

/// Top-level unified error type for sync-engine operations.
#[derive(Error, Debug)]
pub enum ParsecError {
    #[error("Cryptographic operation failed")]
    Crypto(#[from] CryptoError),

    #[error("Buffer algebra error")]
    Buffer(#[from] BufferError),

    #[error("Local manifest store error")]
    ManifestStore(#[from] ManifestStoreError),

    #[error("Opened-file table error")]
    OpenedFile(#[from] OpenedFileError),

    #[error("Block store error")]
    BlockStore(#[from] BlockStoreError),

    #[error("Backend client error")]
    Backend(#[from] BackendError),

    #[error("Sync error")]
    Sync(#[from] SyncError),

    #[error("Event bus error")]
    EventBus(#[from] EventBusError),

    #[error("Filesystem facade error")]
    Fs(#[from] FsError),
}

/// Errors from C1 (crypto envelope). Per §7, `SignatureInvalid` is fatal
/// and must never leak a cryptographic detail to the user-facing surface —
/// callers surface it as `corrupted_data` (see `FsError::CorruptedData`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("signer does not match expected author")]
    AuthorMismatch,
    #[error("timestamp does not match expected value")]
    TimestampMismatch,
    #[error("timestamp {got} is not strictly greater than last accepted {last} for this signer")]
    TimestampRegression { last: i64, got: i64 },
    #[error("decryption failed, ciphertext or key is invalid")]
    DecryptionFailed,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Errors from C2 (buffer algebra). Offsets are unsigned 64-bit; overflow
/// is a precondition violation (§4.2), not a silent wrap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("offset arithmetic overflowed")]
    OffsetOverflow,
    #[error("invalid range [{lo}, {hi})")]
    InvalidRange { lo: u64, hi: u64 },
}

/// Errors from C3 (local manifest store).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestStoreError {
    #[error("no local manifest for this entry")]
    LocalDBMissingEntry,
    #[error("local database is corrupted")]
    LocalDBCorrupted,
}

/// Errors from C4 (opened-file table).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenedFileError {
    #[error("a marker is already set for this file")]
    MarkerAlreadySet,
    #[error("marker not found in command log (concurrent sync without lock?)")]
    MarkerNotFound,
    #[error("file is already open with a different base_version")]
    BaseVersionMismatch { expected: u32, found: u32 },
    #[error("attempted to flush while a sync is in progress")]
    SyncInProgress,
}

/// Errors from C5 (block store).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockStoreError {
    #[error("block not found locally or remotely")]
    NotFound,
    #[error("fetched block digest does not match BlockRef.digest")]
    DigestMismatch,
    #[error("fetched block's signer is not the manifest's declared author")]
    AuthorMismatch,
}

/// Errors from C6 (backend client), partitioned per §4.6.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("backend returned {status}: {body}")]
    BadResponse { status: String, body: String },
    #[error("trust seed mismatch")]
    TrustSeed,
    #[error("vlob version conflict: expected {expected}, backend has {actual}")]
    BadVersion { expected: u32, actual: u32 },
    #[error("vlob already exists")]
    AlreadyExists,
    #[error("vlob or block not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("realm is under maintenance")]
    InMaintenance,
}

/// Errors from C7 (syncer).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("backend error during sync")]
    Backend(#[from] BackendError),
    #[error("manifest store error during sync")]
    ManifestStore(#[from] ManifestStoreError),
    #[error("opened-file error during sync")]
    OpenedFile(#[from] OpenedFileError),
    #[error("crypto error during sync")]
    Crypto(#[from] CryptoError),
    #[error("buffer algebra error during sync")]
    Buffer(#[from] BufferError),
    #[error("entry is offline and dirty after {0} consecutive transient failures")]
    OfflineDirty(u32),
}

/// Errors from C8 (event bus).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("no subscribers for topic {0}")]
    NoSubscribers(String),
}

/// Errors surfaced at the FS facade (C9), per §7's "surface to caller" and
/// "fatal" groups. `SignatureInvalid` and friends are translated to
/// `CorruptedData` here so no cryptographic detail leaks to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("access denied")]
    AccessDenied,
    #[error("entry not found")]
    NotFound,
    #[error("data is corrupted")]
    CorruptedData,
    #[error("backend realm is under maintenance")]
    InMaintenance,
    #[error("mountpoint driver crashed: {0}")]
    MountpointDriverCrash(String),
    #[error("entry is not a directory")]
    NotADirectory,
    #[error("directory is not empty")]
    NotEmpty,
}

impl From<CryptoError> for FsError {
    fn from(_: CryptoError) -> Self {
        // Invariant (§7): no user-facing error leaks a cryptographic detail.
        FsError::CorruptedData
    }
}

impl From<BackendError> for FsError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::AccessDenied => FsError::AccessDenied,
            BackendError::NotFound => FsError::NotFound,
            BackendError::InMaintenance => FsError::InMaintenance,
            _ => FsError::AccessDenied,
        }
    }
}
