//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! # Parsec Sync Core
//!
//! The client-side file synchronization engine for an end-to-end-encrypted
//! file-sharing workspace: the component that reconciles in-memory writes,
//! truncations and on-disk dirty blocks against immutable, versioned,
//! encrypted blobs in a remote vault, while serving concurrent read/write
//! requests from a filesystem front-end.
//!
//! ## Architecture
//!
//! Components, leaves first:
//!
//! - [`crypto`] (C1) — sign/verify and encrypt/decrypt manifests,
//!   certificates and blocks.
//! - [`buffer`] (C2) — interval arithmetic over heterogeneous buffers
//!   (in-RAM writes, local dirty blocks, remote clean blocks).
//! - [`manifest_store`] (C3) — the local key→manifest map.
//! - [`opened_file`] (C4) — per-open mutable overlay of pending
//!   writes/truncates.
//! - [`block_store`] (C5) — local content store for dirty and fetched
//!   clean blocks.
//! - [`backend`] (C6) — typed request/response over the vault protocol.
//! - [`syncer`] (C7) — the reconciliation engine.
//! - [`event_bus`] (C8) — internal pub/sub.
//! - [`fs_facade`] (C9) — `open/read/write/truncate/flush/close/mkdir/
//!   unlink/rename` request router.
//!
//! This crate owns none of: the FUSE/Dokan mount adapter, the backend wire
//! transport, the PostgreSQL-backed vault, or certificate chain-validation
//! policy — those are external collaborators this crate's traits and
//! in-memory mocks stand in for.

pub mod backend;
pub mod block_store;
pub mod buffer;
pub mod crypto;
pub mod error;
pub mod event_bus;
pub mod fs_facade;
pub mod manifest_store;
pub mod opened_file;
pub mod syncer;

pub use backend::{BackendClient, BeaconNotification, ChangedEntry, GroupCheckEntry, InMemoryBackendClient, VlobReadResponse};
pub use block_store::BlockStore;
pub use buffer::{merge_buffers, merge_buffers_with_limits, merge_buffers_with_limits_and_alignment, quick_filter, BufferSlice, ContiguousSpace, MergeLimits, Payload, UncontiguousSpace};
pub use crypto::{decrypt, digest, encrypt, sign, unsecure_extract_meta, unsecure_extract_meta_and_data, verify, DeviceKeypair, MonotonicClock, Signed};
pub use error::{
    BackendError, BlockStoreError, BufferError, CryptoError, EventBusError, FsError, ManifestStoreError,
    OpenedFileError, ParsecError, SyncError,
};
pub use event_bus::{Event, EventBus};
pub use fs_facade::{FsFacade, Stat};
pub use manifest_store::{Beacon, EntryPath, ManifestStore};
pub use opened_file::{OpenedFile, OpenedFilesTable, DEFAULT_BLOCK_SIZE};
pub use syncer::{Syncer, MAX_CONSECUTIVE_UNAVAILABLE};
