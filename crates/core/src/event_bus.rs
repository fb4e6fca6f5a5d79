//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C8 — Event bus: topic-keyed internal pub/sub (§4.8).
//!
//! Subscribers run in the caller's scheduling context; the bus never
//! blocks waiting for a slow subscriber to drain — each topic is a
//! `tokio::sync::broadcast` channel, so a lagging receiver drops the
//! oldest events instead of stalling the publisher.

use chrono::{DateTime, Utc};
use parsec_sync_types::EntryId;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

/// Every event the core produces (§4.8 lists the full topic set; nothing
/// is consumed from outside).
#[derive(Debug, Clone)]
pub enum Event {
    EntrySynced { id: EntryId, at: DateTime<Utc> },
    EntryUpdated { id: EntryId },
    MountpointStarting { path: PathBuf },
    MountpointStarted { path: PathBuf },
    MountpointStopped { path: PathBuf },
    BackendOnline,
    BackendOffline,
    WorkspaceFailed { reason: String },
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A single process-wide event bus. Cloning is cheap (an `Arc` inside the
/// broadcast sender); every clone publishes to and can subscribe from the
/// same underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Never blocks: if there are no subscribers the
    /// event is simply dropped (`send` only fails when the receiver count
    /// is zero, which is not an error condition here).
    pub fn publish(&self, event: Event) {
        trace!(?event, "publishing event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event published from now on. Handlers must be
    /// non-blocking or enqueue onto their own channel (§4.8) — the bus
    /// does not enforce this, it only guarantees it will not wait on them.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
