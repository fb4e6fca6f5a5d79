//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An opened file's append-only command log entry (§3). This is the sole
/// authoritative record of pending mutation between `open` and `close`.
/// Modeled as an exhaustive tagged sum, not an inheritance hierarchy
/// (design note in §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Cmd {
    Write {
        offset: u64,
        data: Vec<u8>,
        at: DateTime<Utc>,
    },
    Truncate {
        length: u64,
    },
    /// A fence dropped by the syncer before draining the flush map; at most
    /// one live marker per file (§4.4).
    Marker {
        file_size: u64,
        at: DateTime<Utc>,
    },
}

impl Cmd {
    pub fn write(offset: u64, data: Vec<u8>) -> Self {
        Cmd::Write {
            offset,
            data,
            at: Utc::now(),
        }
    }

    pub fn marker(file_size: u64) -> Self {
        Cmd::Marker {
            file_size,
            at: Utc::now(),
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self, Cmd::Marker { .. })
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Cmd::Write { .. })
    }

    /// End offset of a `Write`, meaningless for other variants.
    pub fn write_end(&self) -> Option<u64> {
        match self {
            Cmd::Write { offset, data, .. } => Some(offset + data.len() as u64),
            _ => None,
        }
    }
}
