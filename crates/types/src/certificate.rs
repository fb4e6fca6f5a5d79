//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Project: trustedge — Privacy and trust at the edge.
//

use crate::ids::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `(type, payload, signer, timestamp)` — envelope-signed, consumed
/// read-only by the syncer (§3). Trust-chain validation is out of scope
/// (§1); the engine only needs to know the payload shape to route events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub kind: CertificateKind,
    pub signer: DeviceId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CertificateKind {
    Device { device_id: DeviceId, verify_key: [u8; 32] },
    User { user_id: String, public_key: [u8; 32] },
    DeviceRevoked { device_id: DeviceId },
}
