//
// Copyright (c) 2025 TRUSTEDGE LABS LLC
// This source code is subject to the terms of the Mozilla Public License, v. 2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Project: trustedge — Privacy and trust at the edge.
//

//! C1 — Crypto envelope: sign/verify and encrypt/decrypt manifests,
//! certificates and blocks (§4.1).
//!
//! Every persisted or transmitted manifest/block is
//! `encrypt(entry.key, sign(device.signing_key, serialize(value)))`.
//! Decoding always verifies the signature before the caller sees the
//! payload.

use crate::error::CryptoError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parsec_sync_types::DeviceId;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::Zeroize;

/// A device's Ed25519 keypair. The secret is zeroized on drop.
pub struct DeviceKeypair {
    verifying_key: VerifyingKey,
    secret: [u8; 32],
}

impl Drop for DeviceKeypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl DeviceKeypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            verifying_key: signing_key.verifying_key(),
            secret: signing_key.to_bytes(),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret)
    }
}

/// A detached, authenticated envelope around a serialized payload. The
/// header `(signer, timestamp)` is covered by the signature, so forging a
/// different signer or backdating the timestamp invalidates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signed {
    pub signer: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
    pub signature: [u8; 64],
}

fn canonical_bytes(signer: &DeviceId, timestamp: &DateTime<Utc>, payload: &[u8]) -> Vec<u8> {
    bincode::serialize(&(signer, timestamp, payload)).expect("tuple serialization cannot fail")
}

/// Produce a detached authenticated envelope whose header carries
/// `(signer_device_id, timestamp)`.
pub fn sign(
    signing_key: &DeviceKeypair,
    signer: DeviceId,
    timestamp: DateTime<Utc>,
    payload: Vec<u8>,
) -> Signed {
    let bytes = canonical_bytes(&signer, &timestamp, &payload);
    let signature = signing_key.signing_key().sign(&bytes);
    Signed {
        signer,
        timestamp,
        payload,
        signature: signature.to_bytes(),
    }
}

/// Verify the envelope's signature and header against expectations.
/// Returns the payload on success.
pub fn verify(
    signed: &Signed,
    expected_signer: &DeviceId,
    verify_key: &VerifyingKey,
    expected_timestamp: Option<DateTime<Utc>>,
) -> Result<Vec<u8>, CryptoError> {
    if &signed.signer != expected_signer {
        return Err(CryptoError::AuthorMismatch);
    }
    if let Some(expected) = expected_timestamp {
        if signed.timestamp != expected {
            return Err(CryptoError::TimestampMismatch);
        }
    }
    let bytes = canonical_bytes(&signed.signer, &signed.timestamp, &signed.payload);
    let signature = Signature::from_bytes(&signed.signature);
    verify_key
        .verify(&bytes, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)?;
    Ok(signed.payload.clone())
}

/// Return the header without verifying the signature. Used only to look up
/// the verification key for the signer before calling `verify`.
pub fn unsecure_extract_meta(signed: &Signed) -> (DeviceId, DateTime<Utc>) {
    (signed.signer.clone(), signed.timestamp)
}

/// Return the header and payload without verifying the signature.
pub fn unsecure_extract_meta_and_data(signed: &Signed) -> (DeviceId, DateTime<Utc>, Vec<u8>) {
    (signed.signer.clone(), signed.timestamp, signed.payload.clone())
}

/// Tracks the last accepted timestamp per `(signer, entry)` so that a
/// verify observing a strictly earlier timestamp is rejected
/// (`TimestampRegression`, §4.1). Entry-scoped trackers are owned by the
/// local manifest store, one per entry id.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_accepted: HashMap<DeviceId, DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `timestamp` as accepted for `signer`, rejecting regressions.
    pub fn observe(&mut self, signer: &DeviceId, timestamp: DateTime<Utc>) -> Result<(), CryptoError> {
        if let Some(&last) = self.last_accepted.get(signer) {
            if timestamp <= last {
                return Err(CryptoError::TimestampRegression {
                    last: last.timestamp_millis(),
                    got: timestamp.timestamp_millis(),
                });
            }
        }
        self.last_accepted.insert(signer.clone(), timestamp);
        Ok(())
    }
}

/// Encrypt `payload` under `sym_key` using XChaCha20-Poly1305. The nonce is
/// generated at random and prefixed to the returned ciphertext.
pub fn encrypt(sym_key: &[u8; 32], payload: &[u8]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(sym_key));
    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, payload)
        .expect("XChaCha20Poly1305 encryption does not fail for in-memory buffers");
    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a buffer produced by [`encrypt`].
pub fn decrypt(sym_key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < 24 {
        return Err(CryptoError::DecryptionFailed);
    }
    let (nonce_bytes, body) = ciphertext.split_at(24);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(sym_key));
    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), body)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Digest used for `BlockRef.digest` (blake3 over plaintext block bytes).
pub fn digest(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn alice() -> DeviceId {
        DeviceId::new("alice", "laptop")
    }

    #[test]
    fn round_trip_sign_verify() {
        let keypair = DeviceKeypair::generate();
        let signer = alice();
        let now = Utc::now();
        let signed = sign(&keypair, signer.clone(), now, b"hello".to_vec());
        let payload = verify(&signed, &signer, &keypair.verifying_key(), Some(now)).unwrap();
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn verify_rejects_wrong_signer() {
        let keypair = DeviceKeypair::generate();
        let signed = sign(&keypair, alice(), Utc::now(), b"x".to_vec());
        let bob = DeviceId::new("bob", "phone");
        let err = verify(&signed, &bob, &keypair.verifying_key(), None).unwrap_err();
        assert_eq!(err, CryptoError::AuthorMismatch);
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let keypair = DeviceKeypair::generate();
        let mut signed = sign(&keypair, alice(), Utc::now(), b"x".to_vec());
        signed.payload = b"y".to_vec();
        let err = verify(&signed, &alice(), &keypair.verifying_key(), None).unwrap_err();
        assert_eq!(err, CryptoError::SignatureInvalid);
    }

    #[test]
    fn round_trip_encrypt_decrypt() {
        let key = [7u8; 32];
        let ciphertext = encrypt(&key, b"secret manifest bytes");
        let plaintext = decrypt(&key, &ciphertext).unwrap();
        assert_eq!(plaintext, b"secret manifest bytes");
    }

    #[test]
    fn decrypt_fails_with_wrong_key() {
        let ciphertext = encrypt(&[1u8; 32], b"secret");
        assert!(decrypt(&[2u8; 32], &ciphertext).is_err());
    }

    #[test]
    fn monotonic_clock_rejects_regression() {
        let mut clock = MonotonicClock::new();
        let signer = alice();
        let t0 = Utc::now();
        clock.observe(&signer, t0).unwrap();
        let t_earlier = t0 - Duration::seconds(1);
        let err = clock.observe(&signer, t_earlier).unwrap_err();
        assert!(matches!(err, CryptoError::TimestampRegression { .. }));
    }

    #[test]
    fn monotonic_clock_rejects_equal_timestamp() {
        let mut clock = MonotonicClock::new();
        let signer = alice();
        let t0 = Utc::now();
        clock.observe(&signer, t0).unwrap();
        assert!(clock.observe(&signer, t0).is_err());
    }

    #[test]
    fn unsecure_extract_does_not_verify() {
        let keypair = DeviceKeypair::generate();
        let mut signed = sign(&keypair, alice(), Utc::now(), b"x".to_vec());
        signed.payload = b"tampered".to_vec();
        let (signer, _ts, data) = unsecure_extract_meta_and_data(&signed);
        assert_eq!(signer, alice());
        assert_eq!(data, b"tampered");
    }
}
