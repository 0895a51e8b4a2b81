// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Tenant key material on disk.
//!
//! - `keys/master.key`: 32 raw bytes, the root of the drive key hierarchy.
//! - `keys/offline.pem`: PKCS#8 PEM secp256k1 key. Remote hosts seal
//!   transfer key headers to its public key; the inbox opens them here.
//!
//! Both are created on first start and never leave the host.

use hmac::{Hmac, Mac};
use k256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use k256::{PublicKey, SecretKey};
use sha2::Sha256;

use crate::crypto::{
    generate_secret_key, public_key_crc, CryptoError, KeyHeader, SymmetricKey, TransferKeyEnvelope,
};
use crate::error::{HostError, HostResult};
use crate::storage::{StorageError, TenantStorage};

const OUTBOX_SEALING_LABEL: &[u8] = b"outbox-sealing";

/// Load the master key, creating it if absent.
pub fn load_or_create_master_key(storage: &TenantStorage) -> HostResult<SymmetricKey> {
    let path = storage.paths().master_key();
    match storage.read_raw(&path) {
        Ok(bytes) => Ok(SymmetricKey::from_slice(&bytes)?),
        Err(StorageError::NotFound(_)) => {
            let key = SymmetricKey::generate()?;
            storage.write_raw(&path, key.as_bytes())?;
            tracing::info!("Generated new tenant master key");
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse a PEM secp256k1 private key (PKCS#8, or SEC1 as a fallback).
pub fn secret_key_from_pem(pem_bytes: &[u8]) -> HostResult<SecretKey> {
    let pem_str = std::str::from_utf8(pem_bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid UTF-8: {e}")))?;
    let pem = pem::parse(pem_str).map_err(|e| CryptoError::InvalidKey(format!("invalid PEM: {e}")))?;
    let secret = SecretKey::from_pkcs8_der(pem.contents())
        .or_else(|_| SecretKey::from_sec1_der(pem.contents()))
        .map_err(|e| CryptoError::InvalidKey(format!("invalid key format: {e}")))?;
    Ok(secret)
}

/// The tenant's offline key pair.
#[derive(Clone)]
pub struct OfflineKeyService {
    secret: SecretKey,
}

impl OfflineKeyService {
    pub fn new(secret: SecretKey) -> Self {
        Self { secret }
    }

    /// Load `keys/offline.pem`, creating it if absent.
    pub fn load_or_create(storage: &TenantStorage) -> HostResult<Self> {
        let path = storage.paths().offline_key();
        match storage.read_raw(&path) {
            Ok(bytes) => Ok(Self::new(secret_key_from_pem(&bytes)?)),
            Err(StorageError::NotFound(_)) => {
                let secret = generate_secret_key()?;
                let pem = secret
                    .to_pkcs8_pem(LineEnding::LF)
                    .map_err(|e| CryptoError::InvalidKey(format!("failed to encode offline key: {e}")))?;
                storage.write_raw(&path, pem.as_bytes())?;
                tracing::info!("Generated new offline key pair");
                Ok(Self::new(secret))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn public_key_crc(&self) -> u32 {
        public_key_crc(&self.public_key())
    }

    /// Open a transfer envelope sealed to our public key.
    pub fn open_envelope(&self, envelope: &TransferKeyEnvelope) -> HostResult<KeyHeader> {
        if envelope.public_key_crc != self.public_key_crc() {
            return Err(HostError::security(format!(
                "transfer key sealed for unknown public key crc {}",
                envelope.public_key_crc
            )));
        }
        Ok(envelope.open(&self.secret)?)
    }

    /// Key used to seal outbox items at rest.
    pub fn outbox_sealing_key(&self) -> HostResult<SymmetricKey> {
        let secret_bytes = self.secret.to_bytes();
        let mut mac = <Hmac<Sha256>>::new_from_slice(secret_bytes.as_slice())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        mac.update(OUTBOX_SEALING_LABEL);
        Ok(SymmetricKey::from_slice(mac.finalize().into_bytes().as_slice())?)
    }
}
