// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Recipients' offline public keys, used to seal transfer key headers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use k256::PublicKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::transport::OFFLINE_PUBLIC_KEY_PATH;
use crate::crypto::public_key_crc;
use crate::error::{HostError, HostResult};
use crate::identity::OdinId;

/// Wire form of an offline public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflinePublicKeyResponse {
    /// SEC1-encoded key, hex.
    pub public_key: String,
    pub crc32: u32,
}

impl OfflinePublicKeyResponse {
    pub fn from_key(key: &PublicKey) -> Self {
        Self {
            public_key: hex::encode(key.to_sec1_bytes()),
            crc32: public_key_crc(key),
        }
    }

    pub fn to_key(&self) -> HostResult<PublicKey> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|_| HostError::system("offline public key is not hex"))?;
        let key = PublicKey::from_sec1_bytes(&bytes)
            .map_err(|e| HostError::system(format!("invalid offline public key: {e}")))?;
        if public_key_crc(&key) != self.crc32 {
            return Err(HostError::system("offline public key crc mismatch"));
        }
        Ok(key)
    }
}

#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    /// The recipient's offline public key, or `None` when it cannot be
    /// resolved right now.
    async fn public_key(&self, odin_id: &OdinId) -> Option<PublicKey>;
}

#[derive(Default)]
pub struct InMemoryPublicKeyDirectory {
    keys: RwLock<HashMap<OdinId, PublicKey>>,
}

impl InMemoryPublicKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, odin_id: OdinId, key: PublicKey) {
        self.keys.write().await.insert(odin_id, key);
    }
}

#[async_trait]
impl PublicKeyDirectory for InMemoryPublicKeyDirectory {
    async fn public_key(&self, odin_id: &OdinId) -> Option<PublicKey> {
        self.keys.read().await.get(odin_id).copied()
    }
}

/// Fetches keys from the recipient's host and caches them.
pub struct PeerPublicKeyDirectory {
    client: reqwest::Client,
    scheme: String,
    cache: RwLock<HashMap<OdinId, PublicKey>>,
}

impl PeerPublicKeyDirectory {
    pub fn new(scheme: impl Into<String>, timeout: Duration) -> HostResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HostError::system(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            scheme: scheme.into(),
            cache: RwLock::new(HashMap::new()),
        })
    }

    async fn fetch(&self, odin_id: &OdinId) -> HostResult<PublicKey> {
        let url = format!("{}://{}{}", self.scheme, odin_id, OFFLINE_PUBLIC_KEY_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HostError::system(format!("public key request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(HostError::system(format!(
                "public key request returned {}",
                response.status()
            )));
        }
        let body: OfflinePublicKeyResponse = response
            .json()
            .await
            .map_err(|e| HostError::system(format!("invalid public key response: {e}")))?;
        body.to_key()
    }
}

#[async_trait]
impl PublicKeyDirectory for PeerPublicKeyDirectory {
    async fn public_key(&self, odin_id: &OdinId) -> Option<PublicKey> {
        if let Some(key) = self.cache.read().await.get(odin_id) {
            return Some(*key);
        }
        match self.fetch(odin_id).await {
            Ok(key) => {
                self.cache.write().await.insert(odin_id.clone(), key);
                Some(key)
            }
            Err(e) => {
                tracing::warn!(recipient = %odin_id, error = %e, "Could not resolve offline public key");
                None
            }
        }
    }
}
