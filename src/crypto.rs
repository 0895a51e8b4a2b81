// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Key material and symmetric/asymmetric envelopes.
//!
//! ## Key hierarchy
//!
//! ```text
//! tenant master key (32 bytes, keys/master.key)
//!   └── drive storage key (per drive, stored wrapped by the master key)
//!         └── file key header (per file, stored wrapped by the storage key)
//! ```
//!
//! A key header is re-wrapped under a caller's shared secret before it is
//! handed to a client, and under a recipient's public key (ECDH on
//! secp256k1 + HMAC-SHA256) before it leaves the host in a transfer
//! instruction set.
//!
//! All key types zeroize their memory on drop. Symmetric encryption is
//! AES-256-GCM (`ring::aead`) with a random 96-bit nonce per message.

use std::fmt;

use hmac::{Hmac, Mac};
use k256::{ecdh, PublicKey, SecretKey};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

/// Label mixed into the transfer-key derivation.
const TRANSFER_KEY_LABEL: &[u8] = b"drive-host/transfer-key/v1";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("random number generation failed")]
    Rng,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or tampered data)")]
    Decrypt,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Fill a fixed-size buffer from the system CSPRNG.
pub fn random_bytes<const N: usize>() -> CryptoResult<[u8; N]> {
    let mut buf = [0u8; N];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| CryptoError::Rng)?;
    Ok(buf)
}

// =============================================================================
// Symmetric keys
// =============================================================================

/// 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

impl SymmetricKey {
    pub fn generate() -> CryptoResult<Self> {
        Ok(Self(random_bytes::<32>()?))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn aead_key(&self) -> CryptoResult<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.0)
            .map_err(|_| CryptoError::InvalidKey("AES-256-GCM key rejected".to_string()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypt `plaintext` under this key with a fresh nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<EncryptedBlob> {
        let key = self.aead_key()?;
        let nonce_bytes = random_bytes::<NONCE_LEN>()?;
        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encrypt)?;
        Ok(EncryptedBlob {
            nonce: nonce_bytes.to_vec(),
            ciphertext: in_out,
        })
    }

    /// Decrypt a blob produced by [`SymmetricKey::encrypt`].
    pub fn decrypt(&self, blob: &EncryptedBlob) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let key = self.aead_key()?;
        let nonce_bytes: [u8; NONCE_LEN] = blob
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Decrypt)?;
        let mut in_out = Zeroizing::new(blob.ciphertext.clone());
        let plain_len = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                in_out.as_mut_slice(),
            )
            .map_err(|_| CryptoError::Decrypt)?
            .len();
        in_out.truncate(plain_len);
        Ok(in_out)
    }

    /// Wrap another symmetric key (e.g. a drive storage key under the
    /// master key).
    pub fn wrap(&self, key: &SymmetricKey) -> CryptoResult<EncryptedBlob> {
        self.encrypt(key.as_bytes())
    }

    pub fn unwrap_key(&self, blob: &EncryptedBlob) -> CryptoResult<SymmetricKey> {
        let plain = self.decrypt(blob)?;
        SymmetricKey::from_slice(&plain)
    }
}

/// AES-GCM output: nonce plus ciphertext with appended tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

// =============================================================================
// File key headers
// =============================================================================

/// Per-file key material used by clients to encrypt payloads.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyHeader {
    pub iv: [u8; 16],
    pub aes_key: SymmetricKey,
}

impl fmt::Debug for KeyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHeader")
            .field("iv", &hex::encode(self.iv))
            .field("aes_key", &self.aes_key)
            .finish()
    }
}

impl KeyHeader {
    pub fn new_random() -> CryptoResult<Self> {
        Ok(Self {
            iv: random_bytes::<16>()?,
            aes_key: SymmetricKey::generate()?,
        })
    }

    /// The all-zero header used by files whose content is not encrypted.
    pub fn empty() -> Self {
        Self {
            iv: [0u8; 16],
            aes_key: SymmetricKey::from_bytes([0u8; 32]),
        }
    }

    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(48));
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(self.aes_key.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != 48 {
            return Err(CryptoError::InvalidKey(format!(
                "key header must be 48 bytes, got {}",
                bytes.len()
            )));
        }
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&bytes[..16]);
        Ok(Self {
            iv,
            aes_key: SymmetricKey::from_slice(&bytes[16..])?,
        })
    }

    /// Wrap this header under a symmetric key (storage key or shared secret).
    pub fn encrypt(&self, key: &SymmetricKey) -> CryptoResult<EncryptedKeyHeader> {
        Ok(EncryptedKeyHeader {
            encryption_version: 1,
            iv: self.iv,
            encrypted_aes_key: key.encrypt(self.aes_key.as_bytes())?,
        })
    }
}

/// A [`KeyHeader`] whose AES key is wrapped by some symmetric key. The IV
/// travels in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKeyHeader {
    pub encryption_version: u32,
    #[serde(with = "hex_array16")]
    pub iv: [u8; 16],
    pub encrypted_aes_key: EncryptedBlob,
}

impl EncryptedKeyHeader {
    /// Placeholder handed to callers that hold no shared secret.
    pub fn empty() -> Self {
        Self {
            encryption_version: 0,
            iv: [0u8; 16],
            encrypted_aes_key: EncryptedBlob {
                nonce: Vec::new(),
                ciphertext: Vec::new(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.encryption_version == 0 && self.encrypted_aes_key.ciphertext.is_empty()
    }

    pub fn decrypt(&self, key: &SymmetricKey) -> CryptoResult<KeyHeader> {
        Ok(KeyHeader {
            iv: self.iv,
            aes_key: key.unwrap_key(&self.encrypted_aes_key)?,
        })
    }
}

// =============================================================================
// Transfer envelopes (recipient public key)
// =============================================================================

/// A key header sealed to a recipient host's offline public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferKeyEnvelope {
    /// CRC32 of the recipient public key used, so the recipient can pick
    /// the matching private key.
    pub public_key_crc: u32,
    #[serde(with = "hex_bytes")]
    pub ephemeral_public_key: Vec<u8>,
    pub sealed: EncryptedBlob,
}

/// CRC32 identifying a SEC1-encoded public key.
pub fn public_key_crc(public_key: &PublicKey) -> u32 {
    crc32fast::hash(&public_key.to_sec1_bytes())
}

fn random_secret_key() -> CryptoResult<SecretKey> {
    // A random 32-byte string is a valid scalar with overwhelming
    // probability; retry on the rare rejection.
    for _ in 0..8 {
        let bytes = Zeroizing::new(random_bytes::<32>()?);
        if let Ok(secret) = SecretKey::from_slice(bytes.as_slice()) {
            return Ok(secret);
        }
    }
    Err(CryptoError::Rng)
}

pub fn generate_secret_key() -> CryptoResult<SecretKey> {
    random_secret_key()
}

fn derive_transfer_key(
    shared: &[u8],
    ephemeral_public: &[u8],
    recipient_public: &[u8],
) -> CryptoResult<SymmetricKey> {
    let mut mac = HmacSha256::new_from_slice(shared)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(TRANSFER_KEY_LABEL);
    mac.update(ephemeral_public);
    mac.update(recipient_public);
    let out = mac.finalize().into_bytes();
    SymmetricKey::from_slice(out.as_slice())
}

impl KeyHeader {
    /// Seal this header to a recipient's public key.
    pub fn seal_for_recipient(&self, recipient: &PublicKey) -> CryptoResult<TransferKeyEnvelope> {
        let ephemeral = random_secret_key()?;
        let ephemeral_public = ephemeral.public_key().to_sec1_bytes();
        let recipient_bytes = recipient.to_sec1_bytes();

        let shared = ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
        let key = derive_transfer_key(
            shared.raw_secret_bytes().as_slice(),
            &ephemeral_public,
            &recipient_bytes,
        )?;

        Ok(TransferKeyEnvelope {
            public_key_crc: crc32fast::hash(&recipient_bytes),
            ephemeral_public_key: ephemeral_public.to_vec(),
            sealed: key.encrypt(&self.to_bytes())?,
        })
    }
}

impl TransferKeyEnvelope {
    /// Open the envelope with the recipient's secret key.
    pub fn open(&self, secret: &SecretKey) -> CryptoResult<KeyHeader> {
        let recipient_public = secret.public_key();
        if public_key_crc(&recipient_public) != self.public_key_crc {
            return Err(CryptoError::InvalidKey(format!(
                "envelope sealed for public key crc {}",
                self.public_key_crc
            )));
        }
        let ephemeral = PublicKey::from_sec1_bytes(&self.ephemeral_public_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), ephemeral.as_affine());
        let key = derive_transfer_key(
            shared.raw_secret_bytes().as_slice(),
            &self.ephemeral_public_key,
            &recipient_public.to_sec1_bytes(),
        )?;
        let plain = key.decrypt(&self.sealed)?;
        KeyHeader::from_bytes(&plain)
    }
}

// =============================================================================
// Serde helpers
// =============================================================================

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod hex_array16 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(s).map_err(serde::de::Error::custom)?;
        v.as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}
