// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Drives
//!
//! A drive is a tenant-scoped, access-controlled file namespace with its
//! own storage key. This module holds the drive definition types plus the
//! services built on them:
//!
//! - `manager` - create/load/mutate drive definitions
//! - `cache` - in-memory drive definition cache
//! - `file` - file header model shared by storage, query and transit
//! - `events` - storage notifications
//! - `storage_service` - the file lifecycle orchestrator
//! - `file_system` - storage, query and command queue bundled per
//!   [`FileSystemType`]
//! - `commands` - command-message queue for incoming command files

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::EncryptedBlob;
use crate::error::{HostError, HostResult};
use crate::identity::{CallerContext, DrivePermission};

pub mod cache;
pub mod commands;
pub mod events;
pub mod file;
pub mod file_system;
pub mod manager;
pub mod storage_service;

pub use cache::DriveCache;
pub use commands::CommandMessageQueue;
pub use events::{DriveNotification, NotificationHub};
pub use file::*;
pub use file_system::{DriveFileSystem, FileSystemResolver};
pub use manager::DriveManager;
pub use storage_service::DriveStorageService;

/// Alias of the feed system drive.
pub const FEED_DRIVE_ALIAS: Uuid = Uuid::from_u128(0x4db49422_ebad_02e9_9ab9_6a7c5a7a3c5b);
/// Type shared by all feed drives.
pub const FEED_DRIVE_TYPE: Uuid = Uuid::from_u128(0x8f448716_e34c_edf9_0141_45e043ca6612);
/// Alias of the transient temp system drive.
pub const TRANSIENT_TEMP_DRIVE_ALIAS: Uuid = Uuid::from_u128(0x90f5e74a_b7f9_efda_0ac2_98373a32ad8c);
/// Type of the transient temp system drive.
pub const TRANSIENT_TEMP_DRIVE_TYPE: Uuid = Uuid::from_u128(0x90f5e74a_b7f9_efda_0ac2_98373a32ad8c);

/// Externally shared identity of a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetDrive {
    pub alias: Uuid,
    #[serde(rename = "type")]
    pub drive_type: Uuid,
}

impl TargetDrive {
    pub fn new(alias: Uuid, drive_type: Uuid) -> Self {
        Self { alias, drive_type }
    }

    pub fn feed_drive() -> Self {
        Self::new(FEED_DRIVE_ALIAS, FEED_DRIVE_TYPE)
    }

    pub fn transient_temp_drive() -> Self {
        Self::new(TRANSIENT_TEMP_DRIVE_ALIAS, TRANSIENT_TEMP_DRIVE_TYPE)
    }

    pub fn is_valid(&self) -> bool {
        !self.alias.is_nil() && !self.drive_type.is_nil()
    }
}

impl fmt::Display for TargetDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alias, self.drive_type)
    }
}

/// A drive definition as persisted under `drives/{id}/drive.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDrive {
    pub id: Uuid,
    pub target_drive: TargetDrive,
    pub name: String,
    #[serde(default)]
    pub metadata: String,
    /// Drive storage key wrapped by the tenant master key.
    pub master_key_encrypted_storage_key: EncryptedBlob,
    /// The drive id encrypted under the storage key; a key that decrypts
    /// this back to `id` is the right key.
    pub encrypted_id_value: EncryptedBlob,
    pub allow_anonymous_reads: bool,
    pub owner_only: bool,
    pub allow_subscriptions: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub is_system_drive: bool,
    pub created: i64,
}

impl StorageDrive {
    pub fn is_feed_drive(&self) -> bool {
        self.target_drive == TargetDrive::feed_drive()
    }

    pub fn is_transient_temp_drive(&self) -> bool {
        self.target_drive == TargetDrive::transient_temp_drive()
    }

    /// Owner, an explicit read grant, or anonymous reads on a drive that
    /// is not owner-only.
    pub fn caller_can_read(&self, caller: &CallerContext) -> bool {
        if caller.is_owner() && caller.master_key().is_some() {
            return true;
        }
        if self.owner_only {
            return false;
        }
        caller.has_drive_permission(&self.id, DrivePermission::READ) || self.allow_anonymous_reads
    }

    pub fn assert_caller_can_read(&self, caller: &CallerContext) -> HostResult<()> {
        if self.caller_can_read(caller) {
            Ok(())
        } else {
            tracing::warn!(caller = ?caller.odin_id, drive_id = %self.id, "Caller cannot read drive");
            Err(HostError::security(format!("no read access to drive {}", self.id)))
        }
    }
}

/// Request to create a drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDriveRequest {
    pub name: String,
    pub target_drive: TargetDrive,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub allow_anonymous_reads: bool,
    #[serde(default)]
    pub owner_only: bool,
    #[serde(default)]
    pub allow_subscriptions: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl CreateDriveRequest {
    pub fn new(name: impl Into<String>, target_drive: TargetDrive) -> Self {
        Self {
            name: name.into(),
            target_drive,
            metadata: String::new(),
            allow_anonymous_reads: false,
            owner_only: false,
            allow_subscriptions: false,
            attributes: BTreeMap::new(),
        }
    }
}

/// Paging for list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOptions {
    pub page_number: usize,
    pub page_size: usize,
}

impl PageOptions {
    pub const ALL: PageOptions = PageOptions {
        page_number: 1,
        page_size: usize::MAX,
    };

    pub fn new(page_number: usize, page_size: usize) -> Self {
        Self {
            page_number: page_number.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn skip(&self) -> usize {
        (self.page_number - 1).saturating_mul(self.page_size)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub results: Vec<T>,
    pub total: usize,
    pub page_number: usize,
}

impl<T> Page<T> {
    pub fn from_all(all: Vec<T>, options: PageOptions) -> Self {
        let total = all.len();
        let results = all
            .into_iter()
            .skip(options.skip())
            .take(options.page_size)
            .collect();
        Self {
            results,
            total,
            page_number: options.page_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_target_drives_are_distinct_and_valid() {
        assert!(TargetDrive::feed_drive().is_valid());
        assert!(TargetDrive::transient_temp_drive().is_valid());
        assert_ne!(TargetDrive::feed_drive(), TargetDrive::transient_temp_drive());
        assert!(!TargetDrive::new(Uuid::nil(), Uuid::new_v4()).is_valid());
    }

    #[test]
    fn target_drive_serializes_type_field() {
        let td = TargetDrive::new(Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_value(td).unwrap();
        assert!(json.get("type").is_some());
        assert!(json.get("alias").is_some());
    }

    fn drive(owner_only: bool, allow_anonymous_reads: bool) -> StorageDrive {
        let blob = EncryptedBlob {
            nonce: Vec::new(),
            ciphertext: Vec::new(),
        };
        StorageDrive {
            id: Uuid::new_v4(),
            target_drive: TargetDrive::new(Uuid::new_v4(), Uuid::new_v4()),
            name: "d".into(),
            metadata: String::new(),
            master_key_encrypted_storage_key: blob.clone(),
            encrypted_id_value: blob,
            allow_anonymous_reads,
            owner_only,
            allow_subscriptions: false,
            attributes: BTreeMap::new(),
            is_system_drive: false,
            created: 0,
        }
    }

    #[test]
    fn read_access_follows_drive_flags_and_grants() {
        use crate::crypto::SymmetricKey;
        use crate::identity::{DriveGrant, OdinId, SecurityGroup};

        let owner = CallerContext::owner(OdinId::new("frodo.dotyou.cloud"), SymmetricKey::from_bytes([1u8; 32]), None);
        let private = drive(true, false);
        assert!(private.caller_can_read(&owner));
        assert!(!private.caller_can_read(&CallerContext::anonymous()));

        let public = drive(false, true);
        assert!(public.caller_can_read(&CallerContext::anonymous()));

        let shared = drive(false, false);
        let peer = CallerContext::peer(OdinId::new("sam.dotyou.cloud"), SecurityGroup::Connected, vec![], None);
        assert!(matches!(shared.assert_caller_can_read(&peer), Err(HostError::Security(_))));
        let granted = peer.with_drive_grant(
            shared.id,
            DriveGrant {
                permission: DrivePermission::READ,
                storage_key: None,
            },
        );
        assert!(shared.caller_can_read(&granted));
        assert!(!private.caller_can_read(&granted.clone().with_drive_grant(
            private.id,
            DriveGrant {
                permission: DrivePermission::READ,
                storage_key: None,
            },
        )));
    }

    #[test]
    fn page_from_all_skips_and_takes() {
        let page = Page::from_all((1..=7).collect::<Vec<_>>(), PageOptions::new(2, 3));
        assert_eq!(page.results, vec![4, 5, 6]);
        assert_eq!(page.total, 7);

        let all = Page::from_all(vec![1, 2], PageOptions::ALL);
        assert_eq!(all.results, vec![1, 2]);
    }
}
