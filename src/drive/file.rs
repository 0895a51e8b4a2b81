// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! File header model.
//!
//! A committed file is a [`ServerFileHeader`] (key header wrapped by the
//! drive storage key, client metadata, server metadata) plus payload and
//! thumbnail parts on disk. [`SharedSecretEncryptedFileHeader`] is the
//! projection handed to clients.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::EncryptedKeyHeader;
use crate::error::{ClientErrorCode, HostError, HostResult};
use crate::identity::{AccessControlList, OdinId, SecurityGroup};

use super::TargetDrive;

/// Current time as unix milliseconds.
pub fn unix_time_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Time-ordered identifier used for file ids, version tags and queue
/// markers.
pub fn sequential_id() -> Uuid {
    Uuid::now_v7()
}

/// Internal-only file address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalDriveFileId {
    pub drive_id: Uuid,
    pub file_id: Uuid,
}

impl InternalDriveFileId {
    pub fn new(drive_id: Uuid, file_id: Uuid) -> Self {
        Self { drive_id, file_id }
    }

    /// Placeholder used wherever a file address must not leave the host.
    pub fn redacted() -> Self {
        Self {
            drive_id: Uuid::nil(),
            file_id: Uuid::nil(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.drive_id.is_nil() && !self.file_id.is_nil()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileState {
    Active,
    Deleted,
}

impl FileState {
    pub fn as_i32(&self) -> i32 {
        match self {
            FileState::Active => 1,
            FileState::Deleted => 2,
        }
    }
}

/// Logical file system sharing the drive infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum FileSystemType {
    Standard,
    Comment,
}

impl FileSystemType {
    pub fn as_i32(&self) -> i32 {
        match self {
            FileSystemType::Standard => 128,
            FileSystemType::Comment => 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailDescriptor {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub content_type: String,
    #[serde(default)]
    pub bytes_written: u64,
}

impl ThumbnailDescriptor {
    pub fn new(pixel_width: u32, pixel_height: u32, content_type: impl Into<String>) -> Self {
        Self {
            pixel_width,
            pixel_height,
            content_type: content_type.into(),
            bytes_written: 0,
        }
    }

    pub fn same_size(&self, other: &ThumbnailDescriptor) -> bool {
        self.pixel_width == other.pixel_width && self.pixel_height == other.pixel_height
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDescriptor {
    pub key: String,
    pub content_type: String,
    pub last_modified: i64,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default)]
    pub thumbnails: Vec<ThumbnailDescriptor>,
}

impl PayloadDescriptor {
    pub fn new(key: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            content_type: content_type.into(),
            last_modified: unix_time_ms(),
            bytes_written: 0,
            thumbnails: Vec::new(),
        }
    }

    pub fn with_thumbnail(mut self, thumb: ThumbnailDescriptor) -> Self {
        self.thumbnails.push(thumb);
        self
    }
}

/// Payload keys end up in file names and in `key|w|h` wire keys.
pub fn validate_payload_key(key: &str) -> HostResult<()> {
    let ok = !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(HostError::client(
            ClientErrorCode::InvalidPayloadKey,
            format!("invalid payload key '{key}'"),
        ))
    }
}

/// Small inline thumbnail carried in the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedThumb {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub content_type: String,
    pub content: String,
}

/// Client-defined, queryable application data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    #[serde(default)]
    pub unique_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<Uuid>,
    #[serde(default)]
    pub file_type: i32,
    #[serde(default)]
    pub data_type: i32,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub user_date: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub preview_thumbnail: Option<EmbeddedThumb>,
    /// True when `content` holds the whole file and there is no payload.
    #[serde(default)]
    pub content_is_complete: bool,
    #[serde(default)]
    pub archival_status: i32,
}

/// Summary of reactions shown on feed items.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    #[serde(default)]
    pub reactions: BTreeMap<String, u32>,
    #[serde(default)]
    pub total_comment_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file: InternalDriveFileId,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    pub file_state: FileState,
    #[serde(default)]
    pub version_tag: Option<Uuid>,
    #[serde(default)]
    pub global_transit_id: Option<Uuid>,
    #[serde(default)]
    pub sender_odin_id: Option<OdinId>,
    #[serde(default)]
    pub app_data: AppData,
    #[serde(default)]
    pub payloads: Vec<PayloadDescriptor>,
    #[serde(default)]
    pub reaction_preview: Option<ReactionSummary>,
    #[serde(default)]
    pub is_encrypted: bool,
}

impl FileMetadata {
    /// Fresh metadata for a new file; the storage service fills in times
    /// and the version tag.
    pub fn new(file: InternalDriveFileId, app_data: AppData) -> Self {
        Self {
            file,
            created: 0,
            updated: 0,
            file_state: FileState::Active,
            version_tag: None,
            global_transit_id: None,
            sender_odin_id: None,
            app_data,
            payloads: Vec::new(),
            reaction_preview: None,
            is_encrypted: false,
        }
    }

    pub fn payload(&self, key: &str) -> Option<&PayloadDescriptor> {
        self.payloads.iter().find(|p| p.key == key)
    }

    pub fn is_active(&self) -> bool {
        self.file_state == FileState::Active
    }
}

/// Latest problem recorded for a recipient; `None` means the latest
/// attempt succeeded or is still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LatestProblemStatus {
    ServerPendingRetry,
    ClientMustRetry,
    LocalFileDistributionDenied,
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientTransferHistoryItem {
    pub last_updated: i64,
    #[serde(default)]
    pub latest_problem_status: Option<LatestProblemStatus>,
    #[serde(default)]
    pub latest_successfully_delivered_version_tag: Option<Uuid>,
    #[serde(default)]
    pub is_in_outbox: bool,
    #[serde(default)]
    pub is_read_by_recipient: bool,
}

/// Per-recipient delivery record, keyed by lowercase recipient domain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientTransferHistory {
    #[serde(default)]
    pub recipients: BTreeMap<String, RecipientTransferHistoryItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferHistorySummary {
    pub total_in_outbox: u32,
    pub total_failed: u32,
    pub total_delivered: u32,
    pub total_read_by_recipient: u32,
}

impl RecipientTransferHistory {
    pub fn summary(&self) -> TransferHistorySummary {
        let mut s = TransferHistorySummary::default();
        for item in self.recipients.values() {
            if item.is_in_outbox {
                s.total_in_outbox += 1;
            }
            if item.latest_problem_status.is_some() {
                s.total_failed += 1;
            }
            if item.latest_successfully_delivered_version_tag.is_some() {
                s.total_delivered += 1;
            }
            if item.is_read_by_recipient {
                s.total_read_by_recipient += 1;
            }
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    pub access_control_list: AccessControlList,
    pub file_system_type: FileSystemType,
    #[serde(default)]
    pub file_byte_count: u64,
    #[serde(default = "default_true")]
    pub allow_distribution: bool,
    #[serde(default)]
    pub original_recipient_count: u32,
    #[serde(default)]
    pub transfer_history: Option<RecipientTransferHistory>,
}

fn default_true() -> bool {
    true
}

impl ServerMetadata {
    pub fn new(access_control_list: AccessControlList, file_system_type: FileSystemType) -> Self {
        Self {
            access_control_list,
            file_system_type,
            file_byte_count: 0,
            allow_distribution: true,
            original_recipient_count: 0,
            transfer_history: None,
        }
    }

    pub fn transfer_summary(&self) -> TransferHistorySummary {
        self.transfer_history
            .as_ref()
            .map(|h| h.summary())
            .unwrap_or_default()
    }
}

/// Everything the host stores about a file besides its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFileHeader {
    pub encrypted_key_header: EncryptedKeyHeader,
    pub file_metadata: FileMetadata,
    pub server_metadata: ServerMetadata,
}

impl ServerFileHeader {
    pub fn file(&self) -> InternalDriveFileId {
        self.file_metadata.file
    }

    pub fn is_active(&self) -> bool {
        self.file_metadata.is_active()
    }
}

/// Client priority from the ACL's required security group. Lower sorts
/// first.
pub fn priority_for(acl: Option<&AccessControlList>) -> i32 {
    match acl.map(|a| a.required_security_group) {
        Some(SecurityGroup::Owner) => 1,
        Some(SecurityGroup::Connected) => 300,
        Some(SecurityGroup::Authenticated) => 400,
        Some(SecurityGroup::Anonymous) => 500,
        None => 1000,
    }
}

/// Client-facing projection of a [`ServerFileHeader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedSecretEncryptedFileHeader {
    pub file_id: Uuid,
    pub target_drive: TargetDrive,
    pub file_state: FileState,
    pub file_system_type: FileSystemType,
    pub shared_secret_encrypted_key_header: EncryptedKeyHeader,
    pub file_metadata: FileMetadata,
    #[serde(default)]
    pub server_metadata: Option<ServerMetadata>,
    pub priority: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_matches_security_group() {
        let p = |g| priority_for(Some(&AccessControlList::for_group(g)));
        assert_eq!(p(SecurityGroup::Owner), 1);
        assert_eq!(p(SecurityGroup::Connected), 300);
        assert_eq!(p(SecurityGroup::Authenticated), 400);
        assert_eq!(p(SecurityGroup::Anonymous), 500);
        assert_eq!(priority_for(None), 1000);
    }

    #[test]
    fn payload_keys_are_restricted() {
        assert!(validate_payload_key("pst_mdi0").is_ok());
        assert!(validate_payload_key("a-b").is_ok());
        assert!(validate_payload_key("").is_err());
        assert!(validate_payload_key("Upper").is_err());
        assert!(validate_payload_key("a|b").is_err());
        assert!(validate_payload_key("../x").is_err());
    }

    #[test]
    fn sequential_ids_are_ordered() {
        let a = sequential_id();
        let b = sequential_id();
        assert!(a < b);
    }

    #[test]
    fn transfer_summary_counts_recipients() {
        let mut history = RecipientTransferHistory::default();
        history.recipients.insert(
            "sam.dotyou.cloud".into(),
            RecipientTransferHistoryItem {
                latest_successfully_delivered_version_tag: Some(Uuid::new_v4()),
                is_read_by_recipient: true,
                ..Default::default()
            },
        );
        history.recipients.insert(
            "merry.dotyou.cloud".into(),
            RecipientTransferHistoryItem {
                latest_problem_status: Some(LatestProblemStatus::ClientMustRetry),
                is_in_outbox: true,
                ..Default::default()
            },
        );
        let s = history.summary();
        assert_eq!(s.total_delivered, 1);
        assert_eq!(s.total_read_by_recipient, 1);
        assert_eq!(s.total_failed, 1);
        assert_eq!(s.total_in_outbox, 1);
    }

    #[test]
    fn server_metadata_defaults_allow_distribution() {
        let json = serde_json::json!({
            "accessControlList": { "requiredSecurityGroup": "owner" },
            "fileSystemType": "standard"
        });
        let meta: ServerMetadata = serde_json::from_value(json).unwrap();
        assert!(meta.allow_distribution);
        assert_eq!(meta.transfer_summary(), TransferHistorySummary::default());
    }
}
