// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Drive Query Index
//!
//! A secondary index over committed file headers, kept in `db/index.redb`
//! and fed asynchronously by storage notifications.
//!
//! - `index` - redb tables: per-drive index state, generations of entries,
//!   and the synchronously written identity keys (unique id / global
//!   transit id -> file id)
//! - `manager` - batch, modified and collection queries, rebuilds, and the
//!   background updater that applies notifications
//!
//! Each drive's index lives in a numbered generation. A rebuild fills a
//! fresh generation from long-term storage while live writes go to both,
//! then switches the active generation in one transaction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::drive::{FileState, ServerFileHeader, SharedSecretEncryptedFileHeader, TargetDrive};
use crate::identity::OdinId;

pub mod index;
pub mod manager;

pub use index::QueryIndex;
pub use manager::{DriveQueryManager, IndexUpdater};

pub const DEFAULT_MAX_RECORDS: usize = 100;

/// Lifecycle of a drive's index. Only `Ready` serves queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexState {
    RequiresRebuild,
    IsRebuilding,
    Ready,
}

/// Inclusive unix-ms range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnixTimeRange {
    pub start: i64,
    pub end: i64,
}

impl UnixTimeRange {
    pub fn contains(&self, value: i64) -> bool {
        self.start <= value && value <= self.end
    }
}

/// Filters of a drive query. Empty lists match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQueryParams {
    pub target_drive: TargetDrive,
    #[serde(default)]
    pub file_type: Vec<i32>,
    #[serde(default)]
    pub data_type: Vec<i32>,
    #[serde(default)]
    pub global_transit_id: Vec<Uuid>,
    #[serde(default)]
    pub client_unique_id_at_least_one: Vec<Uuid>,
    #[serde(default)]
    pub tags_match_at_least_one: Vec<Uuid>,
    #[serde(default)]
    pub tags_match_all: Vec<Uuid>,
    #[serde(default)]
    pub sender_odin_id: Vec<OdinId>,
    #[serde(default)]
    pub group_id: Vec<Uuid>,
    #[serde(default)]
    pub user_date: Option<UnixTimeRange>,
    /// Defaults to active files only.
    #[serde(default)]
    pub file_state: Vec<FileState>,
    #[serde(default)]
    pub archival_status: Vec<i32>,
}

impl FileQueryParams {
    pub fn new(target_drive: TargetDrive) -> Self {
        Self {
            target_drive,
            file_type: Vec::new(),
            data_type: Vec::new(),
            global_transit_id: Vec::new(),
            client_unique_id_at_least_one: Vec::new(),
            tags_match_at_least_one: Vec::new(),
            tags_match_all: Vec::new(),
            sender_odin_id: Vec::new(),
            group_id: Vec::new(),
            user_date: None,
            file_state: Vec::new(),
            archival_status: Vec::new(),
        }
    }

    /// Content filters only; ACL and file system type are checked by the
    /// caller.
    pub fn matches(&self, header: &ServerFileHeader) -> bool {
        let meta = &header.file_metadata;
        let app = &meta.app_data;

        let state_ok = if self.file_state.is_empty() {
            meta.file_state == FileState::Active
        } else {
            self.file_state.contains(&meta.file_state)
        };

        state_ok
            && any_of(&self.file_type, &app.file_type)
            && any_of(&self.data_type, &app.data_type)
            && any_of(&self.archival_status, &app.archival_status)
            && optional_any_of(&self.global_transit_id, meta.global_transit_id.as_ref())
            && optional_any_of(&self.client_unique_id_at_least_one, app.unique_id.as_ref())
            && optional_any_of(&self.sender_odin_id, meta.sender_odin_id.as_ref())
            && optional_any_of(&self.group_id, app.group_id.as_ref())
            && (self.tags_match_at_least_one.is_empty()
                || self.tags_match_at_least_one.iter().any(|t| app.tags.contains(t)))
            && self.tags_match_all.iter().all(|t| app.tags.contains(t))
            && self
                .user_date
                .is_none_or(|range| app.user_date.is_some_and(|d| range.contains(d)))
    }
}

fn any_of<T: PartialEq>(filter: &[T], value: &T) -> bool {
    filter.is_empty() || filter.contains(value)
}

fn optional_any_of<T: PartialEq>(filter: &[T], value: Option<&T>) -> bool {
    filter.is_empty() || value.is_some_and(|v| filter.contains(v))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryBatchOrdering {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchResultOptions {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    #[serde(default = "default_true")]
    pub include_metadata_header: bool,
    #[serde(default)]
    pub exclude_preview_thumbnail: bool,
    #[serde(default)]
    pub ordering: QueryBatchOrdering,
}

impl Default for QueryBatchResultOptions {
    fn default() -> Self {
        Self {
            cursor: None,
            max_records: DEFAULT_MAX_RECORDS,
            include_metadata_header: true,
            exclude_preview_thumbnail: false,
            ordering: QueryBatchOrdering::NewestFirst,
        }
    }
}

fn default_max_records() -> usize {
    DEFAULT_MAX_RECORDS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchResult {
    pub query_time: i64,
    pub include_metadata_header: bool,
    /// Pass back unchanged to continue after the last returned file.
    pub cursor: Option<String>,
    pub search_results: Vec<SharedSecretEncryptedFileHeader>,
    pub has_more_rows: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModifiedResultOptions {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// Upper bound (inclusive) on the modification time.
    #[serde(default)]
    pub max_date: Option<i64>,
    #[serde(default)]
    pub include_header_content: bool,
}

impl Default for QueryModifiedResultOptions {
    fn default() -> Self {
        Self {
            cursor: None,
            max_records: DEFAULT_MAX_RECORDS,
            max_date: None,
            include_header_content: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryModifiedResult {
    pub include_header_content: bool,
    pub cursor: Option<String>,
    pub search_results: Vec<SharedSecretEncryptedFileHeader>,
    pub has_more_rows: bool,
}

/// One named query of a collection request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionQueryParamSection {
    pub name: String,
    pub query_params: FileQueryParams,
    #[serde(default)]
    pub result_options: Option<QueryBatchResultOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchCollectionRequest {
    pub queries: Vec<CollectionQueryParamSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchResponse {
    pub name: String,
    pub include_metadata_header: bool,
    pub cursor: Option<String>,
    pub search_results: Vec<SharedSecretEncryptedFileHeader>,
    pub has_more_rows: bool,
}

impl QueryBatchResponse {
    pub fn from_result(name: String, result: QueryBatchResult) -> Self {
        Self {
            name,
            include_metadata_header: result.include_metadata_header,
            cursor: result.cursor,
            search_results: result.search_results,
            has_more_rows: result.has_more_rows,
        }
    }
}

/// Sections in request order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBatchCollectionResponse {
    pub results: Vec<QueryBatchResponse>,
}

/// File count and bytes of a drive's active files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveSizeInfo {
    pub file_count: u64,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptedKeyHeader;
    use crate::drive::{AppData, FileMetadata, FileSystemType, InternalDriveFileId, ServerMetadata};
    use crate::identity::AccessControlList;

    fn header(app_data: AppData) -> ServerFileHeader {
        let file = InternalDriveFileId::new(Uuid::new_v4(), Uuid::now_v7());
        ServerFileHeader {
            encrypted_key_header: EncryptedKeyHeader::empty(),
            file_metadata: FileMetadata::new(file, app_data),
            server_metadata: ServerMetadata::new(AccessControlList::owner_only(), FileSystemType::Standard),
        }
    }

    fn params() -> FileQueryParams {
        FileQueryParams::new(TargetDrive::new(Uuid::new_v4(), Uuid::new_v4()))
    }

    #[test]
    fn empty_params_match_active_files_only() {
        let mut h = header(AppData::default());
        assert!(params().matches(&h));

        h.file_metadata.file_state = FileState::Deleted;
        assert!(!params().matches(&h));

        let mut p = params();
        p.file_state = vec![FileState::Deleted];
        assert!(p.matches(&h));
    }

    #[test]
    fn tag_filters() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let h = header(AppData {
            tags: vec![a, b],
            ..Default::default()
        });

        let mut p = params();
        p.tags_match_at_least_one = vec![c, a];
        assert!(p.matches(&h));
        p.tags_match_at_least_one = vec![c];
        assert!(!p.matches(&h));

        let mut p = params();
        p.tags_match_all = vec![a, b];
        assert!(p.matches(&h));
        p.tags_match_all = vec![a, c];
        assert!(!p.matches(&h));
    }

    #[test]
    fn optional_fields_must_be_present_when_filtered() {
        let uid = Uuid::new_v4();
        let h = header(AppData {
            unique_id: Some(uid),
            file_type: 7,
            user_date: Some(1_000),
            ..Default::default()
        });

        let mut p = params();
        p.client_unique_id_at_least_one = vec![uid];
        p.file_type = vec![7, 8];
        p.user_date = Some(UnixTimeRange { start: 500, end: 1_000 });
        assert!(p.matches(&h));

        p.group_id = vec![Uuid::new_v4()];
        assert!(!p.matches(&h));

        let mut p = params();
        p.user_date = Some(UnixTimeRange { start: 1_001, end: 2_000 });
        assert!(!p.matches(&h));

        let mut p = params();
        p.sender_odin_id = vec![OdinId::new("sam.dotyou.cloud")];
        assert!(!p.matches(&h));
    }

    #[test]
    fn result_options_defaults_from_json() {
        let options: QueryBatchResultOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, QueryBatchResultOptions::default());
        assert_eq!(options.max_records, DEFAULT_MAX_RECORDS);
        assert!(options.include_metadata_header);
    }
}
