// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Storage, query and command queue bound to one [`FileSystemType`].
//!
//! Standard and comment files share drives, the index and identity keys;
//! they differ only in the file system type every operation enforces.

use std::sync::Arc;

use uuid::Uuid;

use super::{CommandMessageQueue, DriveManager, DriveStorageService, FileSystemType, NotificationHub};
use crate::error::HostResult;
use crate::identity::{CallerContext, DriveAclAuthorizer};
use crate::query::{
    DriveQueryManager, FileQueryParams, QueryBatchCollectionRequest, QueryBatchCollectionResponse, QueryBatchResult,
    QueryBatchResultOptions, QueryIndex, QueryModifiedResult, QueryModifiedResultOptions,
};

pub struct DriveFileSystem {
    pub storage: Arc<DriveStorageService>,
    pub query: Arc<DriveQueryManager>,
    pub commands: Arc<CommandMessageQueue>,
}

impl DriveFileSystem {
    pub fn file_system_type(&self) -> FileSystemType {
        self.storage.file_system_type()
    }

    pub fn get_batch(
        &self,
        drive_id: &Uuid,
        params: &FileQueryParams,
        options: &QueryBatchResultOptions,
        caller: &CallerContext,
    ) -> HostResult<QueryBatchResult> {
        self.query
            .get_batch(drive_id, params, options, self.file_system_type(), caller)
    }

    pub fn get_modified(
        &self,
        drive_id: &Uuid,
        params: &FileQueryParams,
        options: &QueryModifiedResultOptions,
        caller: &CallerContext,
    ) -> HostResult<QueryModifiedResult> {
        self.query
            .get_modified(drive_id, params, options, self.file_system_type(), caller)
    }

    pub fn get_batch_collection(
        &self,
        request: &QueryBatchCollectionRequest,
        caller: &CallerContext,
    ) -> HostResult<QueryBatchCollectionResponse> {
        self.query
            .get_batch_collection(request, self.file_system_type(), caller)
    }
}

/// Hands out the file system for a [`FileSystemType`].
#[derive(Clone)]
pub struct FileSystemResolver {
    standard: Arc<DriveFileSystem>,
    comment: Arc<DriveFileSystem>,
}

impl FileSystemResolver {
    pub fn new(
        drives: Arc<DriveManager>,
        index: Arc<QueryIndex>,
        query: Arc<DriveQueryManager>,
        commands: Arc<CommandMessageQueue>,
        authorizer: Arc<dyn DriveAclAuthorizer>,
        hub: NotificationHub,
    ) -> Self {
        let build = |file_system_type| {
            Arc::new(DriveFileSystem {
                storage: Arc::new(DriveStorageService::new(
                    drives.clone(),
                    index.clone(),
                    authorizer.clone(),
                    hub.clone(),
                    file_system_type,
                )),
                query: query.clone(),
                commands: commands.clone(),
            })
        };
        Self {
            standard: build(FileSystemType::Standard),
            comment: build(FileSystemType::Comment),
        }
    }

    pub fn resolve(&self, file_system_type: FileSystemType) -> &Arc<DriveFileSystem> {
        match file_system_type {
            FileSystemType::Standard => &self.standard,
            FileSystemType::Comment => &self.comment,
        }
    }

    pub fn standard(&self) -> &Arc<DriveFileSystem> {
        &self.standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyHeader, SymmetricKey};
    use crate::drive::{AppData, CreateDriveRequest, DriveCache, FileMetadata, ServerMetadata, TargetDrive};
    use crate::error::ClientErrorCode;
    use crate::identity::{AccessControlList, DefaultAclAuthorizer, InMemoryCircleNetwork, OdinId};
    use crate::storage::database::open_database;
    use crate::storage::TenantStorage;

    #[tokio::test]
    async fn each_file_system_enforces_its_type() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = TenantStorage::open(dir.path()).unwrap();
        let db = Arc::new(open_database(&tenant.paths().index_db()).unwrap());
        let index = Arc::new(QueryIndex::open(db.clone()).unwrap());
        let commands = Arc::new(CommandMessageQueue::open(db).unwrap());
        let hub = NotificationHub::default();
        let drives = Arc::new(DriveManager::new(tenant, DriveCache::new(8), hub.clone()));
        let authorizer: Arc<dyn DriveAclAuthorizer> =
            Arc::new(DefaultAclAuthorizer::new(Arc::new(InMemoryCircleNetwork::new())));
        let query = Arc::new(DriveQueryManager::new(index.clone(), drives.clone(), authorizer.clone()));
        let resolver = FileSystemResolver::new(drives.clone(), index, query, commands, authorizer, hub);

        let owner = CallerContext::owner(OdinId::new("frodo.dotyou.cloud"), SymmetricKey::from_bytes([3u8; 32]), None);
        let drive = drives
            .create_drive(
                CreateDriveRequest::new("chat", TargetDrive::new(Uuid::new_v4(), Uuid::new_v4())),
                &owner,
            )
            .await
            .unwrap();

        let comments = resolver.resolve(FileSystemType::Comment);
        assert_eq!(comments.file_system_type(), FileSystemType::Comment);
        assert_eq!(resolver.standard().file_system_type(), FileSystemType::Standard);

        let file = comments.storage.create_internal_file_id(&drive.id, &owner).unwrap();
        let err = comments
            .storage
            .commit_new_file(
                file,
                &KeyHeader::new_random().unwrap(),
                FileMetadata::new(file, AppData::default()),
                ServerMetadata::new(AccessControlList::owner_only(), FileSystemType::Standard),
                false,
                &owner,
            )
            .unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::InvalidFileSystemType));

        comments
            .storage
            .commit_new_file(
                file,
                &KeyHeader::new_random().unwrap(),
                FileMetadata::new(file, AppData::default()),
                ServerMetadata::new(AccessControlList::owner_only(), FileSystemType::Comment),
                false,
                &owner,
            )
            .unwrap();

        // A comment is invisible to the standard file system.
        let standard_read = resolver.standard().storage.get_server_file_header(&file, &owner);
        assert!(standard_read.is_err());
        assert!(comments.storage.get_server_file_header(&file, &owner).unwrap().is_some());
    }
}
