// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Queries over the drive index, index rebuilds, and the background task
//! that keeps the index in step with storage notifications.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    DriveSizeInfo, FileQueryParams, IndexState, QueryBatchCollectionRequest, QueryBatchCollectionResponse,
    QueryBatchOrdering, QueryBatchResponse, QueryBatchResult, QueryBatchResultOptions, QueryIndex,
    QueryModifiedResult, QueryModifiedResultOptions,
};
use crate::drive::storage_service::{
    client_storage_key, convert_to_shared_secret_encrypted_client_file_header, ClientHeaderOptions,
};
use crate::drive::{
    unix_time_ms, DriveManager, DriveNotification, FileSystemType, InternalDriveFileId, NotificationHub,
    ServerFileHeader, SharedSecretEncryptedFileHeader, StorageDrive,
};
use crate::error::{ClientErrorCode, HostError, HostResult};
use crate::identity::{CallerContext, DriveAclAuthorizer};
use crate::storage::database::{decode_cursor, encode_cursor};
use crate::storage::LongTermStorageManager;

/// Headers read from long-term storage per rebuild step.
pub const REBUILD_PAGE_SIZE: usize = 100;

pub struct DriveQueryManager {
    index: Arc<QueryIndex>,
    drives: Arc<DriveManager>,
    authorizer: Arc<dyn DriveAclAuthorizer>,
    /// Drives with a rebuild in progress in this process.
    rebuilding: Mutex<HashSet<Uuid>>,
}

impl DriveQueryManager {
    pub fn new(index: Arc<QueryIndex>, drives: Arc<DriveManager>, authorizer: Arc<dyn DriveAclAuthorizer>) -> Self {
        Self {
            index,
            drives,
            authorizer,
            rebuilding: Mutex::new(HashSet::new()),
        }
    }

    pub fn index(&self) -> &QueryIndex {
        &self.index
    }

    /// Give every known drive an index state. Drives that already hold
    /// files start out needing a rebuild.
    pub fn initialize(&self) -> HostResult<usize> {
        let mut initialized = 0;
        for drive in self.drives.all_drives()? {
            let lts = LongTermStorageManager::new(self.drives.storage(), drive.id);
            let state = if lts.get_server_file_headers(0, 1)?.is_empty() {
                IndexState::Ready
            } else {
                IndexState::RequiresRebuild
            };
            if self.index.initialize_drive(&drive.id, state)? {
                debug!(drive_id = %drive.id, state = ?state, "Index state initialized");
                initialized += 1;
            }
        }
        Ok(initialized)
    }

    fn ready_generation(&self, drive_id: &Uuid) -> HostResult<u32> {
        match self.index.state(drive_id)? {
            Some(record) if record.state == IndexState::Ready => Ok(record.active_generation),
            _ => Err(HostError::NoValidIndex(*drive_id)),
        }
    }

    fn accepts(
        &self,
        header: &ServerFileHeader,
        params: &FileQueryParams,
        file_system_type: FileSystemType,
        caller: &CallerContext,
    ) -> bool {
        header.server_metadata.file_system_type == file_system_type
            && params.matches(header)
            && self
                .authorizer
                .caller_has_permission(caller, &header.server_metadata.access_control_list)
    }

    fn to_client(
        &self,
        drive: &StorageDrive,
        headers: Vec<ServerFileHeader>,
        caller: &CallerContext,
        options: ClientHeaderOptions,
    ) -> HostResult<Vec<SharedSecretEncryptedFileHeader>> {
        let storage_key = client_storage_key(&self.drives, drive, caller)?;
        headers
            .into_iter()
            .map(|header| {
                convert_to_shared_secret_encrypted_client_file_header(
                    header,
                    drive.target_drive,
                    storage_key.as_ref(),
                    caller,
                    options,
                )
            })
            .collect()
    }

    // ========== Queries ==========

    /// One page of matching files, newest first unless asked otherwise.
    pub fn get_batch(
        &self,
        drive_id: &Uuid,
        params: &FileQueryParams,
        options: &QueryBatchResultOptions,
        file_system_type: FileSystemType,
        caller: &CallerContext,
    ) -> HostResult<QueryBatchResult> {
        let drive = self.drives.require_drive(drive_id)?;
        drive.assert_caller_can_read(caller)?;
        let generation = self.ready_generation(drive_id)?;

        let cursor = options.cursor.as_deref().map(decode_cursor).transpose()?;
        let newest_first = options.ordering == QueryBatchOrdering::NewestFirst;
        let page = self.index.scan_by_created(
            drive_id,
            generation,
            cursor.as_deref(),
            newest_first,
            options.max_records.max(1),
            |h| self.accepts(h, params, file_system_type, caller),
        )?;

        let client_options = ClientHeaderOptions {
            include_metadata_header: options.include_metadata_header,
            exclude_preview_thumbnail: options.exclude_preview_thumbnail,
            ..Default::default()
        };
        let search_results = self.to_client(&drive, page.headers, caller, client_options)?;
        Ok(QueryBatchResult {
            query_time: unix_time_ms(),
            include_metadata_header: options.include_metadata_header,
            cursor: page.cursor.map(|c| encode_cursor(&c)).or_else(|| options.cursor.clone()),
            search_results,
            has_more_rows: page.has_more,
        })
    }

    /// Files modified after the cursor, oldest change first.
    pub fn get_modified(
        &self,
        drive_id: &Uuid,
        params: &FileQueryParams,
        options: &QueryModifiedResultOptions,
        file_system_type: FileSystemType,
        caller: &CallerContext,
    ) -> HostResult<QueryModifiedResult> {
        let drive = self.drives.require_drive(drive_id)?;
        drive.assert_caller_can_read(caller)?;
        let generation = self.ready_generation(drive_id)?;

        let cursor = options.cursor.as_deref().map(decode_cursor).transpose()?;
        let page = self.index.scan_by_modified(
            drive_id,
            generation,
            cursor.as_deref(),
            options.max_date,
            options.max_records.max(1),
            |h| self.accepts(h, params, file_system_type, caller),
        )?;

        let client_options = ClientHeaderOptions {
            include_metadata_header: options.include_header_content,
            ..Default::default()
        };
        let search_results = self.to_client(&drive, page.headers, caller, client_options)?;
        Ok(QueryModifiedResult {
            include_header_content: options.include_header_content,
            cursor: page.cursor.map(|c| encode_cursor(&c)).or_else(|| options.cursor.clone()),
            search_results,
            has_more_rows: page.has_more,
        })
    }

    /// Run named queries in order. Sections on drives the caller cannot
    /// read, or whose index is not ready, are left out.
    pub fn get_batch_collection(
        &self,
        request: &QueryBatchCollectionRequest,
        file_system_type: FileSystemType,
        caller: &CallerContext,
    ) -> HostResult<QueryBatchCollectionResponse> {
        let mut names = HashSet::new();
        for section in &request.queries {
            if !names.insert(section.name.as_str()) {
                return Err(HostError::client(
                    ClientErrorCode::DuplicateQueryName,
                    format!("query name '{}' is used more than once", section.name),
                ));
            }
        }

        let mut response = QueryBatchCollectionResponse::default();
        for section in &request.queries {
            let Some(drive_id) = self
                .drives
                .get_drive_id_by_alias(&section.query_params.target_drive, true)?
            else {
                continue;
            };
            let drive = self.drives.require_drive(&drive_id)?;
            if !drive.caller_can_read(caller) {
                debug!(drive_id = %drive_id, section = %section.name, "Skipping unreadable drive");
                continue;
            }
            let options = section.result_options.clone().unwrap_or_default();
            match self.get_batch(&drive_id, &section.query_params, &options, file_system_type, caller) {
                Ok(result) => response
                    .results
                    .push(QueryBatchResponse::from_result(section.name.clone(), result)),
                Err(HostError::NoValidIndex(_)) => {
                    debug!(drive_id = %drive_id, section = %section.name, "Skipping drive without a ready index");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(response)
    }

    pub fn get_drive_size(&self, drive_id: &Uuid, caller: &CallerContext) -> HostResult<DriveSizeInfo> {
        let drive = self.drives.require_drive(drive_id)?;
        drive.assert_caller_can_read(caller)?;
        let generation = self.ready_generation(drive_id)?;
        Ok(self.index.drive_size(drive_id, generation)?)
    }

    /// Local file holding a global transit id. Backed by the identity keys,
    /// so it reflects committed writes immediately.
    pub fn resolve_global_transit_id(
        &self,
        drive_id: &Uuid,
        global_transit_id: &Uuid,
    ) -> HostResult<Option<InternalDriveFileId>> {
        Ok(self
            .index
            .lookup_global_transit_id(drive_id, global_transit_id)?
            .map(|file_id| InternalDriveFileId::new(*drive_id, file_id)))
    }

    pub fn resolve_unique_id(&self, drive_id: &Uuid, unique_id: &Uuid) -> HostResult<Option<InternalDriveFileId>> {
        Ok(self
            .index
            .lookup_unique_id(drive_id, unique_id)?
            .map(|file_id| InternalDriveFileId::new(*drive_id, file_id)))
    }

    fn visible_header(
        &self,
        file: Option<InternalDriveFileId>,
        file_system_type: FileSystemType,
        caller: &CallerContext,
    ) -> HostResult<Option<SharedSecretEncryptedFileHeader>> {
        let Some(file) = file else {
            return Ok(None);
        };
        let drive = self.drives.require_drive(&file.drive_id)?;
        drive.assert_caller_can_read(caller)?;
        let lts = LongTermStorageManager::new(self.drives.storage(), file.drive_id);
        let Some(header) = lts.get_server_file_header(&file.file_id)? else {
            return Ok(None);
        };
        if header.server_metadata.file_system_type != file_system_type
            || !self
                .authorizer
                .caller_has_permission(caller, &header.server_metadata.access_control_list)
        {
            return Ok(None);
        }
        Ok(self
            .to_client(&drive, vec![header], caller, ClientHeaderOptions::default())?
            .pop())
    }

    pub fn get_file_by_global_transit_id(
        &self,
        drive_id: &Uuid,
        global_transit_id: &Uuid,
        file_system_type: FileSystemType,
        caller: &CallerContext,
    ) -> HostResult<Option<SharedSecretEncryptedFileHeader>> {
        let file = self.resolve_global_transit_id(drive_id, global_transit_id)?;
        self.visible_header(file, file_system_type, caller)
    }

    pub fn get_file_by_client_unique_id(
        &self,
        drive_id: &Uuid,
        unique_id: &Uuid,
        file_system_type: FileSystemType,
        caller: &CallerContext,
    ) -> HostResult<Option<SharedSecretEncryptedFileHeader>> {
        let file = self.resolve_unique_id(drive_id, unique_id)?;
        self.visible_header(file, file_system_type, caller)
    }

    // ========== Index maintenance ==========

    /// Apply one storage notification. Safe to repeat.
    pub fn apply(&self, notification: &DriveNotification) -> HostResult<()> {
        match notification {
            DriveNotification::FileAdded { header }
            | DriveNotification::FileChanged { header, .. }
            | DriveNotification::ReactionPreviewUpdated { header } => self.index.upsert(header)?,
            DriveNotification::FileDeleted {
                header: Some(header),
                is_hard_delete: false,
                ..
            } => self.index.upsert(header)?,
            DriveNotification::FileDeleted { file, .. } => self.index.remove(file)?,
            DriveNotification::DriveDefinitionAdded { drive } => {
                self.index.initialize_drive(&drive.id, IndexState::Ready)?;
            }
            DriveNotification::DriveDefinitionChanged { .. } => {}
        }
        Ok(())
    }

    /// Flag every drive for a full rebuild, e.g. after missed notifications.
    pub fn mark_all_requires_rebuild(&self) -> HostResult<()> {
        for drive in self.drives.all_drives()? {
            self.index.set_state(&drive.id, IndexState::RequiresRebuild)?;
        }
        warn!("All drive indexes marked for rebuild");
        Ok(())
    }

    /// Rebuild the drive's index while the current generation keeps
    /// serving queries.
    pub fn rebuild_backup_index(&self, drive_id: &Uuid) -> HostResult<usize> {
        self.rebuild(drive_id, false)
    }

    /// Rebuild the drive's index; queries fail with `NoValidIndex` until
    /// it is done.
    pub fn rebuild_current_index(&self, drive_id: &Uuid) -> HostResult<usize> {
        self.rebuild(drive_id, true)
    }

    /// Redo every rebuild that is required or was interrupted. Failures are
    /// logged per drive.
    pub fn rebuild_pending(&self) -> HostResult<usize> {
        let mut rebuilt = 0;
        for (drive_id, record) in self.index.all_states()? {
            let result = match (record.state, record.building_generation) {
                (IndexState::Ready, None) => continue,
                (IndexState::Ready, Some(_)) => self.rebuild_backup_index(&drive_id),
                _ => self.rebuild_current_index(&drive_id),
            };
            match result {
                Ok(_) => rebuilt += 1,
                Err(e) => warn!(drive_id = %drive_id, error = %e, "Index rebuild failed"),
            }
        }
        Ok(rebuilt)
    }

    fn rebuild(&self, drive_id: &Uuid, take_offline: bool) -> HostResult<usize> {
        {
            let mut rebuilding = self
                .rebuilding
                .lock()
                .map_err(|_| HostError::system("rebuild registry lock poisoned"))?;
            if !rebuilding.insert(*drive_id) {
                debug!(drive_id = %drive_id, "Rebuild already running");
                return Ok(0);
            }
        }
        let result = self.rebuild_generation(drive_id, take_offline);
        if let Ok(mut rebuilding) = self.rebuilding.lock() {
            rebuilding.remove(drive_id);
        }
        result
    }

    fn rebuild_generation(&self, drive_id: &Uuid, take_offline: bool) -> HostResult<usize> {
        self.drives.require_drive(drive_id)?;
        let generation = self.index.begin_rebuild(drive_id, take_offline)?;
        info!(drive_id = %drive_id, generation, take_offline, "Index rebuild started");

        let lts = LongTermStorageManager::new(self.drives.storage(), *drive_id);
        let mut skip = 0;
        let mut written = 0;
        loop {
            let headers = lts.get_server_file_headers(skip, REBUILD_PAGE_SIZE)?;
            skip += headers.len();
            written += self.index.write_to_generation(drive_id, generation, &headers)?;
            if headers.len() < REBUILD_PAGE_SIZE {
                break;
            }
        }

        if self.index.finish_rebuild(drive_id, generation)? {
            info!(drive_id = %drive_id, generation, written, "Index rebuild finished");
        } else {
            warn!(drive_id = %drive_id, generation, "Index rebuild superseded");
        }
        Ok(written)
    }
}

// =============================================================================
// IndexUpdater
// =============================================================================

/// Background task applying storage notifications to the index.
pub struct IndexUpdater {
    manager: Arc<DriveQueryManager>,
    rx: broadcast::Receiver<DriveNotification>,
}

impl IndexUpdater {
    /// Subscribe now so nothing published after this call is missed.
    pub fn new(manager: Arc<DriveQueryManager>, hub: &NotificationHub) -> Self {
        Self {
            manager,
            rx: hub.subscribe(),
        }
    }

    /// Run until the cancellation token is triggered or the hub closes.
    ///
    /// ```rust,ignore
    /// tokio::spawn(updater.run(shutdown.clone()));
    /// ```
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Index updater starting");
        self.rebuild_pending().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Index updater shutting down");
                    return;
                }
                received = self.rx.recv() => match received {
                    Ok(notification) => self.apply(&notification).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Index updater lagged behind storage notifications");
                        if let Err(e) = self.manager.mark_all_requires_rebuild() {
                            warn!(error = %e, "Failed to mark indexes for rebuild");
                        }
                        self.rebuild_pending().await;
                    }
                    Err(RecvError::Closed) => {
                        info!("Notification hub closed; index updater stopping");
                        return;
                    }
                },
            }
        }
    }

    async fn apply(&self, notification: &DriveNotification) {
        if let Err(e) = self.manager.apply(notification) {
            let drive_id = notification.drive_id();
            warn!(
                drive_id = %drive_id,
                kind = notification.kind(),
                error = %e,
                "Failed to apply notification; scheduling rebuild"
            );
            if let Err(e) = self.manager.index().set_state(&drive_id, IndexState::RequiresRebuild) {
                warn!(drive_id = %drive_id, error = %e, "Failed to mark index for rebuild");
            }
            self.rebuild_pending().await;
        }
    }

    async fn rebuild_pending(&self) {
        let manager = self.manager.clone();
        match tokio::task::spawn_blocking(move || manager.rebuild_pending()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(rebuilt)) => info!(rebuilt, "Pending index rebuilds done"),
            Ok(Err(e)) => warn!(error = %e, "Pending index rebuilds failed"),
            Err(e) => warn!(error = %e, "Index rebuild task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::{KeyHeader, SymmetricKey};
    use crate::drive::{
        AppData, CreateDriveRequest, DriveCache, DriveStorageService, FileMetadata, ServerMetadata, TargetDrive,
    };
    use crate::drive::storage_service::UpdateTransferHistoryData;
    use crate::identity::{AccessControlList, DefaultAclAuthorizer, InMemoryCircleNetwork, OdinId};
    use crate::query::CollectionQueryParamSection;
    use crate::storage::database::open_database;
    use crate::storage::TenantStorage;

    struct Harness {
        storage: DriveStorageService,
        query: Arc<DriveQueryManager>,
        drives: Arc<DriveManager>,
        hub: NotificationHub,
        rx: broadcast::Receiver<DriveNotification>,
        owner: CallerContext,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let tenant = TenantStorage::open(dir.path()).unwrap();
            let db = Arc::new(open_database(&tenant.paths().index_db()).unwrap());
            let index = Arc::new(QueryIndex::open(db).unwrap());
            let hub = NotificationHub::new(256);
            let rx = hub.subscribe();
            let drives = Arc::new(DriveManager::new(tenant, DriveCache::new(16), hub.clone()));
            let authorizer: Arc<dyn DriveAclAuthorizer> =
                Arc::new(DefaultAclAuthorizer::new(Arc::new(InMemoryCircleNetwork::new())));
            let storage = DriveStorageService::new(
                drives.clone(),
                index.clone(),
                authorizer.clone(),
                hub.clone(),
                FileSystemType::Standard,
            );
            let query = Arc::new(DriveQueryManager::new(index, drives.clone(), authorizer));
            let owner = CallerContext::owner(
                OdinId::new("frodo.dotyou.cloud"),
                SymmetricKey::from_bytes([7u8; 32]),
                None,
            );
            Self {
                storage,
                query,
                drives,
                hub,
                rx,
                owner,
                _dir: dir,
            }
        }

        /// Apply everything published so far, as the updater would.
        fn sync(&mut self) {
            while let Ok(n) = self.rx.try_recv() {
                self.query.apply(&n).unwrap();
            }
        }

        async fn drive(&mut self, allow_anonymous_reads: bool) -> StorageDrive {
            let mut request = CreateDriveRequest::new("posts", TargetDrive::new(Uuid::new_v4(), Uuid::new_v4()));
            request.allow_anonymous_reads = allow_anonymous_reads;
            let drive = self.drives.create_drive(request, &self.owner).await.unwrap();
            self.sync();
            drive
        }

        fn commit(&self, drive: &StorageDrive, created: i64, acl: AccessControlList, app_data: AppData) -> ServerFileHeader {
            let file = self.storage.create_internal_file_id(&drive.id, &self.owner).unwrap();
            let mut metadata = FileMetadata::new(file, app_data);
            metadata.created = created;
            self.storage
                .commit_new_file(
                    file,
                    &KeyHeader::new_random().unwrap(),
                    metadata,
                    ServerMetadata::new(acl, FileSystemType::Standard),
                    false,
                    &self.owner,
                )
                .unwrap()
        }

        fn batch(&self, drive: &StorageDrive, options: &QueryBatchResultOptions) -> HostResult<QueryBatchResult> {
            self.query.get_batch(
                &drive.id,
                &FileQueryParams::new(drive.target_drive),
                options,
                FileSystemType::Standard,
                &self.owner,
            )
        }
    }

    fn file_ids(result: &QueryBatchResult) -> Vec<Uuid> {
        result.search_results.iter().map(|h| h.file_id).collect()
    }

    #[tokio::test]
    async fn committed_files_page_newest_first() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        let old = h.commit(&drive, 1_000, AccessControlList::owner_only(), AppData::default());
        let mid = h.commit(&drive, 2_000, AccessControlList::owner_only(), AppData::default());
        let new = h.commit(&drive, 3_000, AccessControlList::owner_only(), AppData::default());
        h.sync();

        let mut options = QueryBatchResultOptions {
            max_records: 2,
            ..Default::default()
        };
        let first = h.batch(&drive, &options).unwrap();
        assert_eq!(file_ids(&first), vec![new.file().file_id, mid.file().file_id]);
        assert!(first.has_more_rows);
        assert_eq!(first.search_results[0].file_metadata.file, InternalDriveFileId::redacted());

        options.cursor = first.cursor.clone();
        let second = h.batch(&drive, &options).unwrap();
        assert_eq!(file_ids(&second), vec![old.file().file_id]);
        assert!(!second.has_more_rows);

        // An exhausted page keeps the cursor so the client can resume.
        options.cursor = second.cursor.clone();
        let empty = h.batch(&drive, &options).unwrap();
        assert!(empty.search_results.is_empty());
        assert_eq!(empty.cursor, second.cursor);

        let oldest = h
            .batch(
                &drive,
                &QueryBatchResultOptions {
                    ordering: QueryBatchOrdering::OldestFirst,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            file_ids(&oldest),
            vec![old.file().file_id, mid.file().file_id, new.file().file_id]
        );
    }

    #[tokio::test]
    async fn deletes_update_the_index() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        let soft = h.commit(&drive, 1_000, AccessControlList::owner_only(), AppData::default());
        let hard = h.commit(&drive, 2_000, AccessControlList::owner_only(), AppData::default());
        h.sync();

        h.storage.soft_delete_long_term_file(&soft.file(), &h.owner).unwrap();
        h.storage.hard_delete_long_term_file(&hard.file(), &h.owner).unwrap();
        h.sync();

        assert!(h.batch(&drive, &QueryBatchResultOptions::default()).unwrap().search_results.is_empty());

        let mut params = FileQueryParams::new(drive.target_drive);
        params.file_state = vec![crate::drive::FileState::Deleted];
        let deleted = h
            .query
            .get_batch(&drive.id, &params, &QueryBatchResultOptions::default(), FileSystemType::Standard, &h.owner)
            .unwrap();
        assert_eq!(file_ids(&deleted), vec![soft.file().file_id]);
    }

    #[tokio::test]
    async fn not_ready_index_rejects_queries_until_rebuilt() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        let file = h.commit(&drive, 1_000, AccessControlList::owner_only(), AppData::default());
        // Lose the notification, as if the process crashed before applying it.
        while h.rx.try_recv().is_ok() {}
        h.query.index().set_state(&drive.id, IndexState::RequiresRebuild).unwrap();

        assert!(matches!(
            h.batch(&drive, &QueryBatchResultOptions::default()),
            Err(HostError::NoValidIndex(id)) if id == drive.id
        ));

        assert_eq!(h.query.rebuild_pending().unwrap(), 1);
        let result = h.batch(&drive, &QueryBatchResultOptions::default()).unwrap();
        assert_eq!(file_ids(&result), vec![file.file().file_id]);

        // A second rebuild yields the same view.
        h.query.rebuild_current_index(&drive.id).unwrap();
        let again = h.batch(&drive, &QueryBatchResultOptions::default()).unwrap();
        assert_eq!(file_ids(&again), file_ids(&result));
        assert_eq!(h.query.get_drive_size(&drive.id, &h.owner).unwrap().file_count, 1);
    }

    #[tokio::test]
    async fn backup_rebuild_keeps_serving() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        h.commit(&drive, 1_000, AccessControlList::owner_only(), AppData::default());
        h.sync();

        let generation = h.query.index().begin_rebuild(&drive.id, false).unwrap();
        assert_eq!(h.batch(&drive, &QueryBatchResultOptions::default()).unwrap().search_results.len(), 1);

        // An interrupted backup rebuild is redone without going offline.
        assert_eq!(h.query.rebuild_pending().unwrap(), 1);
        let record = h.query.index().state(&drive.id).unwrap().unwrap();
        assert_eq!(record.state, IndexState::Ready);
        assert!(record.building_generation.is_none());
        assert!(record.active_generation > generation);
        assert_eq!(h.batch(&drive, &QueryBatchResultOptions::default()).unwrap().search_results.len(), 1);
    }

    #[tokio::test]
    async fn anonymous_callers_see_only_public_files() {
        let mut h = Harness::new();
        let drive = h.drive(true).await;
        let public = h.commit(&drive, 1_000, AccessControlList::anonymous(), AppData::default());
        h.commit(&drive, 2_000, AccessControlList::owner_only(), AppData::default());
        h.sync();

        let result = h
            .query
            .get_batch(
                &drive.id,
                &FileQueryParams::new(drive.target_drive),
                &QueryBatchResultOptions::default(),
                FileSystemType::Standard,
                &CallerContext::anonymous(),
            )
            .unwrap();
        assert_eq!(file_ids(&result), vec![public.file().file_id]);
        assert!(result.search_results[0].server_metadata.is_none());

        let comments = h
            .query
            .get_batch(
                &drive.id,
                &FileQueryParams::new(drive.target_drive),
                &QueryBatchResultOptions::default(),
                FileSystemType::Comment,
                &h.owner,
            )
            .unwrap();
        assert!(comments.search_results.is_empty());
    }

    #[tokio::test]
    async fn modified_returns_changes_after_cursor() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        let first = h.commit(&drive, 1_000, AccessControlList::owner_only(), AppData::default());
        let second = h.commit(&drive, 2_000, AccessControlList::owner_only(), AppData::default());
        h.sync();

        let params = FileQueryParams::new(drive.target_drive);
        let all = h
            .query
            .get_modified(&drive.id, &params, &QueryModifiedResultOptions::default(), FileSystemType::Standard, &h.owner)
            .unwrap();
        let ids: Vec<Uuid> = all.search_results.iter().map(|f| f.file_id).collect();
        assert_eq!(ids, vec![first.file().file_id, second.file().file_id]);
        assert!(all.search_results[0].file_metadata.app_data.content.is_none());

        // Touch the first file; only it shows up after the cursor.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut header = h.storage.get_server_file_header(&first.file(), &h.owner).unwrap().unwrap();
        header.file_metadata.app_data.content = Some("edited".into());
        h.storage.update_active_file_header(first.file(), header, true, &h.owner).unwrap();
        h.sync();

        let options = QueryModifiedResultOptions {
            cursor: all.cursor.clone(),
            include_header_content: true,
            ..Default::default()
        };
        let changed = h
            .query
            .get_modified(&drive.id, &params, &options, FileSystemType::Standard, &h.owner)
            .unwrap();
        assert_eq!(changed.search_results.len(), 1);
        assert_eq!(changed.search_results[0].file_id, first.file().file_id);
        assert_eq!(changed.search_results[0].file_metadata.app_data.content.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn modified_reads_a_backup_rebuilt_index() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        let first = h.commit(&drive, 1_000, AccessControlList::owner_only(), AppData::default());
        let second = h.commit(&drive, 2_000, AccessControlList::owner_only(), AppData::default());
        // Missed notifications: only a rebuild brings the files in.
        while h.rx.try_recv().is_ok() {}

        assert_eq!(h.query.rebuild_backup_index(&drive.id).unwrap(), 2);
        let params = FileQueryParams::new(drive.target_drive);
        let all = h
            .query
            .get_modified(&drive.id, &params, &QueryModifiedResultOptions::default(), FileSystemType::Standard, &h.owner)
            .unwrap();
        let ids: Vec<Uuid> = all.search_results.iter().map(|f| f.file_id).collect();
        assert_eq!(ids, vec![first.file().file_id, second.file().file_id]);
        assert!(!all.has_more_rows);

        let after = QueryModifiedResultOptions {
            cursor: all.cursor.clone(),
            ..Default::default()
        };

        // Bookkeeping keeps `updated`, so it is not a modification.
        h.storage
            .update_transfer_history(
                &first.file(),
                &OdinId::new("sam.dotyou.cloud"),
                UpdateTransferHistoryData {
                    is_in_outbox: Some(true),
                    ..Default::default()
                },
                &h.owner,
            )
            .unwrap();
        h.sync();
        let untouched = h
            .query
            .get_modified(&drive.id, &params, &after, FileSystemType::Standard, &h.owner)
            .unwrap();
        assert!(untouched.search_results.is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut header = h.storage.get_server_file_header(&second.file(), &h.owner).unwrap().unwrap();
        header.file_metadata.app_data.content = Some("edited".into());
        h.storage.update_active_file_header(second.file(), header, true, &h.owner).unwrap();
        h.sync();

        let changed = h
            .query
            .get_modified(&drive.id, &params, &after, FileSystemType::Standard, &h.owner)
            .unwrap();
        let ids: Vec<Uuid> = changed.search_results.iter().map(|f| f.file_id).collect();
        assert_eq!(ids, vec![second.file().file_id]);
    }

    #[tokio::test]
    async fn tagged_files_are_found_by_tag() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        let (red, blue, green) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let tagged = |tags: Vec<Uuid>| AppData {
            tags,
            ..Default::default()
        };
        let red_only = h.commit(&drive, 1_000, AccessControlList::owner_only(), tagged(vec![red]));
        let red_blue = h.commit(&drive, 2_000, AccessControlList::owner_only(), tagged(vec![red, blue]));
        h.commit(&drive, 3_000, AccessControlList::owner_only(), tagged(vec![green]));
        h.commit(&drive, 4_000, AccessControlList::owner_only(), AppData::default());
        h.sync();

        let query = |params: &FileQueryParams| {
            let result = h
                .query
                .get_batch(&drive.id, params, &QueryBatchResultOptions::default(), FileSystemType::Standard, &h.owner)
                .unwrap();
            file_ids(&result)
        };

        let mut params = FileQueryParams::new(drive.target_drive);
        params.tags_match_at_least_one = vec![red];
        assert_eq!(query(&params), vec![red_blue.file().file_id, red_only.file().file_id]);

        params.tags_match_at_least_one = vec![blue, Uuid::new_v4()];
        assert_eq!(query(&params), vec![red_blue.file().file_id]);

        let mut all = FileQueryParams::new(drive.target_drive);
        all.tags_match_all = vec![red, blue];
        assert_eq!(query(&all), vec![red_blue.file().file_id]);

        let mut none = FileQueryParams::new(drive.target_drive);
        none.tags_match_at_least_one = vec![Uuid::new_v4()];
        assert!(query(&none).is_empty());
    }

    #[tokio::test]
    async fn collection_runs_sections_in_order() {
        let mut h = Harness::new();
        let a = h.drive(false).await;
        let b = h.drive(false).await;
        let in_a = h.commit(&a, 1_000, AccessControlList::owner_only(), AppData::default());
        let in_b = h.commit(&b, 1_000, AccessControlList::owner_only(), AppData::default());
        h.sync();
        h.query.index().set_state(&b.id, IndexState::RequiresRebuild).unwrap();

        let section = |name: &str, drive: &StorageDrive| CollectionQueryParamSection {
            name: name.into(),
            query_params: FileQueryParams::new(drive.target_drive),
            result_options: None,
        };
        let request = QueryBatchCollectionRequest {
            queries: vec![section("b", &b), section("a", &a)],
        };

        let response = h
            .query
            .get_batch_collection(&request, FileSystemType::Standard, &h.owner)
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].name, "a");
        assert_eq!(response.results[0].search_results[0].file_id, in_a.file().file_id);

        h.query.rebuild_pending().unwrap();
        let response = h
            .query
            .get_batch_collection(&request, FileSystemType::Standard, &h.owner)
            .unwrap();
        let names: Vec<&str> = response.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(response.results[0].search_results[0].file_id, in_b.file().file_id);

        let duplicate = QueryBatchCollectionRequest {
            queries: vec![section("x", &a), section("x", &b)],
        };
        let err = h
            .query
            .get_batch_collection(&duplicate, FileSystemType::Standard, &h.owner)
            .unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::DuplicateQueryName));

        let unknown = QueryBatchCollectionRequest {
            queries: vec![CollectionQueryParamSection {
                name: "nope".into(),
                query_params: FileQueryParams::new(TargetDrive::new(Uuid::new_v4(), Uuid::new_v4())),
                result_options: None,
            }],
        };
        let err = h
            .query
            .get_batch_collection(&unknown, FileSystemType::Standard, &h.owner)
            .unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::InvalidTargetDrive));
    }

    #[tokio::test]
    async fn identity_lookups_are_immediate() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        let unique_id = Uuid::new_v4();
        let header = h.commit(
            &drive,
            1_000,
            AccessControlList::owner_only(),
            AppData {
                unique_id: Some(unique_id),
                ..Default::default()
            },
        );

        // No sync: the identity keys do not wait for the updater.
        assert_eq!(h.query.resolve_unique_id(&drive.id, &unique_id).unwrap(), Some(header.file()));
        let found = h
            .query
            .get_file_by_client_unique_id(&drive.id, &unique_id, FileSystemType::Standard, &h.owner)
            .unwrap()
            .unwrap();
        assert_eq!(found.file_id, header.file().file_id);
        assert!(h
            .query
            .get_file_by_global_transit_id(&drive.id, &Uuid::new_v4(), FileSystemType::Standard, &h.owner)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn updater_applies_notifications_in_background() {
        let mut h = Harness::new();
        let drive = h.drive(false).await;
        let shutdown = CancellationToken::new();
        let updater = IndexUpdater::new(h.query.clone(), &h.hub);
        let task = tokio::spawn(updater.run(shutdown.clone()));

        let header = h.commit(&drive, 1_000, AccessControlList::owner_only(), AppData::default());
        let mut found = Vec::new();
        for _ in 0..100 {
            found = file_ids(&h.batch(&drive, &QueryBatchResultOptions::default()).unwrap());
            if !found.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(found, vec![header.file().file_id]);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lagging_marks_everything_for_rebuild() {
        let mut h = Harness::new();
        let a = h.drive(false).await;
        h.commit(&a, 1_000, AccessControlList::owner_only(), AppData::default());
        h.sync();

        h.query.mark_all_requires_rebuild().unwrap();
        assert!(h.batch(&a, &QueryBatchResultOptions::default()).is_err());
        h.query.rebuild_pending().unwrap();
        assert_eq!(h.batch(&a, &QueryBatchResultOptions::default()).unwrap().search_results.len(), 1);
    }
}
