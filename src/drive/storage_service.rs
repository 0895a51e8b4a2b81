// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! File lifecycle on top of the per-drive storage managers.
//!
//! ```text
//! NonExistent --commit--> Active --overwrite--> Active --soft delete--> Deleted
//!      ^                                                                   |
//!      +------------------------------ hard delete ------------------------+
//! ```
//!
//! Every content write stamps a new version tag and `updated` time and
//! recomputes `file_byte_count`. Identity keys (unique id, global transit
//! id) are reserved in the query index before the header is written so
//! uniqueness does not depend on the asynchronous index update. Committed
//! changes are published on the [`NotificationHub`], except for files on
//! the transient temp drive.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::{
    priority_for, sequential_id, unix_time_ms, validate_payload_key, AppData, DriveManager, DriveNotification,
    FileMetadata, FileState, FileSystemType, InternalDriveFileId, LatestProblemStatus, NotificationHub,
    PayloadDescriptor, ReactionSummary, ServerFileHeader, ServerMetadata, SharedSecretEncryptedFileHeader,
    StorageDrive, TargetDrive, ThumbnailDescriptor,
};
use crate::crypto::{EncryptedKeyHeader, KeyHeader, SymmetricKey};
use crate::error::{ClientErrorCode, HostError, HostResult};
use crate::identity::{AccessControlList, CallerContext, DriveAclAuthorizer, DrivePermission, OdinId};
use crate::query::index::IdentityConflict;
use crate::query::QueryIndex;
use crate::storage::temp::{payload_extension, thumbnail_extension};
use crate::storage::{FileChunk, FilePart, LongTermStorageManager, TempStorageManager};

// =============================================================================
// Client projection
// =============================================================================

/// How a header is projected for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHeaderOptions {
    pub force_include_server_metadata: bool,
    /// When false, `app_data.content` is dropped.
    pub include_metadata_header: bool,
    pub exclude_preview_thumbnail: bool,
}

impl Default for ClientHeaderOptions {
    fn default() -> Self {
        Self {
            force_include_server_metadata: false,
            include_metadata_header: true,
            exclude_preview_thumbnail: false,
        }
    }
}

/// Project a stored header for a client.
///
/// The key header is re-wrapped under the caller's shared secret when both
/// the secret and the drive storage key are available, and replaced by an
/// empty header otherwise. Internal drive/file ids are redacted from the
/// metadata; server metadata is only included for the owner or when forced.
pub fn convert_to_shared_secret_encrypted_client_file_header(
    header: ServerFileHeader,
    target_drive: TargetDrive,
    storage_key: Option<&SymmetricKey>,
    caller: &CallerContext,
    options: ClientHeaderOptions,
) -> HostResult<SharedSecretEncryptedFileHeader> {
    let ServerFileHeader {
        encrypted_key_header,
        mut file_metadata,
        server_metadata,
    } = header;

    let shared_secret_encrypted_key_header = match (caller.shared_secret(), storage_key) {
        (Some(secret), Some(key)) if !encrypted_key_header.is_empty() => {
            encrypted_key_header.decrypt(key)?.encrypt(secret)?
        }
        _ => EncryptedKeyHeader::empty(),
    };

    let file_id = file_metadata.file.file_id;
    file_metadata.file = InternalDriveFileId::redacted();
    if !options.include_metadata_header {
        file_metadata.app_data.content = None;
    }
    if options.exclude_preview_thumbnail {
        file_metadata.app_data.preview_thumbnail = None;
    }

    let priority = priority_for(Some(&server_metadata.access_control_list));
    let file_system_type = server_metadata.file_system_type;
    let include_server_metadata = caller.is_owner() || options.force_include_server_metadata;

    Ok(SharedSecretEncryptedFileHeader {
        file_id,
        target_drive,
        file_state: file_metadata.file_state,
        file_system_type,
        shared_secret_encrypted_key_header,
        file_metadata,
        server_metadata: include_server_metadata.then_some(server_metadata),
        priority,
    })
}

/// The storage key to re-wrap key headers for a caller, if the caller has a
/// shared secret and can unlock the drive. Key validation failures still
/// propagate.
pub fn client_storage_key(
    drives: &DriveManager,
    drive: &StorageDrive,
    caller: &CallerContext,
) -> HostResult<Option<SymmetricKey>> {
    if caller.shared_secret().is_none() {
        return Ok(None);
    }
    match drives.storage_key(drive, caller) {
        Ok(key) => Ok(Some(key)),
        Err(HostError::Security(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Transfer bookkeeping
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatestTransferStatus {
    Delivered,
    Problem(LatestProblemStatus),
}

/// Fields of a recipient's transfer history to change; `None` keeps the
/// stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateTransferHistoryData {
    pub is_in_outbox: Option<bool>,
    pub is_read_by_recipient: Option<bool>,
    pub latest_transfer_status: Option<LatestTransferStatus>,
    /// Version delivered, recorded with [`LatestTransferStatus::Delivered`].
    pub version_tag: Option<Uuid>,
}

/// A payload or thumbnail read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartStream<D> {
    pub descriptor: D,
    pub bytes: Vec<u8>,
}

// =============================================================================
// DriveStorageService
// =============================================================================

pub struct DriveStorageService {
    drives: Arc<DriveManager>,
    index: Arc<QueryIndex>,
    authorizer: Arc<dyn DriveAclAuthorizer>,
    hub: NotificationHub,
    file_system_type: FileSystemType,
    /// Serializes read-modify-write of transfer history.
    history_lock: Mutex<()>,
}

impl DriveStorageService {
    pub fn new(
        drives: Arc<DriveManager>,
        index: Arc<QueryIndex>,
        authorizer: Arc<dyn DriveAclAuthorizer>,
        hub: NotificationHub,
        file_system_type: FileSystemType,
    ) -> Self {
        Self {
            drives,
            index,
            authorizer,
            hub,
            file_system_type,
            history_lock: Mutex::new(()),
        }
    }

    pub fn file_system_type(&self) -> FileSystemType {
        self.file_system_type
    }

    pub fn drives(&self) -> &DriveManager {
        &self.drives
    }

    fn lts(&self, drive_id: Uuid) -> LongTermStorageManager<'_> {
        LongTermStorageManager::new(self.drives.storage(), drive_id)
    }

    fn tsm(&self, drive_id: Uuid) -> TempStorageManager<'_> {
        TempStorageManager::new(self.drives.storage(), drive_id)
    }

    // ========== Guards ==========

    fn assert_can_write(&self, drive_id: &Uuid, caller: &CallerContext) -> HostResult<StorageDrive> {
        let drive = self.drives.require_drive(drive_id)?;
        caller.assert_drive_permission(drive_id, DrivePermission::WRITE)?;
        Ok(drive)
    }

    fn assert_can_read(&self, drive_id: &Uuid, caller: &CallerContext) -> HostResult<StorageDrive> {
        let drive = self.drives.require_drive(drive_id)?;
        drive.assert_caller_can_read(caller)?;
        Ok(drive)
    }

    fn assert_can_read_or_write(&self, drive_id: &Uuid, caller: &CallerContext) -> HostResult<StorageDrive> {
        let drive = self.drives.require_drive(drive_id)?;
        if drive.caller_can_read(caller) || caller.has_drive_permission(drive_id, DrivePermission::WRITE) {
            Ok(drive)
        } else {
            tracing::warn!(caller = ?caller.odin_id, drive_id = %drive_id, "Caller can neither read nor write drive");
            Err(HostError::security(format!("no access to drive {drive_id}")))
        }
    }

    fn assert_valid_file_system_type(&self, server_metadata: &ServerMetadata) -> HostResult<()> {
        if server_metadata.file_system_type != self.file_system_type {
            return Err(HostError::client(
                ClientErrorCode::InvalidFileSystemType,
                format!("this service only handles {:?} files", self.file_system_type),
            ));
        }
        Ok(())
    }

    fn existing_active_header(&self, file: &InternalDriveFileId) -> HostResult<ServerFileHeader> {
        let existing = self
            .lts(file.drive_id)
            .get_server_file_header(&file.file_id)?
            .ok_or_else(|| {
                HostError::client(
                    ClientErrorCode::CannotOverwriteNonExistentFile,
                    format!("file {} does not exist", file.file_id),
                )
            })?;
        if !existing.is_active() {
            return Err(HostError::client(
                ClientErrorCode::CannotUpdateNonActiveFile,
                format!("file {} is not active", file.file_id),
            ));
        }
        self.assert_valid_file_system_type(&existing.server_metadata)?;
        Ok(existing)
    }

    fn publish(&self, drive: &StorageDrive, notification: DriveNotification) {
        if !drive.is_transient_temp_drive() {
            self.hub.publish(notification);
        }
    }

    // ========== Writes ==========

    fn reserve_identity(&self, metadata: &FileMetadata) -> HostResult<()> {
        let conflict = self.index.reserve_identity(
            &metadata.file,
            metadata.app_data.unique_id,
            metadata.global_transit_id,
        )?;
        match conflict {
            None => Ok(()),
            Some(IdentityConflict::UniqueId { file_id }) => {
                tracing::debug!(
                    drive_id = %metadata.file.drive_id,
                    file_id = %metadata.file.file_id,
                    existing = %file_id,
                    "Unique id already in use"
                );
                Err(HostError::client(
                    ClientErrorCode::ExistingFileWithUniqueId,
                    format!(
                        "unique id {} is already used by file {file_id}",
                        metadata.app_data.unique_id.unwrap_or_default()
                    ),
                ))
            }
            Some(IdentityConflict::GlobalTransitId { file_id }) => {
                tracing::warn!(
                    drive_id = %metadata.file.drive_id,
                    file_id = %metadata.file.file_id,
                    existing = %file_id,
                    "Global transit id already belongs to another file"
                );
                Err(HostError::security(format!(
                    "global transit id already belongs to file {file_id}"
                )))
            }
        }
    }

    /// Persist a header. Unless `keep_same_version_tag`, a new version tag
    /// and a strictly later `updated` are stamped first.
    fn write_header(&self, header: &mut ServerFileHeader, keep_same_version_tag: bool) -> HostResult<()> {
        let file = header.file();
        if !keep_same_version_tag {
            header.file_metadata.version_tag = Some(sequential_id());
            header.file_metadata.updated = unix_time_ms().max(header.file_metadata.updated + 1);
        }
        let lts = self.lts(file.drive_id);
        let usage = lts.get_payload_disk_usage(&file.file_id)?;
        // The header is measured with the payload usage already in place.
        header.server_metadata.file_byte_count = usage;
        let header_len = LongTermStorageManager::header_len(header)?;
        header.server_metadata.file_byte_count = usage + header_len;
        lts.save_header(header)?;
        Ok(())
    }

    /// Move the staged parts described by `payloads` from `temp` into
    /// `target`, recording their sizes. Parts that were never staged are
    /// left as they are.
    fn move_staged_parts(
        &self,
        temp: &InternalDriveFileId,
        target: &InternalDriveFileId,
        payloads: &mut [PayloadDescriptor],
    ) -> HostResult<()> {
        let storage = self.drives.storage();
        let tsm = self.tsm(temp.drive_id);
        let lts = self.lts(target.drive_id);
        for payload in payloads.iter_mut() {
            let extension = payload_extension(&payload.key);
            if tsm.exists(&temp.file_id, &extension) {
                let source = tsm.get_path(&temp.file_id, &extension);
                payload.bytes_written = storage.file_len(&source)?;
                lts.move_payload_to_long_term(&target.file_id, &payload.key, &source)?;
            }
            for thumb in payload.thumbnails.iter_mut() {
                let extension = thumbnail_extension(&payload.key, thumb.pixel_width, thumb.pixel_height);
                if tsm.exists(&temp.file_id, &extension) {
                    let source = tsm.get_path(&temp.file_id, &extension);
                    thumb.bytes_written = storage.file_len(&source)?;
                    lts.move_thumbnail_to_long_term(
                        &target.file_id,
                        &payload.key,
                        thumb.pixel_width,
                        thumb.pixel_height,
                        &source,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Stage one part of an upload in the drive's temp storage.
    pub fn write_temp_stream(
        &self,
        file: &InternalDriveFileId,
        extension: &str,
        bytes: &[u8],
        caller: &CallerContext,
    ) -> HostResult<u64> {
        self.assert_can_write(&file.drive_id, caller)?;
        self.tsm(file.drive_id).write_stream(&file.file_id, extension, bytes)
    }

    pub fn get_temp_stream(
        &self,
        file: &InternalDriveFileId,
        extension: &str,
        caller: &CallerContext,
    ) -> HostResult<Option<Vec<u8>>> {
        self.assert_can_write(&file.drive_id, caller)?;
        self.tsm(file.drive_id).get_stream(&file.file_id, extension)
    }

    pub fn delete_temp_file(&self, file: &InternalDriveFileId, caller: &CallerContext) -> HostResult<()> {
        self.assert_can_write(&file.drive_id, caller)?;
        self.tsm(file.drive_id).ensure_all_deleted(&file.file_id)
    }

    /// A fresh address on a drive the caller can write to.
    pub fn create_internal_file_id(&self, drive_id: &Uuid, caller: &CallerContext) -> HostResult<InternalDriveFileId> {
        self.assert_can_write(drive_id, caller)?;
        Ok(InternalDriveFileId::new(*drive_id, self.lts(*drive_id).create_file_id()))
    }

    /// Commit an upload staged under `target` in temp storage.
    ///
    /// When a header already exists at `target` this behaves as an update:
    /// the stored created time, global transit id and sender are kept.
    pub fn commit_new_file(
        &self,
        target: InternalDriveFileId,
        key_header: &KeyHeader,
        mut metadata: FileMetadata,
        mut server_metadata: ServerMetadata,
        ignore_payload: bool,
        caller: &CallerContext,
    ) -> HostResult<ServerFileHeader> {
        let drive = self.assert_can_write(&target.drive_id, caller)?;
        self.assert_valid_file_system_type(&server_metadata)?;
        for payload in &metadata.payloads {
            validate_payload_key(&payload.key)?;
        }

        let existing = self.lts(target.drive_id).get_server_file_header(&target.file_id)?;
        metadata.file = target;
        match &existing {
            Some(previous) => {
                if !previous.is_active() {
                    return Err(HostError::client(
                        ClientErrorCode::CannotUpdateNonActiveFile,
                        format!("file {} is not active", target.file_id),
                    ));
                }
                metadata.created = previous.file_metadata.created;
                metadata.global_transit_id = previous.file_metadata.global_transit_id.or(metadata.global_transit_id);
                metadata.sender_odin_id = previous.file_metadata.sender_odin_id.clone();
                metadata.updated = previous.file_metadata.updated;
                server_metadata.transfer_history = previous.server_metadata.transfer_history.clone();
            }
            None => {
                if metadata.created == 0 {
                    metadata.created = unix_time_ms();
                }
            }
        }
        metadata.file_state = FileState::Active;

        self.reserve_identity(&metadata)?;
        let result = self.finish_commit(&drive, target, key_header, metadata, server_metadata, ignore_payload, caller);
        if result.is_err() && existing.is_none() {
            if let Err(e) = self.index.release_all(&target) {
                tracing::warn!(file_id = %target.file_id, error = %e, "Failed to release identity keys of failed commit");
            }
        }
        let header = result?;

        tracing::info!(
            drive_id = %target.drive_id,
            file_id = %target.file_id,
            version_tag = ?header.file_metadata.version_tag,
            "File committed"
        );
        let notification = match existing {
            None => DriveNotification::FileAdded { header: header.clone() },
            Some(previous) => DriveNotification::FileChanged {
                header: header.clone(),
                previous: Some(previous),
            },
        };
        self.publish(&drive, notification);
        Ok(header)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_commit(
        &self,
        drive: &StorageDrive,
        target: InternalDriveFileId,
        key_header: &KeyHeader,
        mut metadata: FileMetadata,
        server_metadata: ServerMetadata,
        ignore_payload: bool,
        caller: &CallerContext,
    ) -> HostResult<ServerFileHeader> {
        if !ignore_payload {
            self.move_staged_parts(&target, &target, &mut metadata.payloads)?;
        }
        let storage_key = self.drives.storage_key(drive, caller)?;
        let mut header = ServerFileHeader {
            encrypted_key_header: key_header.encrypt(&storage_key)?,
            file_metadata: metadata,
            server_metadata,
        };
        self.write_header(&mut header, false)?;
        self.tsm(target.drive_id).ensure_all_deleted(&target.file_id)?;
        Ok(header)
    }

    /// Write `header` at `file`: a new header when none is stored, else an
    /// update that keeps the stored created time, global transit id, state
    /// and sender. Storing over an existing file requires an active header.
    pub fn update_active_file_header(
        &self,
        file: InternalDriveFileId,
        header: ServerFileHeader,
        raise_event: bool,
        caller: &CallerContext,
    ) -> HostResult<ServerFileHeader> {
        let drive = self.assert_can_write(&file.drive_id, caller)?;
        self.assert_valid_file_system_type(&header.server_metadata)?;
        self.update_active_file_header_internal(&drive, file, header, false, raise_event)
    }

    fn update_active_file_header_internal(
        &self,
        drive: &StorageDrive,
        file: InternalDriveFileId,
        mut header: ServerFileHeader,
        keep_same_version_tag: bool,
        raise_event: bool,
    ) -> HostResult<ServerFileHeader> {
        header.file_metadata.file = file;
        let existing = self.lts(file.drive_id).get_server_file_header(&file.file_id)?;
        match &existing {
            None => {
                if header.file_metadata.created == 0 {
                    header.file_metadata.created = unix_time_ms();
                }
                header.file_metadata.file_state = FileState::Active;
            }
            Some(previous) => {
                if !header.is_active() {
                    return Err(HostError::client(
                        ClientErrorCode::CannotUpdateNonActiveFile,
                        "cannot store a non-active header over an existing file",
                    ));
                }
                let stored = &previous.file_metadata;
                header.file_metadata.created = stored.created;
                header.file_metadata.global_transit_id = stored.global_transit_id;
                header.file_metadata.file_state = stored.file_state;
                header.file_metadata.sender_odin_id = stored.sender_odin_id.clone();
                header.file_metadata.updated = header.file_metadata.updated.max(stored.updated);
            }
        }

        if header.is_active() {
            self.reserve_identity(&header.file_metadata)?;
        } else {
            self.index.release_unique_id(&file)?;
        }
        self.write_header(&mut header, keep_same_version_tag)?;
        self.tsm(file.drive_id).ensure_all_deleted(&file.file_id)?;

        if raise_event {
            let notification = match existing {
                None => DriveNotification::FileAdded { header: header.clone() },
                Some(previous) => DriveNotification::FileChanged {
                    header: header.clone(),
                    previous: Some(previous),
                },
            };
            self.publish(drive, notification);
        }
        Ok(header)
    }

    /// Replace an active file's header and parts with an upload staged
    /// under `temp`.
    pub fn overwrite_file(
        &self,
        temp: InternalDriveFileId,
        target: InternalDriveFileId,
        key_header: &KeyHeader,
        mut metadata: FileMetadata,
        mut server_metadata: ServerMetadata,
        caller: &CallerContext,
    ) -> HostResult<ServerFileHeader> {
        let drive = self.assert_can_write(&target.drive_id, caller)?;
        for payload in &metadata.payloads {
            validate_payload_key(&payload.key)?;
        }
        let existing = self.existing_active_header(&target)?;
        assert_version_tag_match(existing.file_metadata.version_tag, metadata.version_tag)?;

        let stored = &existing.file_metadata;
        metadata.file = target;
        metadata.created = stored.created;
        if stored.global_transit_id.is_some() {
            metadata.global_transit_id = stored.global_transit_id;
        }
        metadata.file_state = stored.file_state;
        metadata.reaction_preview = stored.reaction_preview.clone();
        metadata.updated = stored.updated;
        server_metadata.file_system_type = existing.server_metadata.file_system_type;
        server_metadata.transfer_history = existing.server_metadata.transfer_history.clone();

        self.reserve_identity(&metadata)?;

        let lts = self.lts(target.drive_id);
        lts.delete_missing_payloads(&target.file_id, &metadata.payloads)?;
        lts.delete_missing_thumbnail_files(&target.file_id, &metadata.payloads)?;
        self.move_staged_parts(&temp, &target, &mut metadata.payloads)?;

        let storage_key = self.drives.storage_key(&drive, caller)?;
        let mut header = ServerFileHeader {
            encrypted_key_header: key_header.encrypt(&storage_key)?,
            file_metadata: metadata,
            server_metadata,
        };
        self.write_header(&mut header, false)?;
        self.tsm(temp.drive_id).ensure_all_deleted(&temp.file_id)?;

        tracing::info!(drive_id = %target.drive_id, file_id = %target.file_id, "File overwritten");
        self.publish(
            &drive,
            DriveNotification::FileChanged {
                header: header.clone(),
                previous: Some(existing),
            },
        );
        Ok(header)
    }

    /// Add or replace payloads of an active file. Incoming descriptors win
    /// by key; the others are kept. Returns the new version tag.
    pub fn update_payloads(
        &self,
        temp: InternalDriveFileId,
        target: InternalDriveFileId,
        mut incoming: Vec<PayloadDescriptor>,
        caller: &CallerContext,
    ) -> HostResult<Uuid> {
        let drive = self.assert_can_write(&target.drive_id, caller)?;
        for payload in &incoming {
            validate_payload_key(&payload.key)?;
        }
        let existing = self.existing_active_header(&target)?;

        let lts = self.lts(target.drive_id);
        lts.delete_missing_thumbnail_files(
            &target.file_id,
            &merge_payloads(&incoming, &existing.file_metadata.payloads),
        )?;
        self.move_staged_parts(&temp, &target, &mut incoming)?;

        let mut header = existing.clone();
        header.file_metadata.payloads = merge_payloads(&incoming, &existing.file_metadata.payloads);
        self.write_header(&mut header, false)?;
        self.tsm(temp.drive_id).ensure_all_deleted(&temp.file_id)?;

        let version_tag = header.file_metadata.version_tag.unwrap_or_default();
        self.publish(
            &drive,
            DriveNotification::FileChanged {
                header,
                previous: Some(existing),
            },
        );
        Ok(version_tag)
    }

    /// Merge thumbnails into one payload's thumbnail list. Same-size
    /// thumbnails are replaced. Returns the new version tag.
    pub fn update_attachments(
        &self,
        temp: InternalDriveFileId,
        target: InternalDriveFileId,
        payload_key: &str,
        thumbnails: Vec<ThumbnailDescriptor>,
        caller: &CallerContext,
    ) -> HostResult<Uuid> {
        let drive = self.assert_can_write(&target.drive_id, caller)?;
        let existing = self.existing_active_header(&target)?;

        let mut header = existing.clone();
        let payload = header
            .file_metadata
            .payloads
            .iter_mut()
            .find(|p| p.key == payload_key)
            .ok_or_else(|| {
                HostError::client(
                    ClientErrorCode::InvalidPayloadKey,
                    format!("file has no payload '{payload_key}'"),
                )
            })?;

        let mut staged = vec![PayloadDescriptor {
            key: payload.key.clone(),
            content_type: payload.content_type.clone(),
            last_modified: payload.last_modified,
            bytes_written: payload.bytes_written,
            thumbnails,
        }];
        let tsm = self.tsm(temp.drive_id);
        let payload_staged = tsm.exists(&temp.file_id, &payload_extension(payload_key));
        if payload_staged {
            tsm.ensure_deleted(&temp.file_id, &payload_extension(payload_key))?;
        }
        self.move_staged_parts(&temp, &target, &mut staged)?;

        for thumb in staged.remove(0).thumbnails {
            payload.thumbnails.retain(|t| !t.same_size(&thumb));
            payload.thumbnails.push(thumb);
        }
        payload.last_modified = unix_time_ms();

        self.write_header(&mut header, false)?;
        self.tsm(temp.drive_id).ensure_all_deleted(&temp.file_id)?;

        let version_tag = header.file_metadata.version_tag.unwrap_or_default();
        self.publish(
            &drive,
            DriveNotification::FileChanged {
                header,
                previous: Some(existing),
            },
        );
        Ok(version_tag)
    }

    /// Replace the metadata of an active file, keeping its payloads. An
    /// encrypted file gets a new key header IV with its existing AES key.
    pub fn overwrite_metadata(
        &self,
        new_key_header_iv: Option<[u8; 16]>,
        target: InternalDriveFileId,
        mut metadata: FileMetadata,
        mut server_metadata: ServerMetadata,
        caller: &CallerContext,
    ) -> HostResult<ServerFileHeader> {
        let drive = self.assert_can_write(&target.drive_id, caller)?;
        if metadata.is_encrypted && !new_key_header_iv.is_some_and(|iv| is_strong_iv(&iv)) {
            return Err(HostError::client(
                ClientErrorCode::InvalidKeyHeader,
                "key header iv is missing or too weak",
            ));
        }
        let existing = self.existing_active_header(&target)?;
        if existing.file_metadata.is_encrypted != metadata.is_encrypted {
            return Err(HostError::client(
                ClientErrorCode::CannotChangeEncryption,
                "cannot change encryption when only metadata is written",
            ));
        }
        assert_version_tag_match(existing.file_metadata.version_tag, metadata.version_tag)?;

        let stored = &existing.file_metadata;
        metadata.file = target;
        metadata.created = stored.created;
        metadata.global_transit_id = stored.global_transit_id;
        metadata.file_state = stored.file_state;
        metadata.payloads = stored.payloads.clone();
        metadata.app_data.content_is_complete = stored.app_data.content_is_complete;
        metadata.app_data.preview_thumbnail = stored.app_data.preview_thumbnail.clone();
        metadata.reaction_preview = stored.reaction_preview.clone();
        metadata.updated = stored.updated;
        server_metadata.file_system_type = existing.server_metadata.file_system_type;
        server_metadata.transfer_history = existing.server_metadata.transfer_history.clone();

        let encrypted_key_header = match (stored.is_encrypted, new_key_header_iv) {
            (true, Some(iv)) => {
                let storage_key = self.drives.storage_key(&drive, caller)?;
                let current = existing.encrypted_key_header.decrypt(&storage_key)?;
                let rotated = KeyHeader {
                    iv,
                    aes_key: current.aes_key.clone(),
                };
                rotated.encrypt(&storage_key)?
            }
            _ => existing.encrypted_key_header.clone(),
        };

        self.reserve_identity(&metadata)?;
        let mut header = ServerFileHeader {
            encrypted_key_header,
            file_metadata: metadata,
            server_metadata,
        };
        self.write_header(&mut header, false)?;
        self.tsm(target.drive_id).ensure_all_deleted(&target.file_id)?;

        self.publish(
            &drive,
            DriveNotification::FileChanged {
                header: header.clone(),
                previous: Some(existing),
            },
        );
        Ok(header)
    }

    // ========== Deletes ==========

    /// Replace the file with a Deleted header. The global transit id and
    /// ACL survive; content, payloads and the unique id do not.
    pub fn soft_delete_long_term_file(
        &self,
        file: &InternalDriveFileId,
        caller: &CallerContext,
    ) -> HostResult<ServerFileHeader> {
        let drive = self.assert_can_write(&file.drive_id, caller)?;
        let existing = self
            .lts(file.drive_id)
            .get_server_file_header(&file.file_id)?
            .ok_or_else(|| HostError::not_found(format!("file {}", file.file_id)))?;
        self.assert_valid_file_system_type(&existing.server_metadata)?;
        self.write_deleted_file_header(&drive, existing)
    }

    fn write_deleted_file_header(&self, drive: &StorageDrive, existing: ServerFileHeader) -> HostResult<ServerFileHeader> {
        let file = existing.file();
        let stored = &existing.file_metadata;

        let mut metadata = FileMetadata::new(file, AppData::default());
        metadata.file_state = FileState::Deleted;
        metadata.created = stored.created;
        metadata.updated = stored.updated;
        metadata.global_transit_id = stored.global_transit_id;
        metadata.sender_odin_id = stored.sender_odin_id.clone();

        let mut server_metadata = existing.server_metadata.clone();
        server_metadata.transfer_history = None;

        let mut deleted = ServerFileHeader {
            encrypted_key_header: existing.encrypted_key_header.clone(),
            file_metadata: metadata,
            server_metadata,
        };

        self.lts(file.drive_id).delete_attachments(&file.file_id)?;
        self.index.release_unique_id(&file)?;
        self.write_header(&mut deleted, false)?;

        tracing::info!(drive_id = %file.drive_id, file_id = %file.file_id, "File soft deleted");
        self.publish(
            drive,
            DriveNotification::FileDeleted {
                file,
                previous: Some(existing),
                header: Some(deleted.clone()),
                is_hard_delete: false,
            },
        );
        Ok(deleted)
    }

    /// Remove the header and every part, and free the identity keys.
    pub fn hard_delete_long_term_file(&self, file: &InternalDriveFileId, caller: &CallerContext) -> HostResult<()> {
        let drive = self.assert_can_write(&file.drive_id, caller)?;
        let lts = self.lts(file.drive_id);
        let previous = lts.get_server_file_header(&file.file_id)?;
        if let Some(previous) = &previous {
            self.assert_valid_file_system_type(&previous.server_metadata)?;
        }

        lts.hard_delete(&file.file_id)?;
        self.index.release_all(file)?;
        self.tsm(file.drive_id).ensure_all_deleted(&file.file_id)?;

        tracing::info!(drive_id = %file.drive_id, file_id = %file.file_id, "File hard deleted");
        self.publish(
            &drive,
            DriveNotification::FileDeleted {
                file: *file,
                previous,
                header: None,
                is_hard_delete: true,
            },
        );
        Ok(())
    }

    // ========== Reads ==========

    /// The stored header, after the drive read check and the file's ACL.
    pub fn get_server_file_header(
        &self,
        file: &InternalDriveFileId,
        caller: &CallerContext,
    ) -> HostResult<Option<ServerFileHeader>> {
        self.assert_can_read(&file.drive_id, caller)?;
        self.read_checked_header(file, caller)
    }

    fn read_checked_header(
        &self,
        file: &InternalDriveFileId,
        caller: &CallerContext,
    ) -> HostResult<Option<ServerFileHeader>> {
        let Some(header) = self.lts(file.drive_id).get_server_file_header(&file.file_id)? else {
            return Ok(None);
        };
        self.assert_valid_file_system_type(&header.server_metadata)?;
        if let Err(e) = self
            .authorizer
            .assert_caller_has_permission(caller, &header.server_metadata.access_control_list)
        {
            tracing::warn!(caller = ?caller.odin_id, file_id = %file.file_id, "File ACL denied read");
            return Err(e);
        }
        Ok(Some(header))
    }

    pub fn get_shared_secret_encrypted_header(
        &self,
        file: &InternalDriveFileId,
        caller: &CallerContext,
    ) -> HostResult<Option<SharedSecretEncryptedFileHeader>> {
        let drive = self.assert_can_read(&file.drive_id, caller)?;
        let Some(header) = self.read_checked_header(file, caller)? else {
            return Ok(None);
        };
        let storage_key = client_storage_key(&self.drives, &drive, caller)?;
        let client = convert_to_shared_secret_encrypted_client_file_header(
            header,
            drive.target_drive,
            storage_key.as_ref(),
            caller,
            ClientHeaderOptions::default(),
        )?;
        Ok(Some(client))
    }

    /// A payload, or a chunk of it. `None` when the file or payload is
    /// missing.
    pub fn get_payload_stream(
        &self,
        file: &InternalDriveFileId,
        key: &str,
        chunk: Option<FileChunk>,
        caller: &CallerContext,
    ) -> HostResult<Option<PartStream<PayloadDescriptor>>> {
        let Some(header) = self.get_server_file_header(file, caller)? else {
            return Ok(None);
        };
        let Some(descriptor) = header.file_metadata.payload(key).cloned() else {
            return Ok(None);
        };
        let bytes = self
            .lts(file.drive_id)
            .get_file_part_stream(&file.file_id, &FilePart::payload(key), chunk)?;
        Ok(bytes.map(|bytes| PartStream { descriptor, bytes }))
    }

    /// A thumbnail of `key`. Without `direct_match_only`, the smallest
    /// thumbnail covering the requested size is used when there is no exact
    /// match, else the largest one.
    pub fn get_thumbnail_stream(
        &self,
        file: &InternalDriveFileId,
        key: &str,
        width: u32,
        height: u32,
        direct_match_only: bool,
        caller: &CallerContext,
    ) -> HostResult<Option<PartStream<ThumbnailDescriptor>>> {
        let Some(header) = self.get_server_file_header(file, caller)? else {
            return Ok(None);
        };
        let Some(payload) = header.file_metadata.payload(key) else {
            return Ok(None);
        };
        let Some(descriptor) = select_thumbnail(&payload.thumbnails, width, height, direct_match_only).cloned() else {
            return Ok(None);
        };
        let part = FilePart::thumbnail(key, descriptor.pixel_width, descriptor.pixel_height);
        let bytes = self.lts(file.drive_id).get_file_part_stream(&file.file_id, &part, None)?;
        Ok(bytes.map(|bytes| PartStream { descriptor, bytes }))
    }

    // ========== Transfer bookkeeping ==========

    /// Record a delivery outcome for one recipient. Keeps the version tag
    /// and `updated` so clients do not see a content change.
    pub fn update_transfer_history(
        &self,
        file: &InternalDriveFileId,
        recipient: &OdinId,
        update: UpdateTransferHistoryData,
        caller: &CallerContext,
    ) -> HostResult<ServerFileHeader> {
        let drive = self.assert_can_read_or_write(&file.drive_id, caller)?;
        let header = {
            let _guard = self
                .history_lock
                .lock()
                .map_err(|_| HostError::system("transfer history lock poisoned"))?;

            let mut header = self
                .lts(file.drive_id)
                .get_server_file_header(&file.file_id)?
                .ok_or_else(|| HostError::not_found(format!("file {}", file.file_id)))?;
            self.assert_valid_file_system_type(&header.server_metadata)?;

            let history = header.server_metadata.transfer_history.get_or_insert_with(Default::default);
            let item = history.recipients.entry(recipient.as_str().to_string()).or_default();
            if let Some(in_outbox) = update.is_in_outbox {
                item.is_in_outbox = in_outbox;
            }
            if let Some(read) = update.is_read_by_recipient {
                item.is_read_by_recipient = read;
            }
            match update.latest_transfer_status {
                Some(LatestTransferStatus::Delivered) => {
                    item.latest_problem_status = None;
                    if let Some(tag) = update.version_tag {
                        item.latest_successfully_delivered_version_tag = Some(tag);
                    }
                }
                Some(LatestTransferStatus::Problem(problem)) => item.latest_problem_status = Some(problem),
                None => {}
            }
            item.last_updated = unix_time_ms();

            self.write_header(&mut header, true)?;
            header
        };

        tracing::debug!(
            file_id = %file.file_id,
            recipient = %recipient,
            status = ?update.latest_transfer_status,
            in_outbox = ?update.is_in_outbox,
            "Transfer history updated"
        );
        self.publish(
            &drive,
            DriveNotification::FileChanged {
                header: header.clone(),
                previous: None,
            },
        );
        Ok(header)
    }

    /// Mark the file with `global_transit_id` as read by `recipient`.
    /// Returns false when no such file exists on the drive.
    pub fn mark_file_as_read_by_recipient(
        &self,
        drive_id: &Uuid,
        global_transit_id: &Uuid,
        recipient: &OdinId,
        caller: &CallerContext,
    ) -> HostResult<bool> {
        let Some(file_id) = self.index.lookup_global_transit_id(drive_id, global_transit_id)? else {
            tracing::debug!(drive_id = %drive_id, gtid = %global_transit_id, "Read receipt for unknown file");
            return Ok(false);
        };
        let update = UpdateTransferHistoryData {
            is_read_by_recipient: Some(true),
            is_in_outbox: Some(false),
            ..Default::default()
        };
        self.update_transfer_history(&InternalDriveFileId::new(*drive_id, file_id), recipient, update, caller)?;
        Ok(true)
    }

    // ========== Feed drive ==========

    fn assert_feed_drive(&self, drive_id: &Uuid) -> HostResult<()> {
        let feed = self.drives.get_drive_id_by_alias(&TargetDrive::feed_drive(), false)?;
        if feed != Some(*drive_id) {
            return Err(HostError::system(format!("method cannot be used on drive {drive_id}")));
        }
        Ok(())
    }

    fn assert_feed_sender(header: &ServerFileHeader, caller: &CallerContext) -> HostResult<()> {
        let caller_id = caller.odin_id_or_fail()?;
        if header.file_metadata.sender_odin_id.as_ref() != Some(caller_id) {
            tracing::warn!(
                caller = %caller_id,
                sender = ?header.file_metadata.sender_odin_id,
                file_id = %header.file().file_id,
                "Feed file sender does not match caller"
            );
            return Err(HostError::security("invalid caller"));
        }
        Ok(())
    }

    /// Store a file distributed to this identity's feed. The caller makes
    /// sure it is not a duplicate.
    pub fn write_new_file_to_feed_drive(
        &self,
        key_header: &KeyHeader,
        mut metadata: FileMetadata,
        caller: &CallerContext,
    ) -> HostResult<ServerFileHeader> {
        let feed_drive_id = self
            .drives
            .get_drive_id_by_alias(&TargetDrive::feed_drive(), true)?
            .ok_or_else(|| HostError::system("feed drive is missing"))?;
        let file = self.create_internal_file_id(&feed_drive_id, caller)?;

        let mut server_metadata = ServerMetadata::new(AccessControlList::owner_only(), self.file_system_type);
        server_metadata.allow_distribution = false;
        // Feed items come from many identities, so unique ids could clash.
        metadata.app_data.unique_id = None;

        self.commit_new_file(file, key_header, metadata, server_metadata, true, caller)
    }

    pub fn replace_file_metadata_on_feed_drive(
        &self,
        file: InternalDriveFileId,
        mut metadata: FileMetadata,
        bypass_caller_check: bool,
        caller: &CallerContext,
    ) -> HostResult<()> {
        self.assert_feed_drive(&file.drive_id)?;
        let drive = self.assert_can_write(&file.drive_id, caller)?;
        let mut header = self
            .lts(file.drive_id)
            .get_server_file_header(&file.file_id)?
            .ok_or_else(|| HostError::not_found(format!("feed file {}", file.file_id)))?;
        self.assert_valid_file_system_type(&header.server_metadata)?;

        if !header.is_active() {
            tracing::debug!(file_id = %file.file_id, "Ignoring feed metadata update of a deleted file");
            return Ok(());
        }
        if !bypass_caller_check {
            Self::assert_feed_sender(&header, caller)?;
        }

        metadata.app_data.unique_id = None;
        header.file_metadata = metadata;
        self.update_active_file_header_internal(&drive, file, header, false, true)?;
        Ok(())
    }

    pub fn remove_feed_drive_file(&self, file: &InternalDriveFileId, caller: &CallerContext) -> HostResult<()> {
        self.assert_feed_drive(&file.drive_id)?;
        let drive = self.assert_can_write(&file.drive_id, caller)?;
        let header = self
            .lts(file.drive_id)
            .get_server_file_header(&file.file_id)?
            .ok_or_else(|| HostError::not_found(format!("feed file {}", file.file_id)))?;
        self.assert_valid_file_system_type(&header.server_metadata)?;
        Self::assert_feed_sender(&header, caller)?;
        self.write_deleted_file_header(&drive, header)?;
        Ok(())
    }

    pub fn update_reaction_preview_on_feed_drive(
        &self,
        file: &InternalDriveFileId,
        summary: Option<ReactionSummary>,
        caller: &CallerContext,
    ) -> HostResult<()> {
        self.assert_feed_drive(&file.drive_id)?;
        let drive = self.assert_can_write(&file.drive_id, caller)?;
        let mut header = self
            .lts(file.drive_id)
            .get_server_file_header(&file.file_id)?
            .ok_or_else(|| HostError::not_found(format!("feed file {}", file.file_id)))?;
        self.assert_valid_file_system_type(&header.server_metadata)?;

        if !header.is_active() {
            tracing::debug!(file_id = %file.file_id, "Ignoring reaction preview of a deleted feed file");
            return Ok(());
        }
        Self::assert_feed_sender(&header, caller)?;

        header.file_metadata.reaction_preview = summary;
        self.write_header(&mut header, false)?;
        self.tsm(file.drive_id).ensure_all_deleted(&file.file_id)?;

        self.publish(&drive, DriveNotification::ReactionPreviewUpdated { header });
        Ok(())
    }
}

fn assert_version_tag_match(stored: Option<Uuid>, incoming: Option<Uuid>) -> HostResult<()> {
    if stored != incoming {
        return Err(HostError::client(
            ClientErrorCode::VersionTagMismatch,
            format!(
                "version tag {} does not match the stored {}",
                incoming.unwrap_or_default(),
                stored.unwrap_or_default()
            ),
        ));
    }
    Ok(())
}

fn is_strong_iv(iv: &[u8; 16]) -> bool {
    iv.iter().any(|b| *b != iv[0])
}

/// `incoming` followed by every `existing` payload whose key it lacks.
fn merge_payloads(incoming: &[PayloadDescriptor], existing: &[PayloadDescriptor]) -> Vec<PayloadDescriptor> {
    let mut merged = incoming.to_vec();
    merged.extend(
        existing
            .iter()
            .filter(|e| !incoming.iter().any(|p| p.key == e.key))
            .cloned(),
    );
    merged
}

fn select_thumbnail(
    thumbnails: &[ThumbnailDescriptor],
    width: u32,
    height: u32,
    direct_match_only: bool,
) -> Option<&ThumbnailDescriptor> {
    if let Some(exact) = thumbnails
        .iter()
        .find(|t| t.pixel_width == width && t.pixel_height == height)
    {
        return Some(exact);
    }
    if direct_match_only {
        return None;
    }
    let area = |t: &&ThumbnailDescriptor| u64::from(t.pixel_width) * u64::from(t.pixel_height);
    thumbnails
        .iter()
        .filter(|t| t.pixel_width >= width && t.pixel_height >= height)
        .min_by_key(area)
        .or_else(|| thumbnails.iter().max_by_key(area))
}
