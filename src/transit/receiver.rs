// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Incoming transfers: the perimeter that stages them and the inbox
//! processing that writes them to drives.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::inbox::TransferBoxItem;
use super::{
    DeleteLinkedFileRequest, InstructionType, PeerTransferResponse, ReadReceiptRequest, TransferFileType,
    TransferInstructionSet, TransitInbox,
};
use crate::config::TransitConfig;
use crate::crypto::KeyHeader;
use crate::drive::{
    DriveFileSystem, DriveManager, FileMetadata, FileSystemResolver, InternalDriveFileId, ServerMetadata,
    TargetDrive,
};
use crate::error::{ClientErrorCode, HostError, HostResult};
use crate::identity::{
    AccessControlList, CallerContext, CircleNetwork, DriveGrant, DrivePermission, OdinId, SecurityGroup,
};
use crate::keys::OfflineKeyService;
use crate::storage::temp::{payload_extension, thumbnail_extension};

/// Temp extension of a staged transfer's metadata.
const METADATA_EXTENSION: &str = "metadata";

#[derive(Debug, Clone)]
pub struct IncomingPayload {
    pub key: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct IncomingThumbnail {
    pub key: String,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// The parts of a host-to-host upload.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
    pub instruction_set: TransferInstructionSet,
    /// Metadata JSON as sent.
    pub metadata: Vec<u8>,
    pub payloads: Vec<IncomingPayload>,
    pub thumbnails: Vec<IncomingThumbnail>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxBatchResult {
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl InboxBatchResult {
    fn add(&mut self, other: InboxBatchResult) {
        self.processed += other.processed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

pub struct TransitReceiver {
    files: FileSystemResolver,
    drives: Arc<DriveManager>,
    inbox: Arc<TransitInbox>,
    keys: OfflineKeyService,
    network: Arc<dyn CircleNetwork>,
    system: CallerContext,
    config: TransitConfig,
}

impl TransitReceiver {
    pub fn new(
        files: FileSystemResolver,
        drives: Arc<DriveManager>,
        inbox: Arc<TransitInbox>,
        keys: OfflineKeyService,
        network: Arc<dyn CircleNetwork>,
        system: CallerContext,
        config: TransitConfig,
    ) -> Self {
        Self {
            files,
            drives,
            inbox,
            keys,
            network,
            system,
            config,
        }
    }

    pub fn inbox(&self) -> &TransitInbox {
        &self.inbox
    }

    pub fn offline_keys(&self) -> &OfflineKeyService {
        &self.keys
    }

    /// Inbox items waiting across all drives.
    pub fn pending_inbox_items(&self) -> HostResult<usize> {
        let mut total = 0;
        for drive in self.drives.all_drives()? {
            total += self.inbox.count(&drive.id)?;
        }
        Ok(total)
    }

    // ========== Perimeter ==========

    /// Authenticate a peer request and build its caller context with the
    /// drive grants of the connection.
    pub async fn peer_caller(&self, sender: &OdinId, token: &str) -> HostResult<CallerContext> {
        if !sender.is_valid() || !self.network.verify_peer_token(sender, token).await {
            warn!(sender = %sender, "Rejected peer request with invalid token");
            return Err(HostError::security("invalid peer token"));
        }
        let connection = self.network.connection(sender).await.unwrap_or_default();
        let mut caller = CallerContext::peer(sender.clone(), SecurityGroup::Connected, connection.circles, None);
        for (target, permission) in connection.drive_grants {
            if let Some(drive_id) = self.drives.get_drive_id_by_alias(&target, false)? {
                caller = caller.with_drive_grant(
                    drive_id,
                    DriveGrant {
                        permission,
                        storage_key: None,
                    },
                );
            }
        }
        Ok(caller)
    }

    fn target_drive_id(&self, target: &TargetDrive) -> HostResult<Uuid> {
        self.drives
            .get_drive_id_by_alias(target, false)?
            .ok_or_else(|| HostError::client(ClientErrorCode::InvalidTargetDrive, format!("unknown drive {target}")))
    }

    /// Stage an incoming file and queue it for processing.
    pub fn accept_transfer(&self, incoming: IncomingTransfer, caller: &CallerContext) -> HostResult<PeerTransferResponse> {
        let sender = caller.odin_id_or_fail()?.clone();
        let set = incoming.instruction_set;
        let drive_id = self.target_drive_id(&set.target_drive)?;

        if set.transfer_file_type == TransferFileType::EncryptedFileForFeed {
            if set.target_drive != TargetDrive::feed_drive() {
                return Err(HostError::client(
                    ClientErrorCode::InvalidTransferType,
                    "feed files must target the feed drive",
                ));
            }
        } else {
            caller.assert_drive_permission(&drive_id, DrivePermission::WRITE)?;
        }

        let metadata: FileMetadata = serde_json::from_slice(&incoming.metadata)
            .map_err(|e| HostError::client(ClientErrorCode::MissingUploadData, format!("invalid metadata: {e}")))?;

        let fs = self.files.resolve(set.file_system_type);
        let temp = fs.storage.create_internal_file_id(&drive_id, &self.system)?;
        fs.storage
            .write_temp_stream(&temp, METADATA_EXTENSION, &incoming.metadata, &self.system)?;
        for payload in &incoming.payloads {
            fs.storage
                .write_temp_stream(&temp, &payload_extension(&payload.key), &payload.bytes, &self.system)?;
        }
        for thumb in &incoming.thumbnails {
            fs.storage.write_temp_stream(
                &temp,
                &thumbnail_extension(&thumb.key, thumb.width, thumb.height),
                &thumb.bytes,
                &self.system,
            )?;
        }

        let mut item = TransferBoxItem::new(drive_id, temp.file_id, sender.clone(), InstructionType::SaveFile);
        item.transfer_file_type = set.transfer_file_type;
        item.file_system_type = set.file_system_type;
        item.global_transit_id = metadata.global_transit_id;
        item.instruction_set = Some(set);
        self.inbox.add(&item)?;

        info!(
            sender = %sender,
            drive_id = %drive_id,
            marker = %item.marker,
            payloads = incoming.payloads.len(),
            "Transfer accepted into inbox"
        );
        Ok(PeerTransferResponse::accepted_into_inbox())
    }

    pub fn accept_delete_linked_file(
        &self,
        request: &DeleteLinkedFileRequest,
        caller: &CallerContext,
    ) -> HostResult<PeerTransferResponse> {
        let sender = caller.odin_id_or_fail()?.clone();
        let drive_id = self.target_drive_id(&request.target_drive)?;
        if request.target_drive != TargetDrive::feed_drive() {
            caller.assert_drive_permission(&drive_id, DrivePermission::WRITE)?;
        }

        let mut item = TransferBoxItem::new(drive_id, Uuid::nil(), sender, InstructionType::DeleteLinkedFile);
        item.file_system_type = request.file_system_type;
        item.global_transit_id = Some(request.global_transit_id);
        self.inbox.add(&item)?;
        debug!(gtid = %request.global_transit_id, "Delete linked file accepted into inbox");
        Ok(PeerTransferResponse::accepted_into_inbox())
    }

    pub fn accept_read_receipt(
        &self,
        request: &ReadReceiptRequest,
        caller: &CallerContext,
    ) -> HostResult<PeerTransferResponse> {
        let sender = caller.odin_id_or_fail()?.clone();
        let drive_id = self.target_drive_id(&request.target_drive)?;
        let fs = self.files.resolve(request.file_system_type);
        if fs
            .query
            .resolve_global_transit_id(&drive_id, &request.global_transit_id)?
            .is_none()
        {
            return Err(HostError::not_found(format!("file {}", request.global_transit_id)));
        }

        let mut item = TransferBoxItem::new(drive_id, Uuid::nil(), sender, InstructionType::ReadReceipt);
        item.file_system_type = request.file_system_type;
        item.global_transit_id = Some(request.global_transit_id);
        self.inbox.add(&item)?;
        Ok(PeerTransferResponse::accepted_into_inbox())
    }

    // ========== Inbox processing ==========

    /// Apply up to `batch_size` inbox items of one drive. Each item is
    /// handled on its own; one failing item never fails the batch.
    pub fn process_incoming_transit_instructions(
        &self,
        target_drive: &TargetDrive,
        batch_size: usize,
    ) -> HostResult<InboxBatchResult> {
        let drive_id = self.target_drive_id(target_drive)?;
        self.process_drive(&drive_id, batch_size)
    }

    /// One batch for every drive.
    pub fn process_all(&self) -> HostResult<InboxBatchResult> {
        let mut total = InboxBatchResult::default();
        for drive in self.drives.all_drives()? {
            total.add(self.process_drive(&drive.id, self.config.inbox_batch_size)?);
        }
        Ok(total)
    }

    fn process_drive(&self, drive_id: &Uuid, batch_size: usize) -> HostResult<InboxBatchResult> {
        let mut result = InboxBatchResult::default();
        for item in self.inbox.pop_batch(drive_id, batch_size)? {
            match self.process_item(&item) {
                Ok(()) => {
                    self.inbox.mark_complete(&item)?;
                    self.cleanup(&item);
                    result.processed += 1;
                }
                Err(e) if is_permanent(&e) || item.attempt_count + 1 >= self.config.inbox_max_attempts => {
                    warn!(
                        marker = %item.marker,
                        sender = %item.sender,
                        attempts = item.attempt_count + 1,
                        error = %e,
                        "Inbox item dead-lettered"
                    );
                    self.inbox.dead_letter(&item)?;
                    self.cleanup(&item);
                    result.dead_lettered += 1;
                }
                Err(e) => {
                    warn!(marker = %item.marker, error = %e, "Inbox item failed; will retry");
                    self.inbox.mark_failure(&item)?;
                    result.retried += 1;
                }
            }
        }
        if result != InboxBatchResult::default() {
            debug!(drive_id = %drive_id, ?result, "Inbox batch processed");
        }
        Ok(result)
    }

    fn cleanup(&self, item: &TransferBoxItem) {
        if item.instruction_type != InstructionType::SaveFile {
            return;
        }
        let fs = self.files.resolve(item.file_system_type);
        if let Err(e) = fs.storage.delete_temp_file(&item.temp_file(), &self.system) {
            warn!(file_id = %item.file_id, error = %e, "Failed to clean up staged transfer");
        }
    }

    fn process_item(&self, item: &TransferBoxItem) -> HostResult<()> {
        match item.instruction_type {
            InstructionType::SaveFile => self.save_file(item),
            InstructionType::DeleteLinkedFile => self.delete_linked_file(item),
            InstructionType::ReadReceipt => self.apply_read_receipt(item),
        }
    }

    fn save_file(&self, item: &TransferBoxItem) -> HostResult<()> {
        let set = item.instruction_set.as_ref().ok_or_else(|| {
            HostError::client(ClientErrorCode::InvalidInstructionSet, "transfer instruction set missing")
        })?;
        let key_header = self.keys.open_envelope(&set.transfer_key)?;

        let fs = self.files.resolve(item.file_system_type);
        let temp = item.temp_file();
        let raw = fs
            .storage
            .get_temp_stream(&temp, METADATA_EXTENSION, &self.system)?
            .ok_or_else(|| HostError::client(ClientErrorCode::MissingUploadData, "staged metadata missing"))?;
        let mut metadata: FileMetadata = serde_json::from_slice(&raw)?;
        metadata.sender_odin_id = Some(item.sender.clone());

        // Received files are private to the tenant and never redistributed.
        let mut server_metadata = ServerMetadata::new(AccessControlList::owner_only(), item.file_system_type);
        server_metadata.allow_distribution = false;

        match item.transfer_file_type {
            TransferFileType::CommandMessage => {
                let header = fs
                    .storage
                    .commit_new_file(temp, &key_header, metadata, server_metadata, false, &self.system)?;
                fs.commands.add(&item.drive_id, &[header.file().file_id])?;
                Ok(())
            }
            TransferFileType::Normal => {
                self.store_normal_file(fs, item, &key_header, metadata, server_metadata)
            }
            TransferFileType::EncryptedFileForFeed => self.store_feed_file(fs, item, &key_header, metadata),
        }
    }

    fn store_normal_file(
        &self,
        fs: &DriveFileSystem,
        item: &TransferBoxItem,
        key_header: &KeyHeader,
        mut metadata: FileMetadata,
        server_metadata: ServerMetadata,
    ) -> HostResult<()> {
        let temp = item.temp_file();
        let Some(target) = find_existing_file(fs, &item.drive_id, &metadata)? else {
            let header = fs
                .storage
                .commit_new_file(temp, key_header, metadata, server_metadata, false, &self.system)?;
            info!(file_id = %header.file().file_id, sender = %item.sender, "Received new file");
            return Ok(());
        };

        let existing = fs
            .storage
            .get_server_file_header(&target, &self.system)?
            .ok_or_else(|| HostError::not_found(format!("file {}", target.file_id)))?;
        if !existing.is_active() {
            return Err(HostError::client(
                ClientErrorCode::CannotUpdateNonActiveFile,
                format!("file {} is not active", target.file_id),
            ));
        }
        assert_original_sender(&existing.file_metadata, &item.sender)?;

        metadata.version_tag = existing.file_metadata.version_tag;
        fs.storage
            .overwrite_file(temp, target, key_header, metadata, server_metadata, &self.system)?;
        info!(file_id = %target.file_id, sender = %item.sender, "Received update of existing file");
        Ok(())
    }

    fn store_feed_file(
        &self,
        fs: &DriveFileSystem,
        item: &TransferBoxItem,
        key_header: &KeyHeader,
        mut metadata: FileMetadata,
    ) -> HostResult<()> {
        let gtid = metadata.global_transit_id.ok_or_else(|| {
            HostError::client(ClientErrorCode::InvalidInstructionSet, "feed files need a global transit id")
        })?;
        metadata.app_data.unique_id = None;

        match fs.query.resolve_global_transit_id(&item.drive_id, &gtid)? {
            Some(existing) => {
                let caller = self.feed_sender_caller(item);
                fs.storage
                    .replace_file_metadata_on_feed_drive(existing, metadata, false, &caller)?;
                debug!(file_id = %existing.file_id, sender = %item.sender, "Feed file updated");
            }
            None => {
                let header = fs.storage.write_new_file_to_feed_drive(key_header, metadata, &self.system)?;
                debug!(file_id = %header.file().file_id, sender = %item.sender, "Feed file stored");
            }
        }
        Ok(())
    }

    /// The sender acting on the feed drive.
    fn feed_sender_caller(&self, item: &TransferBoxItem) -> CallerContext {
        CallerContext::peer(item.sender.clone(), SecurityGroup::Connected, Vec::new(), None).with_drive_grant(
            item.drive_id,
            DriveGrant {
                permission: DrivePermission::WRITE,
                storage_key: None,
            },
        )
    }

    fn delete_linked_file(&self, item: &TransferBoxItem) -> HostResult<()> {
        let gtid = item.global_transit_id.ok_or_else(|| {
            HostError::client(ClientErrorCode::InvalidInstructionSet, "global transit id missing")
        })?;
        let fs = self.files.resolve(item.file_system_type);
        let Some(file) = fs.query.resolve_global_transit_id(&item.drive_id, &gtid)? else {
            debug!(gtid = %gtid, "Delete for unknown file ignored");
            return Ok(());
        };
        let Some(header) = fs.storage.get_server_file_header(&file, &self.system)? else {
            return Ok(());
        };
        if !header.is_active() {
            return Ok(());
        }
        assert_original_sender(&header.file_metadata, &item.sender)?;

        let drive = self.drives.require_drive(&item.drive_id)?;
        if drive.is_feed_drive() {
            fs.storage.remove_feed_drive_file(&file, &self.feed_sender_caller(item))?;
        } else {
            fs.storage.soft_delete_long_term_file(&file, &self.system)?;
        }
        info!(file_id = %file.file_id, sender = %item.sender, "Linked file deleted");
        Ok(())
    }

    fn apply_read_receipt(&self, item: &TransferBoxItem) -> HostResult<()> {
        let gtid = item.global_transit_id.ok_or_else(|| {
            HostError::client(ClientErrorCode::InvalidInstructionSet, "global transit id missing")
        })?;
        let fs = self.files.resolve(item.file_system_type);
        if !fs
            .storage
            .mark_file_as_read_by_recipient(&item.drive_id, &gtid, &item.sender, &self.system)?
        {
            debug!(gtid = %gtid, "Read receipt for unknown file ignored");
        }
        Ok(())
    }
}

/// Resolve the local file an incoming file updates, by unique id and
/// global transit id. When both are given they must agree.
fn find_existing_file(
    fs: &DriveFileSystem,
    drive_id: &Uuid,
    metadata: &FileMetadata,
) -> HostResult<Option<InternalDriveFileId>> {
    let by_unique_id = match metadata.app_data.unique_id {
        Some(uid) => fs.query.resolve_unique_id(drive_id, &uid)?,
        None => None,
    };
    let by_gtid = match metadata.global_transit_id {
        Some(gtid) => fs.query.resolve_global_transit_id(drive_id, &gtid)?,
        None => None,
    };

    match (metadata.app_data.unique_id.is_some(), metadata.global_transit_id.is_some()) {
        (true, true) => match (by_unique_id, by_gtid) {
            (None, None) => Ok(None),
            (Some(a), Some(b)) if a == b => Ok(Some(a)),
            _ => Err(HostError::security(
                "Invalid write; UniqueId and GlobalTransitId are not the same file",
            )),
        },
        _ => Ok(by_unique_id.or(by_gtid)),
    }
}

fn assert_original_sender(existing: &FileMetadata, sender: &OdinId) -> HostResult<()> {
    if existing.sender_odin_id.as_ref() != Some(sender) {
        warn!(
            file_id = %existing.file.file_id,
            sender = %sender,
            original = ?existing.sender_odin_id,
            "Sender does not match the original sender"
        );
        return Err(HostError::security("sender does not match the original sender"));
    }
    Ok(())
}

/// Errors another attempt cannot fix.
fn is_permanent(error: &HostError) -> bool {
    matches!(
        error,
        HostError::Client { .. }
            | HostError::Security(_)
            | HostError::NotFound(_)
            | HostError::Crypto(_)
            | HostError::Serde(_)
    )
}
