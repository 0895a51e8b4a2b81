// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Outgoing transfers: building outbox items and delivering them.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::outbox::{new_outbox_item, OutboxItem, PendingTransferKey};
use super::transport::{HostToHostTransfer, OutgoingPayload, OutgoingThumbnail, PeerTransportError, TransportResult};
use super::{
    DeleteLinkedFileRequest, FileTransferOptions, PeerResponseCode, PeerTransferResponse, PeerTransport,
    PublicKeyDirectory, ReadReceiptRequest, ScheduleOptions, TransferFailureReason, TransferFileType,
    TransferInstructionSet, TransferStatus, TransitOptions, TransitOutbox,
};
use crate::config::TransitConfig;
use crate::crypto::{KeyHeader, SymmetricKey};
use crate::drive::storage_service::{LatestTransferStatus, UpdateTransferHistoryData};
use crate::drive::{
    unix_time_ms, DriveFileSystem, DriveManager, FileMetadata, FileSystemResolver, FileSystemType,
    InternalDriveFileId, LatestProblemStatus, ServerFileHeader, StorageDrive, TargetDrive,
};
use crate::error::{ClientErrorCode, HostError, HostResult};
use crate::identity::{CallerContext, CircleNetwork, ClientAuthToken, DriveAclAuthorizer, OdinId};

/// Per-recipient statuses, keyed by recipient domain.
pub type TransferStatusMap = BTreeMap<String, TransferStatus>;

/// Outcome of one delivery: response code and the version delivered.
type DeliveryOutcome = Result<(PeerResponseCode, Option<Uuid>), TransferFailureReason>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryMode {
    /// The client waits for the result and owns retries of server failures.
    SendNow,
    Background,
}

pub struct TransitSender {
    files: FileSystemResolver,
    drives: Arc<DriveManager>,
    outbox: Arc<TransitOutbox>,
    transport: Arc<dyn PeerTransport>,
    directory: Arc<dyn PublicKeyDirectory>,
    network: Arc<dyn CircleNetwork>,
    authorizer: Arc<dyn DriveAclAuthorizer>,
    sealing_key: SymmetricKey,
    /// Acts for the tenant in background work.
    system: CallerContext,
    config: TransitConfig,
}

impl TransitSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        files: FileSystemResolver,
        drives: Arc<DriveManager>,
        outbox: Arc<TransitOutbox>,
        transport: Arc<dyn PeerTransport>,
        directory: Arc<dyn PublicKeyDirectory>,
        network: Arc<dyn CircleNetwork>,
        authorizer: Arc<dyn DriveAclAuthorizer>,
        sealing_key: SymmetricKey,
        system: CallerContext,
        config: TransitConfig,
    ) -> Self {
        Self {
            files,
            drives,
            outbox,
            transport,
            directory,
            network,
            authorizer,
            sealing_key,
            system,
            config,
        }
    }

    pub fn outbox(&self) -> &TransitOutbox {
        &self.outbox
    }

    fn fs(&self, file_system_type: FileSystemType) -> &Arc<DriveFileSystem> {
        self.files.resolve(file_system_type)
    }

    // ========== Sending ==========

    /// Send a file to each recipient.
    pub async fn send_file(
        &self,
        file: InternalDriveFileId,
        options: TransitOptions,
        transfer: FileTransferOptions,
        caller: &CallerContext,
    ) -> HostResult<TransferStatusMap> {
        let recipients = self.validate_recipients(&options.recipients)?;
        let fs = self.fs(transfer.file_system_type);
        let header = fs
            .storage
            .get_server_file_header(&file, caller)?
            .ok_or_else(|| HostError::not_found(format!("file {}", file.file_id)))?;
        if !header.is_active() {
            return Err(HostError::client(
                ClientErrorCode::CannotUpdateNonActiveFile,
                "cannot send a deleted file",
            ));
        }

        if !header.server_metadata.allow_distribution {
            warn!(file_id = %file.file_id, "File does not allow distribution; nothing sent");
            return Ok(recipients
                .iter()
                .map(|r| (r.as_str().to_string(), TransferStatus::FileDoesNotAllowDistribution))
                .collect());
        }

        let drive = self.drives.require_drive(&file.drive_id)?;
        let target_drive = remote_target_drive(&drive, &options, transfer)?;
        let key_header = self.file_key_header(&drive, &header)?;
        let send_now = options.schedule == ScheduleOptions::SendNowAwaitResponse;

        let mut statuses = TransferStatusMap::new();
        let mut checked_out = Vec::new();
        for recipient in recipients {
            match self
                .prepare_item(file, &recipient, &key_header, target_drive, &options, transfer)
                .await?
            {
                Some(mut item) => {
                    if send_now {
                        item.checked_out_at = Some(unix_time_ms());
                    }
                    self.outbox.add(&item)?;
                    self.record_history(&item.file, &recipient, transfer.file_system_type, in_outbox(None));
                    if send_now {
                        checked_out.push(item);
                    } else {
                        statuses.insert(recipient.as_str().to_string(), TransferStatus::Enqueued);
                    }
                }
                None => {
                    let pending = PendingTransferKey {
                        marker: Uuid::now_v7(),
                        file,
                        recipient: recipient.clone(),
                        options: options.clone(),
                        transfer,
                        attempt_count: 0,
                        added: unix_time_ms(),
                    };
                    self.outbox.enqueue_transfer_key(&pending)?;
                    self.record_history(&file, &recipient, transfer.file_system_type, in_outbox(None));
                    statuses.insert(recipient.as_str().to_string(), TransferStatus::AwaitingTransferKey);
                }
            }
        }

        if !checked_out.is_empty() {
            let outcomes = join_all(checked_out.iter().map(|item| self.deliver(item))).await;
            for (item, outcome) in checked_out.iter().zip(outcomes) {
                let status = self.finish(item, outcome, DeliveryMode::SendNow)?;
                statuses.insert(item.recipient.as_str().to_string(), status);
            }
        }

        info!(
            file_id = %file.file_id,
            recipients = statuses.len(),
            send_now,
            "File queued for transit"
        );
        Ok(statuses)
    }

    fn validate_recipients(&self, recipients: &[OdinId]) -> HostResult<Vec<OdinId>> {
        if recipients.is_empty() {
            return Err(HostError::client(
                ClientErrorCode::InvalidRecipient,
                "at least one recipient is required",
            ));
        }
        let tenant = self.system.odin_id_or_fail()?;
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for recipient in recipients {
            if !recipient.is_valid() {
                return Err(HostError::client(
                    ClientErrorCode::InvalidRecipient,
                    format!("invalid recipient {recipient}"),
                ));
            }
            if recipient == tenant {
                return Err(HostError::client(
                    ClientErrorCode::InvalidRecipient,
                    "cannot send a file to yourself",
                ));
            }
            if seen.insert(recipient.clone()) {
                unique.push(recipient.clone());
            }
        }
        Ok(unique)
    }

    fn file_key_header(&self, drive: &StorageDrive, header: &ServerFileHeader) -> HostResult<KeyHeader> {
        if !header.file_metadata.is_encrypted {
            return Ok(KeyHeader::empty());
        }
        let storage_key = self.drives.storage_key(drive, &self.system)?;
        Ok(header.encrypted_key_header.decrypt(&storage_key)?)
    }

    /// Seal the key header for `recipient` and build its outbox item.
    /// `None` when the recipient's public key or auth token is not
    /// available yet.
    async fn prepare_item(
        &self,
        file: InternalDriveFileId,
        recipient: &OdinId,
        key_header: &KeyHeader,
        target_drive: TargetDrive,
        options: &TransitOptions,
        transfer: FileTransferOptions,
    ) -> HostResult<Option<OutboxItem>> {
        let Some(public_key) = self.directory.public_key(recipient).await else {
            debug!(recipient = %recipient, "No public key for recipient");
            return Ok(None);
        };
        let Some(token) = self.network.client_auth_token(recipient).await else {
            debug!(recipient = %recipient, "No client auth token for recipient");
            return Ok(None);
        };

        let instruction_set = TransferInstructionSet {
            transfer_key: key_header.seal_for_recipient(&public_key)?,
            target_drive,
            transfer_file_type: transfer.transfer_file_type,
            file_system_type: transfer.file_system_type,
            contents_provided: options.send_contents,
        };
        let sealed_token = self.sealing_key.encrypt(token.as_str().as_bytes())?;
        Ok(Some(new_outbox_item(
            file,
            recipient.clone(),
            instruction_set,
            sealed_token,
            options.clone(),
            transfer,
        )))
    }

    // ========== Delivery ==========

    /// Deliver every due outbox item on every drive. Returns the number of
    /// items handled.
    pub async fn process_outbox(&self) -> HostResult<usize> {
        let now = unix_time_ms();
        let mut processed = 0;
        for drive in self.drives.all_drives()? {
            let items = self
                .outbox
                .checkout_batch(&drive.id, self.config.outbox_batch_size, now)?;
            if items.is_empty() {
                continue;
            }
            let outcomes = join_all(items.iter().map(|item| self.deliver(item))).await;
            for (item, outcome) in items.iter().zip(outcomes) {
                self.finish(item, outcome, DeliveryMode::Background)?;
                processed += 1;
            }
        }
        if processed > 0 {
            debug!(processed, "Outbox batch processed");
        }
        Ok(processed)
    }

    /// Retry public key resolution for queued recipients and move the ones
    /// that resolve into the outbox.
    pub async fn process_transfer_key_queue(&self) -> HostResult<usize> {
        let mut moved = 0;
        for pending in self.outbox.pending_transfer_keys(self.config.outbox_batch_size)? {
            let fs = self.fs(pending.transfer.file_system_type);
            let header = match fs.storage.get_server_file_header(&pending.file, &self.system) {
                Ok(Some(header)) if header.is_active() => header,
                Ok(_) => {
                    debug!(file_id = %pending.file.file_id, "Queued file is gone; dropping transfer key item");
                    self.outbox.remove_transfer_key(&pending.marker)?;
                    continue;
                }
                Err(e) => {
                    warn!(file_id = %pending.file.file_id, error = %e, "Cannot read queued file");
                    self.outbox.remove_transfer_key(&pending.marker)?;
                    continue;
                }
            };

            let drive = self.drives.require_drive(&pending.file.drive_id)?;
            let target_drive = remote_target_drive(&drive, &pending.options, pending.transfer)?;
            let key_header = self.file_key_header(&drive, &header)?;
            let item = self
                .prepare_item(
                    pending.file,
                    &pending.recipient,
                    &key_header,
                    target_drive,
                    &pending.options,
                    pending.transfer,
                )
                .await?;

            match item {
                Some(item) => {
                    self.outbox.add(&item)?;
                    self.outbox.remove_transfer_key(&pending.marker)?;
                    moved += 1;
                }
                None if pending.attempt_count + 1 >= self.config.outbox_max_attempts => {
                    warn!(
                        recipient = %pending.recipient,
                        attempts = pending.attempt_count + 1,
                        "Giving up on resolving transfer key"
                    );
                    self.outbox.remove_transfer_key(&pending.marker)?;
                    self.record_history(
                        &pending.file,
                        &pending.recipient,
                        pending.transfer.file_system_type,
                        problem(LatestProblemStatus::ClientMustRetry),
                    );
                }
                None => {
                    let mut retry = pending.clone();
                    retry.attempt_count += 1;
                    self.outbox.enqueue_transfer_key(&retry)?;
                }
            }
        }
        Ok(moved)
    }

    async fn deliver(&self, item: &OutboxItem) -> DeliveryOutcome {
        let transfer = self.build_transfer(item).await?;
        let token = self.unseal_token(item).map_err(|e| {
            warn!(marker = %item.marker, error = %e, "Cannot unseal client auth token");
            TransferFailureReason::UnknownError
        })?;
        let version_tag = transfer.metadata.version_tag;

        self.with_retry(|| self.transport.send_file(&item.recipient, &token, &transfer))
            .await
            .map(|response| (response.code, version_tag))
            .map_err(|e| {
                let reason = classify_transport_error(&e);
                warn!(recipient = %item.recipient, error = %e, reason = ?reason, "Delivery failed");
                reason
            })
    }

    async fn build_transfer(&self, item: &OutboxItem) -> Result<HostToHostTransfer, TransferFailureReason> {
        let fs = self.fs(item.transfer.file_system_type);
        let header = match fs.storage.get_server_file_header(&item.file, &self.system) {
            Ok(Some(header)) => header,
            Ok(None) => {
                warn!(file_id = %item.file.file_id, "Outbox file no longer exists");
                return Err(TransferFailureReason::UnknownError);
            }
            Err(e) => {
                warn!(file_id = %item.file.file_id, error = %e, "Cannot read outbox file");
                return Err(TransferFailureReason::UnknownError);
            }
        };

        if !self
            .authorizer
            .identity_has_permission(&item.recipient, &header.server_metadata.access_control_list)
            .await
        {
            return Err(TransferFailureReason::RecipientDoesNotHavePermissionToFileAcl);
        }
        if !header.server_metadata.allow_distribution {
            return Err(TransferFailureReason::FileDoesNotAllowDistribution);
        }
        let Some(instruction_set) = item.instruction_set.clone() else {
            return Err(TransferFailureReason::EncryptedTransferInstructionSetNotAvailable);
        };

        let contents = instruction_set.contents_provided;
        let mut payloads = Vec::new();
        let mut thumbnails = Vec::new();
        for descriptor in &header.file_metadata.payloads {
            if contents.payload {
                match fs
                    .storage
                    .get_payload_stream(&item.file, &descriptor.key, None, &self.system)
                {
                    Ok(Some(part)) => payloads.push(OutgoingPayload {
                        key: descriptor.key.clone(),
                        content_type: descriptor.content_type.clone(),
                        bytes: part.bytes,
                    }),
                    Ok(None) => warn!(key = %descriptor.key, "Payload missing on disk; not sent"),
                    Err(e) => {
                        warn!(key = %descriptor.key, error = %e, "Cannot read payload");
                        return Err(TransferFailureReason::UnknownError);
                    }
                }
            }
            if contents.thumbnails {
                for thumb in &descriptor.thumbnails {
                    match fs.storage.get_thumbnail_stream(
                        &item.file,
                        &descriptor.key,
                        thumb.pixel_width,
                        thumb.pixel_height,
                        true,
                        &self.system,
                    ) {
                        Ok(Some(part)) => thumbnails.push(OutgoingThumbnail {
                            key: descriptor.key.clone(),
                            width: thumb.pixel_width,
                            height: thumb.pixel_height,
                            content_type: thumb.content_type.clone(),
                            bytes: part.bytes,
                        }),
                        Ok(None) => warn!(key = %descriptor.key, "Thumbnail missing on disk; not sent"),
                        Err(e) => {
                            warn!(key = %descriptor.key, error = %e, "Cannot read thumbnail");
                            return Err(TransferFailureReason::UnknownError);
                        }
                    }
                }
            }
        }

        Ok(HostToHostTransfer {
            instruction_set,
            metadata: redact_for_recipient(&header.file_metadata, item.options.override_remote_global_transit_id),
            payloads,
            thumbnails,
        })
    }

    fn unseal_token(&self, item: &OutboxItem) -> HostResult<ClientAuthToken> {
        let plain = self.sealing_key.decrypt(&item.sealed_client_auth_token)?;
        let token = std::str::from_utf8(&plain).map_err(|_| HostError::system("client auth token is not utf-8"))?;
        Ok(ClientAuthToken::new(token))
    }

    /// Run a peer call, retrying transport failures up to the configured
    /// number of attempts.
    async fn with_retry<F, Fut>(&self, mut call: F) -> TransportResult<PeerTransferResponse>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<PeerTransferResponse>>,
    {
        let max_attempts = self.config.peer_operation_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    debug!(attempt, error = %e, "Peer call failed; retrying");
                    tokio::time::sleep(self.config.peer_operation_delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Apply one delivery outcome to the outbox and transfer history.
    fn finish(&self, item: &OutboxItem, outcome: DeliveryOutcome, mode: DeliveryMode) -> HostResult<TransferStatus> {
        let fs_type = item.transfer.file_system_type;
        let delivered = outcome.is_ok();
        let status = match outcome {
            Ok((code, version_tag)) => {
                self.outbox.mark_complete(item)?;
                self.record_history(
                    &item.file,
                    &item.recipient,
                    fs_type,
                    UpdateTransferHistoryData {
                        is_in_outbox: Some(false),
                        latest_transfer_status: Some(LatestTransferStatus::Delivered),
                        version_tag,
                        ..Default::default()
                    },
                );
                match code {
                    PeerResponseCode::AcceptedIntoInbox => TransferStatus::DeliveredToInbox,
                    PeerResponseCode::AcceptedDirectWrite => TransferStatus::DeliveredToTargetDrive,
                }
            }
            Err(reason) if self.keeps_retrying(item, reason, mode) => {
                let attempt = item.attempt_count + 1;
                let next_run = unix_time_ms() + reason.backoff(attempt).as_millis() as i64;
                self.outbox.mark_failure(item, next_run)?;
                self.record_history(
                    &item.file,
                    &item.recipient,
                    fs_type,
                    in_outbox(Some(LatestProblemStatus::ServerPendingRetry)),
                );
                debug!(recipient = %item.recipient, attempt, reason = ?reason, "Delivery rescheduled");
                TransferStatus::PendingRetry
            }
            Err(reason) => {
                self.outbox.mark_complete(item)?;
                self.record_history(&item.file, &item.recipient, fs_type, problem(reason.problem_status()));
                warn!(recipient = %item.recipient, reason = ?reason, "Delivery failed for good");
                reason.terminal_status()
            }
        };

        // Transient files go once delivered and nothing else still needs them.
        if delivered && item.is_transient() && !self.outbox.references_file(&item.file)? {
            match self.fs(fs_type).storage.hard_delete_long_term_file(&item.file, &self.system) {
                Ok(()) => debug!(file_id = %item.file.file_id, "Transient file deleted"),
                Err(e) => warn!(file_id = %item.file.file_id, error = %e, "Cannot delete transient file"),
            }
        }
        Ok(status)
    }

    fn keeps_retrying(&self, item: &OutboxItem, reason: TransferFailureReason, mode: DeliveryMode) -> bool {
        if !reason.is_retryable() || item.attempt_count + 1 >= self.config.outbox_max_attempts {
            return false;
        }
        match mode {
            DeliveryMode::Background => true,
            DeliveryMode::SendNow => matches!(
                reason,
                TransferFailureReason::EncryptedTransferInstructionSetNotAvailable
                    | TransferFailureReason::CouldNotEncrypt
            ),
        }
    }

    /// Transfer history is advisory; a file deleted mid-flight must not
    /// fail the outbox.
    fn record_history(
        &self,
        file: &InternalDriveFileId,
        recipient: &OdinId,
        file_system_type: FileSystemType,
        update: UpdateTransferHistoryData,
    ) {
        if let Err(e) = self
            .fs(file_system_type)
            .storage
            .update_transfer_history(file, recipient, update, &self.system)
        {
            debug!(file_id = %file.file_id, recipient = %recipient, error = %e, "Transfer history not updated");
        }
    }

    // ========== Linked file operations ==========

    /// Ask recipients to delete their copy of a file sent earlier.
    pub async fn send_delete_linked_file(
        &self,
        file: InternalDriveFileId,
        recipients: Vec<OdinId>,
        file_system_type: FileSystemType,
        remote_target_drive: Option<TargetDrive>,
        caller: &CallerContext,
    ) -> HostResult<TransferStatusMap> {
        let recipients = self.validate_recipients(&recipients)?;
        let header = self
            .fs(file_system_type)
            .storage
            .get_server_file_header(&file, caller)?
            .ok_or_else(|| HostError::not_found(format!("file {}", file.file_id)))?;
        let global_transit_id = header.file_metadata.global_transit_id.ok_or_else(|| {
            HostError::client(ClientErrorCode::InvalidTransferType, "file has no global transit id")
        })?;
        let drive = self.drives.require_drive(&file.drive_id)?;
        let request = DeleteLinkedFileRequest {
            global_transit_id,
            target_drive: remote_target_drive.unwrap_or(drive.target_drive),
            file_system_type,
        };

        let mut statuses = TransferStatusMap::new();
        for recipient in recipients {
            let status = match self.network.client_auth_token(&recipient).await {
                None => TransferStatus::RecipientReturnedAccessDenied,
                Some(token) => linked_call_status(
                    self.with_retry(|| self.transport.delete_linked_file(&recipient, &token, &request))
                        .await,
                ),
            };
            debug!(recipient = %recipient, status = ?status, "Delete linked file sent");
            statuses.insert(recipient.as_str().to_string(), status);
        }
        Ok(statuses)
    }

    /// Tell the sender of a received file that it was read.
    pub async fn send_read_receipt(
        &self,
        file: InternalDriveFileId,
        file_system_type: FileSystemType,
        caller: &CallerContext,
    ) -> HostResult<TransferStatus> {
        let header = self
            .fs(file_system_type)
            .storage
            .get_server_file_header(&file, caller)?
            .ok_or_else(|| HostError::not_found(format!("file {}", file.file_id)))?;
        let (Some(sender), Some(global_transit_id)) = (
            header.file_metadata.sender_odin_id.clone(),
            header.file_metadata.global_transit_id,
        ) else {
            return Err(HostError::client(
                ClientErrorCode::InvalidTransferType,
                "read receipts need a received file with a global transit id",
            ));
        };
        let drive = self.drives.require_drive(&file.drive_id)?;
        let request = ReadReceiptRequest {
            global_transit_id,
            target_drive: drive.target_drive,
            file_system_type,
        };

        let Some(token) = self.network.client_auth_token(&sender).await else {
            return Ok(TransferStatus::RecipientReturnedAccessDenied);
        };
        Ok(linked_call_status(
            self.with_retry(|| self.transport.send_read_receipt(&sender, &token, &request))
                .await,
        ))
    }
}

fn in_outbox(problem: Option<LatestProblemStatus>) -> UpdateTransferHistoryData {
    UpdateTransferHistoryData {
        is_in_outbox: Some(true),
        latest_transfer_status: problem.map(LatestTransferStatus::Problem),
        ..Default::default()
    }
}

fn problem(status: LatestProblemStatus) -> UpdateTransferHistoryData {
    UpdateTransferHistoryData {
        is_in_outbox: Some(false),
        latest_transfer_status: Some(LatestTransferStatus::Problem(status)),
        ..Default::default()
    }
}

fn linked_call_status(result: TransportResult<PeerTransferResponse>) -> TransferStatus {
    match result {
        Ok(_) => TransferStatus::DeliveredToInbox,
        Err(e) => classify_transport_error(&e).terminal_status(),
    }
}

pub fn classify_transport_error(error: &PeerTransportError) -> TransferFailureReason {
    match error {
        PeerTransportError::Status(403) => TransferFailureReason::RecipientServerReturnedAccessDenied,
        PeerTransportError::Status(status) if *status >= 500 => TransferFailureReason::RecipientServerError,
        PeerTransportError::Transport(_) => TransferFailureReason::RecipientServerNotResponding,
        PeerTransportError::Status(_)
        | PeerTransportError::InvalidRequest(_)
        | PeerTransportError::InvalidResponse(_) => TransferFailureReason::UnknownError,
    }
}

/// Drive the recipient writes to. Feed files always land on the feed drive.
fn remote_target_drive(
    drive: &StorageDrive,
    options: &TransitOptions,
    transfer: FileTransferOptions,
) -> HostResult<TargetDrive> {
    match (transfer.transfer_file_type, options.remote_target_drive) {
        (TransferFileType::EncryptedFileForFeed, Some(target)) if target != TargetDrive::feed_drive() => {
            Err(HostError::client(
                ClientErrorCode::InvalidTransferType,
                "feed files can only be sent to the feed drive",
            ))
        }
        (TransferFileType::EncryptedFileForFeed, _) => Ok(TargetDrive::feed_drive()),
        (_, Some(target)) => Ok(target),
        (_, None) => Ok(drive.target_drive),
    }
}

/// Metadata as a recipient sees it: no local file address and no sender.
pub fn redact_for_recipient(metadata: &FileMetadata, override_global_transit_id: Option<Uuid>) -> FileMetadata {
    FileMetadata {
        file: InternalDriveFileId::redacted(),
        sender_odin_id: None,
        global_transit_id: override_global_transit_id.or(metadata.global_transit_id),
        ..metadata.clone()
    }
}
