// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Outbox and transfer key queue (`outbox.redb`).
//!
//! Items are keyed `drive_id | marker`; markers are v7 uuids so a drive's
//! items scan in the order they were added. An item is checked out while a
//! delivery is in flight and returned with a new `next_run` when it fails.

use std::collections::HashSet;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FileTransferOptions, TransferInstructionSet, TransitOptions};
use crate::crypto::EncryptedBlob;
use crate::drive::{unix_time_ms, InternalDriveFileId};
use crate::identity::OdinId;
use crate::storage::database::{prefix_end, KeyBuilder};
use crate::storage::DbResult;

/// `drive_id | marker` -> [`OutboxItem`] JSON.
const OUTBOX_ITEMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("outbox_items");
/// `marker` -> [`PendingTransferKey`] JSON.
const TRANSFER_KEY_QUEUE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("transfer_key_queue");

/// One file on its way to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
    pub marker: Uuid,
    pub file: InternalDriveFileId,
    pub recipient: OdinId,
    pub instruction_set: Option<TransferInstructionSet>,
    /// Token for the recipient's host, sealed with the outbox key.
    pub sealed_client_auth_token: EncryptedBlob,
    pub options: TransitOptions,
    pub transfer: FileTransferOptions,
    pub attempt_count: u32,
    pub added: i64,
    pub next_run: i64,
    #[serde(default)]
    pub checked_out_at: Option<i64>,
}

impl OutboxItem {
    pub fn is_transient(&self) -> bool {
        self.options.is_transient
    }

    fn key(&self) -> Vec<u8> {
        KeyBuilder::new()
            .uuid(&self.file.drive_id)
            .uuid(&self.marker)
            .build()
    }
}

/// A recipient whose public key could not be resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransferKey {
    pub marker: Uuid,
    pub file: InternalDriveFileId,
    pub recipient: OdinId,
    pub options: TransitOptions,
    pub transfer: FileTransferOptions,
    pub attempt_count: u32,
    pub added: i64,
}

pub struct TransitOutbox {
    db: Arc<Database>,
}

impl TransitOutbox {
    pub fn open(db: Arc<Database>) -> DbResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(OUTBOX_ITEMS)?;
            let _ = write_txn.open_table(TRANSFER_KEY_QUEUE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn add(&self, item: &OutboxItem) -> DbResult<()> {
        let json = serde_json::to_vec(item)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            table.insert(item.key().as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Check out up to `max` items of a drive that are due at `now`.
    ///
    /// Items go out in the order they were added, one per recipient: a
    /// recipient with an earlier item in flight or not yet due is skipped
    /// so its files arrive in order.
    pub fn checkout_batch(&self, drive_id: &Uuid, max: usize, now: i64) -> DbResult<Vec<OutboxItem>> {
        let prefix = KeyBuilder::new().uuid(drive_id).build();
        let end = prefix_end(&prefix);

        let write_txn = self.db.begin_write()?;
        let batch = {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            let mut blocked: HashSet<OdinId> = HashSet::new();
            let mut batch = Vec::new();
            for entry in table.range(prefix.as_slice()..end.as_slice())? {
                if batch.len() >= max {
                    break;
                }
                let (_, value) = entry?;
                let item: OutboxItem = serde_json::from_slice(value.value())?;
                if blocked.contains(&item.recipient) {
                    continue;
                }
                blocked.insert(item.recipient.clone());
                if item.checked_out_at.is_none() && item.next_run <= now {
                    batch.push(item);
                }
            }

            for item in batch.iter_mut() {
                item.checked_out_at = Some(now);
                let json = serde_json::to_vec(item)?;
                table.insert(item.key().as_slice(), json.as_slice())?;
            }
            batch
        };
        write_txn.commit()?;
        Ok(batch)
    }

    /// Remove an item after its final outcome.
    pub fn mark_complete(&self, item: &OutboxItem) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            table.remove(item.key().as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Return a failed item to the queue, due again at `next_run`.
    pub fn mark_failure(&self, item: &OutboxItem, next_run: i64) -> DbResult<()> {
        let mut item = item.clone();
        item.attempt_count += 1;
        item.next_run = next_run;
        item.checked_out_at = None;
        self.add(&item)
    }

    /// Release every checked-out item, e.g. after a restart interrupted
    /// in-flight deliveries.
    pub fn recover_checked_out(&self) -> DbResult<usize> {
        let write_txn = self.db.begin_write()?;
        let recovered = {
            let mut table = write_txn.open_table(OUTBOX_ITEMS)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let item: OutboxItem = serde_json::from_slice(value.value())?;
                if item.checked_out_at.is_some() {
                    stale.push(item);
                }
            }
            for item in stale.iter_mut() {
                item.checked_out_at = None;
                let json = serde_json::to_vec(item)?;
                table.insert(item.key().as_slice(), json.as_slice())?;
            }
            stale.len()
        };
        write_txn.commit()?;
        Ok(recovered)
    }

    pub fn has_items_for_file(&self, file: &InternalDriveFileId) -> DbResult<bool> {
        Ok(self.items_for_drive(&file.drive_id)?.iter().any(|i| &i.file == file))
    }

    /// Whether an outbox item or a queued transfer key still needs `file`.
    pub fn references_file(&self, file: &InternalDriveFileId) -> DbResult<bool> {
        if self.has_items_for_file(file)? {
            return Ok(true);
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSFER_KEY_QUEUE)?;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let pending: PendingTransferKey = serde_json::from_slice(value.value())?;
            if &pending.file == file {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn count(&self, drive_id: &Uuid) -> DbResult<usize> {
        Ok(self.items_for_drive(drive_id)?.len())
    }

    pub fn items_for_drive(&self, drive_id: &Uuid) -> DbResult<Vec<OutboxItem>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OUTBOX_ITEMS)?;
        let prefix = KeyBuilder::new().uuid(drive_id).build();
        let end = prefix_end(&prefix);

        let mut items = Vec::new();
        for entry in table.range(prefix.as_slice()..end.as_slice())? {
            let (_, value) = entry?;
            items.push(serde_json::from_slice(value.value())?);
        }
        Ok(items)
    }

    // ========== Transfer key queue ==========

    pub fn enqueue_transfer_key(&self, pending: &PendingTransferKey) -> DbResult<()> {
        let json = serde_json::to_vec(pending)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRANSFER_KEY_QUEUE)?;
            table.insert(pending.marker.as_bytes().as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn pending_transfer_keys(&self, max: usize) -> DbResult<Vec<PendingTransferKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSFER_KEY_QUEUE)?;
        let mut pending = Vec::new();
        for entry in table.iter()? {
            if pending.len() >= max {
                break;
            }
            let (_, value) = entry?;
            pending.push(serde_json::from_slice(value.value())?);
        }
        Ok(pending)
    }

    pub fn remove_transfer_key(&self, marker: &Uuid) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRANSFER_KEY_QUEUE)?;
            table.remove(marker.as_bytes().as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// New outbox item, due now.
pub(crate) fn new_outbox_item(
    file: InternalDriveFileId,
    recipient: OdinId,
    instruction_set: TransferInstructionSet,
    sealed_client_auth_token: EncryptedBlob,
    options: TransitOptions,
    transfer: FileTransferOptions,
) -> OutboxItem {
    let now = unix_time_ms();
    OutboxItem {
        marker: Uuid::now_v7(),
        file,
        recipient,
        instruction_set: Some(instruction_set),
        sealed_client_auth_token,
        options,
        transfer,
        attempt_count: 0,
        added: now,
        next_run: now,
        checked_out_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyHeader, SymmetricKey};
    use crate::drive::{FileSystemType, TargetDrive};
    use crate::storage::database::open_database;
    use crate::transit::{SendContents, TransferFileType};

    fn outbox() -> (TransitOutbox, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(open_database(&dir.path().join("outbox.redb")).unwrap());
        (TransitOutbox::open(db).unwrap(), dir)
    }

    fn item(file: InternalDriveFileId, recipient: &str) -> OutboxItem {
        let secret = crate::crypto::generate_secret_key().unwrap();
        let envelope = KeyHeader::new_random().unwrap().seal_for_recipient(&secret.public_key()).unwrap();
        let token = SymmetricKey::from_bytes([1u8; 32]).encrypt(b"token").unwrap();
        let transfer = FileTransferOptions {
            transfer_file_type: TransferFileType::Normal,
            file_system_type: FileSystemType::Standard,
        };
        new_outbox_item(
            file,
            OdinId::new(recipient),
            TransferInstructionSet {
                transfer_key: envelope,
                target_drive: TargetDrive::new(Uuid::new_v4(), Uuid::new_v4()),
                transfer_file_type: TransferFileType::Normal,
                file_system_type: FileSystemType::Standard,
                contents_provided: SendContents::ALL,
            },
            token,
            TransitOptions::new(vec![OdinId::new(recipient)]),
            transfer,
        )
    }

    #[test]
    fn checkout_is_fifo_per_recipient() {
        let (outbox, _dir) = outbox();
        let drive = Uuid::new_v4();
        let file = InternalDriveFileId::new(drive, Uuid::now_v7());
        let sam_first = item(file, "sam.dotyou.cloud");
        let sam_second = item(file, "sam.dotyou.cloud");
        let merry = item(file, "merry.dotyou.cloud");
        for i in [&sam_first, &sam_second, &merry] {
            outbox.add(i).unwrap();
        }

        let now = unix_time_ms();
        let batch = outbox.checkout_batch(&drive, 10, now).unwrap();
        let markers: Vec<_> = batch.iter().map(|i| i.marker).collect();
        assert_eq!(markers, vec![sam_first.marker, merry.marker]);

        // Sam's first item is in flight, so nothing else of Sam's goes out.
        assert!(outbox.checkout_batch(&drive, 10, now).unwrap().is_empty());

        outbox.mark_complete(&batch[0]).unwrap();
        let next = outbox.checkout_batch(&drive, 10, now).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].marker, sam_second.marker);
    }

    #[test]
    fn failures_wait_for_next_run() {
        let (outbox, _dir) = outbox();
        let drive = Uuid::new_v4();
        let file = InternalDriveFileId::new(drive, Uuid::now_v7());
        outbox.add(&item(file, "sam.dotyou.cloud")).unwrap();

        let now = unix_time_ms();
        let batch = outbox.checkout_batch(&drive, 10, now).unwrap();
        outbox.mark_failure(&batch[0], now + 60_000).unwrap();

        assert!(outbox.checkout_batch(&drive, 10, now).unwrap().is_empty());
        let later = outbox.checkout_batch(&drive, 10, now + 60_000).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].attempt_count, 1);
        assert!(outbox.has_items_for_file(&file).unwrap());
    }

    #[test]
    fn recovery_releases_checked_out_items() {
        let (outbox, _dir) = outbox();
        let drive = Uuid::new_v4();
        let file = InternalDriveFileId::new(drive, Uuid::now_v7());
        outbox.add(&item(file, "sam.dotyou.cloud")).unwrap();
        let now = unix_time_ms();
        outbox.checkout_batch(&drive, 10, now).unwrap();

        assert_eq!(outbox.recover_checked_out().unwrap(), 1);
        assert_eq!(outbox.checkout_batch(&drive, 10, now).unwrap().len(), 1);
        assert_eq!(outbox.count(&drive).unwrap(), 1);
        assert_eq!(outbox.count(&Uuid::new_v4()).unwrap(), 0);
    }

    #[test]
    fn transfer_key_queue() {
        let (outbox, _dir) = outbox();
        let pending = PendingTransferKey {
            marker: Uuid::now_v7(),
            file: InternalDriveFileId::new(Uuid::new_v4(), Uuid::now_v7()),
            recipient: OdinId::new("sam.dotyou.cloud"),
            options: TransitOptions::new(vec![OdinId::new("sam.dotyou.cloud")]),
            transfer: FileTransferOptions {
                transfer_file_type: TransferFileType::Normal,
                file_system_type: FileSystemType::Standard,
            },
            attempt_count: 0,
            added: unix_time_ms(),
        };
        outbox.enqueue_transfer_key(&pending).unwrap();
        assert_eq!(outbox.pending_transfer_keys(10).unwrap(), vec![pending.clone()]);
        outbox.remove_transfer_key(&pending.marker).unwrap();
        assert!(outbox.pending_transfer_keys(10).unwrap().is_empty());
    }
}
