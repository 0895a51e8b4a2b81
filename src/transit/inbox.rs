// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Inbox of received transfers (`inbox.redb`).

use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{InstructionType, TransferFileType, TransferInstructionSet};
use crate::drive::{unix_time_ms, FileSystemType, InternalDriveFileId};
use crate::identity::OdinId;
use crate::storage::database::{prefix_end, KeyBuilder};
use crate::storage::DbResult;

/// `drive_id | marker` -> [`TransferBoxItem`] JSON.
const INBOX_ITEMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("inbox_items");
/// Same layout; items that ran out of attempts.
const INBOX_DEAD_LETTERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("inbox_dead_letters");

/// One received instruction waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBoxItem {
    pub marker: Uuid,
    pub drive_id: Uuid,
    /// Temp file holding the staged parts of a `SaveFile`.
    pub file_id: Uuid,
    pub sender: OdinId,
    pub instruction_type: InstructionType,
    pub transfer_file_type: TransferFileType,
    pub file_system_type: FileSystemType,
    #[serde(default)]
    pub global_transit_id: Option<Uuid>,
    #[serde(default)]
    pub instruction_set: Option<TransferInstructionSet>,
    pub added: i64,
    pub attempt_count: u32,
    #[serde(default)]
    pub popped_at: Option<i64>,
}

impl TransferBoxItem {
    pub fn new(drive_id: Uuid, file_id: Uuid, sender: OdinId, instruction_type: InstructionType) -> Self {
        Self {
            marker: Uuid::now_v7(),
            drive_id,
            file_id,
            sender,
            instruction_type,
            transfer_file_type: TransferFileType::Normal,
            file_system_type: FileSystemType::Standard,
            global_transit_id: None,
            instruction_set: None,
            added: unix_time_ms(),
            attempt_count: 0,
            popped_at: None,
        }
    }

    pub fn temp_file(&self) -> InternalDriveFileId {
        InternalDriveFileId::new(self.drive_id, self.file_id)
    }

    fn key(&self) -> Vec<u8> {
        KeyBuilder::new().uuid(&self.drive_id).uuid(&self.marker).build()
    }
}

pub struct TransitInbox {
    db: Arc<Database>,
}

impl TransitInbox {
    pub fn open(db: Arc<Database>) -> DbResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(INBOX_ITEMS)?;
            let _ = write_txn.open_table(INBOX_DEAD_LETTERS)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn add(&self, item: &TransferBoxItem) -> DbResult<()> {
        let json = serde_json::to_vec(item)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(INBOX_ITEMS)?;
            table.insert(item.key().as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Pop up to `max` items of a drive, oldest first.
    pub fn pop_batch(&self, drive_id: &Uuid, max: usize) -> DbResult<Vec<TransferBoxItem>> {
        let prefix = KeyBuilder::new().uuid(drive_id).build();
        let end = prefix_end(&prefix);
        let now = unix_time_ms();

        let write_txn = self.db.begin_write()?;
        let batch = {
            let mut table = write_txn.open_table(INBOX_ITEMS)?;
            let mut batch = Vec::new();
            for entry in table.range(prefix.as_slice()..end.as_slice())? {
                if batch.len() >= max {
                    break;
                }
                let (_, value) = entry?;
                let item: TransferBoxItem = serde_json::from_slice(value.value())?;
                if item.popped_at.is_none() {
                    batch.push(item);
                }
            }
            for item in batch.iter_mut() {
                item.popped_at = Some(now);
                let json = serde_json::to_vec(item)?;
                table.insert(item.key().as_slice(), json.as_slice())?;
            }
            batch
        };
        write_txn.commit()?;
        Ok(batch)
    }

    pub fn mark_complete(&self, item: &TransferBoxItem) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(INBOX_ITEMS)?;
            table.remove(item.key().as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Put an item back for another attempt.
    pub fn mark_failure(&self, item: &TransferBoxItem) -> DbResult<()> {
        let mut item = item.clone();
        item.attempt_count += 1;
        item.popped_at = None;
        self.add(&item)
    }

    /// Move an item out of the inbox for good.
    pub fn dead_letter(&self, item: &TransferBoxItem) -> DbResult<()> {
        let mut item = item.clone();
        item.attempt_count += 1;
        item.popped_at = None;
        let json = serde_json::to_vec(&item)?;
        let key = item.key();

        let write_txn = self.db.begin_write()?;
        {
            let mut items = write_txn.open_table(INBOX_ITEMS)?;
            items.remove(key.as_slice())?;
            let mut dead = write_txn.open_table(INBOX_DEAD_LETTERS)?;
            dead.insert(key.as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn dead_letters(&self, drive_id: &Uuid) -> DbResult<Vec<TransferBoxItem>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INBOX_DEAD_LETTERS)?;
        let prefix = KeyBuilder::new().uuid(drive_id).build();
        let end = prefix_end(&prefix);

        let mut items = Vec::new();
        for entry in table.range(prefix.as_slice()..end.as_slice())? {
            let (_, value) = entry?;
            items.push(serde_json::from_slice(value.value())?);
        }
        Ok(items)
    }

    pub fn count(&self, drive_id: &Uuid) -> DbResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INBOX_ITEMS)?;
        let prefix = KeyBuilder::new().uuid(drive_id).build();
        let end = prefix_end(&prefix);
        let mut count = 0;
        for entry in table.range(prefix.as_slice()..end.as_slice())? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Release items popped by a run that never finished them.
    pub fn recover_popped(&self) -> DbResult<usize> {
        let write_txn = self.db.begin_write()?;
        let recovered = {
            let mut table = write_txn.open_table(INBOX_ITEMS)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let item: TransferBoxItem = serde_json::from_slice(value.value())?;
                if item.popped_at.is_some() {
                    stale.push(item);
                }
            }
            for item in stale.iter_mut() {
                item.popped_at = None;
                let json = serde_json::to_vec(item)?;
                table.insert(item.key().as_slice(), json.as_slice())?;
            }
            stale.len()
        };
        write_txn.commit()?;
        Ok(recovered)
    }
}
