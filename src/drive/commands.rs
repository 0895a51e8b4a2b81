// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Queue of received command-message files awaiting processing by apps.

use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use uuid::Uuid;

use super::unix_time_ms;
use crate::storage::database::{prefix_end, read_uuid, KeyBuilder};
use crate::storage::DbResult;

/// `drive_id | file_id` -> time added (unix ms).
const COMMAND_MESSAGES: TableDefinition<&[u8], i64> = TableDefinition::new("command_messages");

pub struct CommandMessageQueue {
    db: Arc<Database>,
}

impl CommandMessageQueue {
    pub fn open(db: Arc<Database>) -> DbResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(COMMAND_MESSAGES)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn add(&self, drive_id: &Uuid, file_ids: &[Uuid]) -> DbResult<()> {
        let now = unix_time_ms();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(COMMAND_MESSAGES)?;
            for file_id in file_ids {
                let key = KeyBuilder::new().uuid(drive_id).uuid(file_id).build();
                table.insert(key.as_slice(), now)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Up to `count` queued file ids for a drive, oldest file first.
    pub fn get_unprocessed(&self, drive_id: &Uuid, count: usize) -> DbResult<Vec<Uuid>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(COMMAND_MESSAGES)?;
        let prefix = KeyBuilder::new().uuid(drive_id).build();
        let end = prefix_end(&prefix);

        let mut ids = Vec::new();
        for entry in table.range(prefix.as_slice()..end.as_slice())? {
            let (key, _) = entry?;
            if let Some(id) = read_uuid(key.value(), 16) {
                ids.push(id);
            }
            if ids.len() >= count {
                break;
            }
        }
        Ok(ids)
    }

    pub fn mark_complete(&self, drive_id: &Uuid, file_ids: &[Uuid]) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(COMMAND_MESSAGES)?;
            for file_id in file_ids {
                let key = KeyBuilder::new().uuid(drive_id).uuid(file_id).build();
                table.remove(key.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
