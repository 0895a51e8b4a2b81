// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Query index tables (redb, pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `index_state`: drive -> [`IndexStateRecord`] (JSON)
//! - `index_entries`: `drive|gen|file` -> header (JSON)
//! - `index_by_created`: `drive|gen|!created|!file` -> file id; forward
//!   scans are newest first
//! - `index_by_modified`: `drive|gen|updated|file` -> file id
//! - `index_tombstones`: `drive|gen|file` -> empty; hard deletes seen while
//!   `gen` was being rebuilt
//! - `identity_keys`: `drive|kind|uuid` -> file id (unique id and global
//!   transit id reservations)
//! - `file_identity`: `drive|file` -> the keys a file holds (JSON)
//!
//! Cursors are the key suffix after `drive|gen`, so they stay valid when a
//! rebuild switches generations.

use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DriveSizeInfo, IndexState};
use crate::drive::{InternalDriveFileId, ServerFileHeader};
use crate::storage::database::{prefix_end, read_uuid, KeyBuilder};
use crate::storage::{DbError, DbResult};

// =============================================================================
// Table Definitions
// =============================================================================

const INDEX_STATE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index_state");
const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index_entries");
const BY_CREATED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index_by_created");
const BY_MODIFIED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index_by_modified");
const TOMBSTONES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index_tombstones");
const IDENTITY_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("identity_keys");
const FILE_IDENTITY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("file_identity");

/// Length of the `drive|gen` prefix.
const GEN_PREFIX_LEN: usize = 20;

const UNIQUE_ID_KIND: u32 = 1;
const GLOBAL_TRANSIT_ID_KIND: u32 = 2;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStateRecord {
    pub state: IndexState,
    pub active_generation: u32,
    /// Generation being filled by a rebuild, if any.
    #[serde(default)]
    pub building_generation: Option<u32>,
}

impl IndexStateRecord {
    fn new(state: IndexState) -> Self {
        Self {
            state,
            active_generation: 0,
            building_generation: None,
        }
    }

    fn live_generations(&self) -> impl Iterator<Item = u32> {
        std::iter::once(self.active_generation).chain(self.building_generation)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileIdentity {
    unique_id: Option<Uuid>,
    global_transit_id: Option<Uuid>,
}

/// An identity key already held by another file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityConflict {
    UniqueId { file_id: Uuid },
    GlobalTransitId { file_id: Uuid },
}

/// One page of a scan.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub headers: Vec<ServerFileHeader>,
    /// Key suffix of the last returned entry.
    pub cursor: Option<Vec<u8>>,
    pub has_more: bool,
}

// =============================================================================
// Keys
// =============================================================================

fn gen_prefix(drive_id: &Uuid, generation: u32) -> Vec<u8> {
    KeyBuilder::new().uuid(drive_id).u32(generation).build()
}

fn entry_key(drive_id: &Uuid, generation: u32, file_id: &Uuid) -> Vec<u8> {
    KeyBuilder::new().uuid(drive_id).u32(generation).uuid(file_id).build()
}

fn created_key(drive_id: &Uuid, generation: u32, header: &ServerFileHeader) -> Vec<u8> {
    KeyBuilder::new()
        .uuid(drive_id)
        .u32(generation)
        .timestamp_desc(header.file_metadata.created)
        .uuid_desc(&header.file().file_id)
        .build()
}

fn modified_key(drive_id: &Uuid, generation: u32, header: &ServerFileHeader) -> Vec<u8> {
    KeyBuilder::new()
        .uuid(drive_id)
        .u32(generation)
        .timestamp(header.file_metadata.updated)
        .uuid(&header.file().file_id)
        .build()
}

fn identity_key(drive_id: &Uuid, kind: u32, id: &Uuid) -> Vec<u8> {
    KeyBuilder::new().uuid(drive_id).u32(kind).uuid(id).build()
}

fn file_key(file: &InternalDriveFileId) -> Vec<u8> {
    KeyBuilder::new().uuid(&file.drive_id).uuid(&file.file_id).build()
}

fn get_json<T, R>(table: &R, key: &[u8]) -> DbResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table.get(key)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn get_uuid<R>(table: &R, key: &[u8]) -> DbResult<Option<Uuid>>
where
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table.get(key)? {
        Some(value) => Ok(Some(
            read_uuid(value.value(), 0).ok_or(DbError::CorruptKey("identity_keys"))?,
        )),
        None => Ok(None),
    }
}

fn keys_with_prefix<R>(table: &R, prefix: &[u8]) -> DbResult<Vec<Vec<u8>>>
where
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    let end = prefix_end(prefix);
    let mut keys = Vec::new();
    for entry in table.range(prefix..end.as_slice())? {
        let (key, _) = entry?;
        keys.push(key.value().to_vec());
    }
    Ok(keys)
}

// =============================================================================
// Entry tables within one write transaction
// =============================================================================

type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

struct EntryTables<'txn> {
    entries: BytesTable<'txn>,
    by_created: BytesTable<'txn>,
    by_modified: BytesTable<'txn>,
    tombstones: BytesTable<'txn>,
}

impl<'txn> EntryTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> DbResult<Self> {
        Ok(Self {
            entries: txn.open_table(ENTRIES)?,
            by_created: txn.open_table(BY_CREATED)?,
            by_modified: txn.open_table(BY_MODIFIED)?,
            tombstones: txn.open_table(TOMBSTONES)?,
        })
    }

    fn existing(&self, drive_id: &Uuid, generation: u32, file_id: &Uuid) -> DbResult<Option<ServerFileHeader>> {
        get_json(&self.entries, &entry_key(drive_id, generation, file_id))
    }

    fn put(&mut self, generation: u32, header: &ServerFileHeader) -> DbResult<()> {
        let file = header.file();
        if let Some(previous) = self.existing(&file.drive_id, generation, &file.file_id)? {
            self.by_created
                .remove(created_key(&file.drive_id, generation, &previous).as_slice())?;
            self.by_modified
                .remove(modified_key(&file.drive_id, generation, &previous).as_slice())?;
        }
        let json = serde_json::to_vec(header)?;
        let file_id = file.file_id.as_bytes().as_slice();
        self.entries
            .insert(entry_key(&file.drive_id, generation, &file.file_id).as_slice(), json.as_slice())?;
        self.by_created
            .insert(created_key(&file.drive_id, generation, header).as_slice(), file_id)?;
        self.by_modified
            .insert(modified_key(&file.drive_id, generation, header).as_slice(), file_id)?;
        Ok(())
    }

    fn remove(&mut self, file: &InternalDriveFileId, generation: u32) -> DbResult<()> {
        let key = entry_key(&file.drive_id, generation, &file.file_id);
        if let Some(previous) = self.existing(&file.drive_id, generation, &file.file_id)? {
            self.by_created
                .remove(created_key(&file.drive_id, generation, &previous).as_slice())?;
            self.by_modified
                .remove(modified_key(&file.drive_id, generation, &previous).as_slice())?;
        }
        self.entries.remove(key.as_slice())?;
        Ok(())
    }

    fn clear_generation(&mut self, drive_id: &Uuid, generation: u32) -> DbResult<()> {
        let prefix = gen_prefix(drive_id, generation);
        for table in [
            &mut self.entries,
            &mut self.by_created,
            &mut self.by_modified,
            &mut self.tombstones,
        ] {
            for key in keys_with_prefix(&*table, &prefix)? {
                table.remove(key.as_slice())?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// QueryIndex
// =============================================================================

pub struct QueryIndex {
    db: Arc<Database>,
}

impl QueryIndex {
    /// Open the index on a shared database, creating its tables.
    pub fn open(db: Arc<Database>) -> DbResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(INDEX_STATE)?;
            let _ = write_txn.open_table(ENTRIES)?;
            let _ = write_txn.open_table(BY_CREATED)?;
            let _ = write_txn.open_table(BY_MODIFIED)?;
            let _ = write_txn.open_table(TOMBSTONES)?;
            let _ = write_txn.open_table(IDENTITY_KEYS)?;
            let _ = write_txn.open_table(FILE_IDENTITY)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    // =========================================================================
    // Index state
    // =========================================================================

    pub fn state(&self, drive_id: &Uuid) -> DbResult<Option<IndexStateRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INDEX_STATE)?;
        get_json(&table, drive_id.as_bytes())
    }

    /// Every drive with a state record.
    pub fn all_states(&self) -> DbResult<Vec<(Uuid, IndexStateRecord)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INDEX_STATE)?;
        let mut states = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let drive_id = read_uuid(key.value(), 0).ok_or(DbError::CorruptKey("index_state"))?;
            states.push((drive_id, serde_json::from_slice(value.value())?));
        }
        Ok(states)
    }

    /// Create a state record if the drive has none. Returns true when one
    /// was created.
    pub fn initialize_drive(&self, drive_id: &Uuid, state: IndexState) -> DbResult<bool> {
        let write_txn = self.db.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(INDEX_STATE)?;
            if get_json::<IndexStateRecord, _>(&table, drive_id.as_bytes())?.is_some() {
                false
            } else {
                let json = serde_json::to_vec(&IndexStateRecord::new(state))?;
                table.insert(drive_id.as_bytes().as_slice(), json.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(created)
    }

    pub fn set_state(&self, drive_id: &Uuid, state: IndexState) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(INDEX_STATE)?;
            let mut record = get_json::<IndexStateRecord, _>(&table, drive_id.as_bytes())?
                .unwrap_or(IndexStateRecord::new(state));
            record.state = state;
            let json = serde_json::to_vec(&record)?;
            table.insert(drive_id.as_bytes().as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Live writes
    // =========================================================================

    /// Insert or replace a file's entry in every live generation.
    pub fn upsert(&self, header: &ServerFileHeader) -> DbResult<()> {
        let drive_id = header.file().drive_id;
        let write_txn = self.db.begin_write()?;
        {
            let states = write_txn.open_table(INDEX_STATE)?;
            let record = get_json::<IndexStateRecord, _>(&states, drive_id.as_bytes())?
                .unwrap_or(IndexStateRecord::new(IndexState::RequiresRebuild));
            let mut tables = EntryTables::open(&write_txn)?;
            for generation in record.live_generations() {
                tables.put(generation, header)?;
                tables
                    .tombstones
                    .remove(entry_key(&drive_id, generation, &header.file().file_id).as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a file's entry from every live generation.
    pub fn remove(&self, file: &InternalDriveFileId) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let states = write_txn.open_table(INDEX_STATE)?;
            let record = get_json::<IndexStateRecord, _>(&states, file.drive_id.as_bytes())?
                .unwrap_or(IndexStateRecord::new(IndexState::RequiresRebuild));
            let mut tables = EntryTables::open(&write_txn)?;
            tables.remove(file, record.active_generation)?;
            if let Some(building) = record.building_generation {
                tables.remove(file, building)?;
                let key = entry_key(&file.drive_id, building, &file.file_id);
                tables.tombstones.insert(key.as_slice(), b"".as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Rebuild
    // =========================================================================

    /// Start filling a fresh generation. With `take_offline` the drive stops
    /// serving queries until [`QueryIndex::finish_rebuild`].
    pub fn begin_rebuild(&self, drive_id: &Uuid, take_offline: bool) -> DbResult<u32> {
        let write_txn = self.db.begin_write()?;
        let generation = {
            let mut states = write_txn.open_table(INDEX_STATE)?;
            let mut record = get_json::<IndexStateRecord, _>(&states, drive_id.as_bytes())?
                .unwrap_or(IndexStateRecord::new(IndexState::RequiresRebuild));

            let mut tables = EntryTables::open(&write_txn)?;
            if let Some(abandoned) = record.building_generation {
                tables.clear_generation(drive_id, abandoned)?;
            }
            let generation = record
                .active_generation
                .max(record.building_generation.unwrap_or(0))
                .wrapping_add(1);
            tables.clear_generation(drive_id, generation)?;

            record.building_generation = Some(generation);
            if take_offline {
                record.state = IndexState::IsRebuilding;
            }
            let json = serde_json::to_vec(&record)?;
            states.insert(drive_id.as_bytes().as_slice(), json.as_slice())?;
            generation
        };
        write_txn.commit()?;
        Ok(generation)
    }

    /// Write rebuilt headers into `generation`. Entries written by live
    /// updates since the rebuild started win over older disk reads, and
    /// files hard-deleted meanwhile are skipped. Identity keys missing for a
    /// header are restored. Returns the number of entries written.
    pub fn write_to_generation(
        &self,
        drive_id: &Uuid,
        generation: u32,
        headers: &[ServerFileHeader],
    ) -> DbResult<usize> {
        let write_txn = self.db.begin_write()?;
        let written = {
            let mut tables = EntryTables::open(&write_txn)?;
            let mut keys = write_txn.open_table(IDENTITY_KEYS)?;
            let mut files = write_txn.open_table(FILE_IDENTITY)?;
            let mut written = 0;
            for header in headers {
                let file = header.file();
                if file.drive_id != *drive_id {
                    continue;
                }
                let tombstone = entry_key(drive_id, generation, &file.file_id);
                if tables.tombstones.get(tombstone.as_slice())?.is_some() {
                    continue;
                }
                if let Some(existing) = tables.existing(drive_id, generation, &file.file_id)? {
                    if existing.file_metadata.updated >= header.file_metadata.updated {
                        continue;
                    }
                }
                tables.put(generation, header)?;
                restore_identity(&mut keys, &mut files, header)?;
                written += 1;
            }
            written
        };
        write_txn.commit()?;
        Ok(written)
    }

    /// Make `generation` active and drop the old one. Returns false if a
    /// newer rebuild superseded this one.
    pub fn finish_rebuild(&self, drive_id: &Uuid, generation: u32) -> DbResult<bool> {
        let write_txn = self.db.begin_write()?;
        let switched = {
            let mut states = write_txn.open_table(INDEX_STATE)?;
            let record = get_json::<IndexStateRecord, _>(&states, drive_id.as_bytes())?;
            match record {
                Some(mut record) if record.building_generation == Some(generation) => {
                    let old = record.active_generation;
                    record.active_generation = generation;
                    record.building_generation = None;
                    record.state = IndexState::Ready;
                    let json = serde_json::to_vec(&record)?;
                    states.insert(drive_id.as_bytes().as_slice(), json.as_slice())?;

                    let mut tables = EntryTables::open(&write_txn)?;
                    if old != generation {
                        tables.clear_generation(drive_id, old)?;
                    }
                    for key in keys_with_prefix(&tables.tombstones, &gen_prefix(drive_id, generation))? {
                        tables.tombstones.remove(key.as_slice())?;
                    }
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;
        Ok(switched)
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Page through `generation` by creation time. `cursor` is the suffix
    /// returned by a previous page; the scan resumes strictly after it.
    pub fn scan_by_created<F>(
        &self,
        drive_id: &Uuid,
        generation: u32,
        cursor: Option<&[u8]>,
        newest_first: bool,
        limit: usize,
        accept: F,
    ) -> DbResult<ScanPage>
    where
        F: FnMut(&ServerFileHeader) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let by_created = read_txn.open_table(BY_CREATED)?;
        let entries = read_txn.open_table(ENTRIES)?;

        let prefix = gen_prefix(drive_id, generation);
        let end = prefix_end(&prefix);
        let resume = cursor.map(|c| [prefix.as_slice(), c].concat());

        let range = match (&resume, newest_first) {
            (Some(key), true) => by_created.range(key.as_slice()..end.as_slice())?,
            (Some(key), false) => by_created.range(prefix.as_slice()..key.as_slice())?,
            (None, _) => by_created.range(prefix.as_slice()..end.as_slice())?,
        };

        let mut collector = Collector::new(drive_id, generation, &entries, resume.as_deref(), limit, accept);
        if newest_first {
            for entry in range {
                let (key, value) = entry?;
                if collector.visit(key.value(), value.value())? {
                    break;
                }
            }
        } else {
            for entry in range.rev() {
                let (key, value) = entry?;
                if collector.visit(key.value(), value.value())? {
                    break;
                }
            }
        }
        Ok(collector.page)
    }

    /// Page through `generation` by modification time, ascending, up to
    /// `max_date` (inclusive) when given.
    pub fn scan_by_modified<F>(
        &self,
        drive_id: &Uuid,
        generation: u32,
        cursor: Option<&[u8]>,
        max_date: Option<i64>,
        limit: usize,
        accept: F,
    ) -> DbResult<ScanPage>
    where
        F: FnMut(&ServerFileHeader) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let by_modified = read_txn.open_table(BY_MODIFIED)?;
        let entries = read_txn.open_table(ENTRIES)?;

        let prefix = gen_prefix(drive_id, generation);
        let end = match max_date {
            Some(max) => prefix_end(&KeyBuilder::new().uuid(drive_id).u32(generation).timestamp(max).build()),
            None => prefix_end(&prefix),
        };
        let resume = cursor.map(|c| [prefix.as_slice(), c].concat());
        let start = resume.clone().unwrap_or_else(|| prefix.clone());
        if start >= end {
            return Ok(ScanPage::default());
        }

        let mut collector = Collector::new(drive_id, generation, &entries, resume.as_deref(), limit, accept);
        for entry in by_modified.range(start.as_slice()..end.as_slice())? {
            let (key, value) = entry?;
            if collector.visit(key.value(), value.value())? {
                break;
            }
        }
        Ok(collector.page)
    }

    /// Count and size of the active files in `generation`.
    pub fn drive_size(&self, drive_id: &Uuid, generation: u32) -> DbResult<DriveSizeInfo> {
        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(ENTRIES)?;
        let prefix = gen_prefix(drive_id, generation);
        let end = prefix_end(&prefix);
        let mut info = DriveSizeInfo::default();
        for entry in entries.range(prefix.as_slice()..end.as_slice())? {
            let (_, value) = entry?;
            let header: ServerFileHeader = serde_json::from_slice(value.value())?;
            if header.is_active() {
                info.file_count += 1;
                info.size += header.server_metadata.file_byte_count;
            }
        }
        Ok(info)
    }

    pub fn get_entry(&self, file: &InternalDriveFileId, generation: u32) -> DbResult<Option<ServerFileHeader>> {
        let read_txn = self.db.begin_read()?;
        let entries = read_txn.open_table(ENTRIES)?;
        get_json(&entries, &entry_key(&file.drive_id, generation, &file.file_id))
    }

    // =========================================================================
    // Identity keys
    // =========================================================================

    /// Atomically reserve a file's unique id and global transit id. Keys
    /// held by another file are reported and nothing is written. A unique
    /// id the file no longer carries is released.
    pub fn reserve_identity(
        &self,
        file: &InternalDriveFileId,
        unique_id: Option<Uuid>,
        global_transit_id: Option<Uuid>,
    ) -> DbResult<Option<IdentityConflict>> {
        let write_txn = self.db.begin_write()?;
        let conflict = {
            let mut keys = write_txn.open_table(IDENTITY_KEYS)?;
            let mut files = write_txn.open_table(FILE_IDENTITY)?;
            let fkey = file_key(file);
            let previous: FileIdentity = get_json(&files, &fkey)?.unwrap_or_default();
            let global_transit_id = global_transit_id.or(previous.global_transit_id);

            let mut conflict = None;
            if let Some(uid) = unique_id {
                match get_uuid(&keys, &identity_key(&file.drive_id, UNIQUE_ID_KIND, &uid))? {
                    Some(owner) if owner != file.file_id => {
                        conflict = Some(IdentityConflict::UniqueId { file_id: owner })
                    }
                    _ => {}
                }
            }
            if let (None, Some(gtid)) = (conflict, global_transit_id) {
                match get_uuid(&keys, &identity_key(&file.drive_id, GLOBAL_TRANSIT_ID_KIND, &gtid))? {
                    Some(owner) if owner != file.file_id => {
                        conflict = Some(IdentityConflict::GlobalTransitId { file_id: owner })
                    }
                    _ => {}
                }
            }

            if conflict.is_none() {
                let file_id = file.file_id.as_bytes().as_slice();
                if let Some(old) = previous.unique_id.filter(|old| Some(*old) != unique_id) {
                    keys.remove(identity_key(&file.drive_id, UNIQUE_ID_KIND, &old).as_slice())?;
                }
                if let Some(old) = previous.global_transit_id.filter(|old| Some(*old) != global_transit_id) {
                    keys.remove(identity_key(&file.drive_id, GLOBAL_TRANSIT_ID_KIND, &old).as_slice())?;
                }
                if let Some(uid) = unique_id {
                    keys.insert(identity_key(&file.drive_id, UNIQUE_ID_KIND, &uid).as_slice(), file_id)?;
                }
                if let Some(gtid) = global_transit_id {
                    keys.insert(
                        identity_key(&file.drive_id, GLOBAL_TRANSIT_ID_KIND, &gtid).as_slice(),
                        file_id,
                    )?;
                }
                let record = FileIdentity {
                    unique_id,
                    global_transit_id,
                };
                let json = serde_json::to_vec(&record)?;
                files.insert(fkey.as_slice(), json.as_slice())?;
            }
            conflict
        };
        if conflict.is_none() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(conflict)
    }

    /// Free a file's unique id, keeping its global transit id.
    pub fn release_unique_id(&self, file: &InternalDriveFileId) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut keys = write_txn.open_table(IDENTITY_KEYS)?;
            let mut files = write_txn.open_table(FILE_IDENTITY)?;
            let fkey = file_key(file);
            if let Some(mut record) = get_json::<FileIdentity, _>(&files, &fkey)? {
                if let Some(uid) = record.unique_id.take() {
                    let key = identity_key(&file.drive_id, UNIQUE_ID_KIND, &uid);
                    if get_uuid(&keys, &key)? == Some(file.file_id) {
                        keys.remove(key.as_slice())?;
                    }
                }
                let json = serde_json::to_vec(&record)?;
                files.insert(fkey.as_slice(), json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Free every identity key of a file.
    pub fn release_all(&self, file: &InternalDriveFileId) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut keys = write_txn.open_table(IDENTITY_KEYS)?;
            let mut files = write_txn.open_table(FILE_IDENTITY)?;
            let fkey = file_key(file);
            if let Some(record) = get_json::<FileIdentity, _>(&files, &fkey)? {
                let held = [
                    record.unique_id.map(|id| identity_key(&file.drive_id, UNIQUE_ID_KIND, &id)),
                    record
                        .global_transit_id
                        .map(|id| identity_key(&file.drive_id, GLOBAL_TRANSIT_ID_KIND, &id)),
                ];
                for key in held.into_iter().flatten() {
                    if get_uuid(&keys, &key)? == Some(file.file_id) {
                        keys.remove(key.as_slice())?;
                    }
                }
                files.remove(fkey.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn lookup_unique_id(&self, drive_id: &Uuid, unique_id: &Uuid) -> DbResult<Option<Uuid>> {
        self.lookup(drive_id, UNIQUE_ID_KIND, unique_id)
    }

    pub fn lookup_global_transit_id(&self, drive_id: &Uuid, global_transit_id: &Uuid) -> DbResult<Option<Uuid>> {
        self.lookup(drive_id, GLOBAL_TRANSIT_ID_KIND, global_transit_id)
    }

    fn lookup(&self, drive_id: &Uuid, kind: u32, id: &Uuid) -> DbResult<Option<Uuid>> {
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(IDENTITY_KEYS)?;
        get_uuid(&keys, &identity_key(drive_id, kind, id))
    }
}

/// Insert identity keys for a header whose file holds none, skipping keys
/// already taken.
fn restore_identity(keys: &mut BytesTable<'_>, files: &mut BytesTable<'_>, header: &ServerFileHeader) -> DbResult<()> {
    let file = header.file();
    let fkey = file_key(&file);
    if files.get(fkey.as_slice())?.is_some() {
        return Ok(());
    }
    let mut record = FileIdentity::default();
    let candidates = [
        (
            UNIQUE_ID_KIND,
            header.file_metadata.app_data.unique_id.filter(|_| header.is_active()),
        ),
        (GLOBAL_TRANSIT_ID_KIND, header.file_metadata.global_transit_id),
    ];
    for (kind, id) in candidates {
        let Some(id) = id else { continue };
        let key = identity_key(&file.drive_id, kind, &id);
        if get_uuid(&*keys, &key)?.is_some() {
            continue;
        }
        keys.insert(key.as_slice(), file.file_id.as_bytes().as_slice())?;
        if kind == UNIQUE_ID_KIND {
            record.unique_id = Some(id);
        } else {
            record.global_transit_id = Some(id);
        }
    }
    let json = serde_json::to_vec(&record)?;
    files.insert(fkey.as_slice(), json.as_slice())?;
    Ok(())
}

/// Resolves scanned keys to headers and keeps the page bookkeeping.
struct Collector<'r, R, F> {
    drive_id: &'r Uuid,
    generation: u32,
    entries: &'r R,
    skip_key: Option<&'r [u8]>,
    limit: usize,
    accept: F,
    page: ScanPage,
}

impl<'r, R, F> Collector<'r, R, F>
where
    R: ReadableTable<&'static [u8], &'static [u8]>,
    F: FnMut(&ServerFileHeader) -> bool,
{
    fn new(
        drive_id: &'r Uuid,
        generation: u32,
        entries: &'r R,
        skip_key: Option<&'r [u8]>,
        limit: usize,
        accept: F,
    ) -> Self {
        Self {
            drive_id,
            generation,
            entries,
            skip_key,
            limit: limit.max(1),
            accept,
            page: ScanPage::default(),
        }
    }

    /// Returns true once the page is full and one more match was seen.
    fn visit(&mut self, key: &[u8], value: &[u8]) -> DbResult<bool> {
        if self.skip_key == Some(key) {
            return Ok(false);
        }
        let file_id = read_uuid(value, 0).ok_or(DbError::CorruptKey("index scan"))?;
        let Some(header) =
            get_json::<ServerFileHeader, _>(self.entries, &entry_key(self.drive_id, self.generation, &file_id))?
        else {
            return Ok(false);
        };
        if !(self.accept)(&header) {
            return Ok(false);
        }
        if self.page.headers.len() == self.limit {
            self.page.has_more = true;
            return Ok(true);
        }
        self.page.headers.push(header);
        self.page.cursor = key.get(GEN_PREFIX_LEN..).map(<[u8]>::to_vec);
        Ok(false)
    }

}
