// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Upload staging area for one drive: `drives/{drive_id}/temp/{file_id}.{ext}`.
//!
//! Extensions name the staged part: `metadata`, `transferkeyheader`,
//! `{payload_key}.payload` and `{payload_key}-{w}x{h}.thumb`.

use std::path::PathBuf;

use uuid::Uuid;

use super::{StorageError, TenantStorage};
use crate::error::HostResult;

pub fn payload_extension(key: &str) -> String {
    format!("{key}.payload")
}

pub fn thumbnail_extension(key: &str, width: u32, height: u32) -> String {
    format!("{key}-{width}x{height}.thumb")
}

pub struct TempStorageManager<'a> {
    storage: &'a TenantStorage,
    drive_id: Uuid,
}

impl<'a> TempStorageManager<'a> {
    pub fn new(storage: &'a TenantStorage, drive_id: Uuid) -> Self {
        Self { storage, drive_id }
    }

    pub fn get_path(&self, file_id: &Uuid, extension: &str) -> PathBuf {
        self.storage
            .paths()
            .drive_temp_dir(&self.drive_id)
            .join(format!("{}.{extension}", file_id.simple()))
    }

    pub fn write_stream(&self, file_id: &Uuid, extension: &str, bytes: &[u8]) -> HostResult<u64> {
        self.storage.write_raw(self.get_path(file_id, extension), bytes)?;
        Ok(bytes.len() as u64)
    }

    /// A missing temp part is `None`.
    pub fn get_stream(&self, file_id: &Uuid, extension: &str) -> HostResult<Option<Vec<u8>>> {
        match self.storage.read_raw(self.get_path(file_id, extension)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, file_id: &Uuid, extension: &str) -> bool {
        self.storage.exists(self.get_path(file_id, extension))
    }

    /// Best effort: never fails on absence.
    pub fn ensure_deleted(&self, file_id: &Uuid, extension: &str) -> HostResult<()> {
        Ok(self.storage.ensure_deleted(self.get_path(file_id, extension))?)
    }

    /// Delete every staged part of a file.
    pub fn ensure_all_deleted(&self, file_id: &Uuid) -> HostResult<()> {
        let dir = self.storage.paths().drive_temp_dir(&self.drive_id);
        let prefix = format!("{}.", file_id.simple());
        for name in self.storage.list_files_with_prefix(&dir, &prefix)? {
            if let Err(e) = self.storage.ensure_deleted(dir.join(&name)) {
                tracing::warn!(drive_id = %self.drive_id, file = %name, error = %e, "Failed to remove temp file");
            }
        }
        Ok(())
    }
}
