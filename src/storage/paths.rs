// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path layout of the tenant data directory.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::DEFAULT_DATA_DIR;

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

impl StoragePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========== Drives ==========

    pub fn drives_dir(&self) -> PathBuf {
        self.root.join("drives")
    }

    pub fn drive_dir(&self, drive_id: &Uuid) -> PathBuf {
        self.drives_dir().join(drive_id.simple().to_string())
    }

    /// Persisted drive definition.
    pub fn drive_definition(&self, drive_id: &Uuid) -> PathBuf {
        self.drive_dir(drive_id).join("drive.json")
    }

    /// Root of committed files; below it is a `yyyy/mm/dd/hh` tree.
    pub fn drive_files_dir(&self, drive_id: &Uuid) -> PathBuf {
        self.drive_dir(drive_id).join("files")
    }

    pub fn drive_temp_dir(&self, drive_id: &Uuid) -> PathBuf {
        self.drive_dir(drive_id).join("temp")
    }

    // ========== Keys ==========

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    /// Tenant master key (32 raw bytes).
    pub fn master_key(&self) -> PathBuf {
        self.keys_dir().join("master.key")
    }

    /// Offline key pair (PKCS#8 PEM).
    pub fn offline_key(&self) -> PathBuf {
        self.keys_dir().join("offline.pem")
    }

    // ========== Databases ==========

    pub fn db_dir(&self) -> PathBuf {
        self.root.join("db")
    }

    pub fn index_db(&self) -> PathBuf {
        self.db_dir().join("index.redb")
    }

    pub fn outbox_db(&self) -> PathBuf {
        self.db_dir().join("outbox.redb")
    }

    pub fn inbox_db(&self) -> PathBuf {
        self.db_dir().join("inbox.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_use_data_root() {
        let paths = StoragePaths::default();
        assert_eq!(paths.root(), Path::new("/data"));
    }

    #[test]
    fn drive_paths_are_correct() {
        let paths = StoragePaths::new("/tmp/test-data");
        let id = Uuid::from_u128(0xabc);
        let simple = id.simple().to_string();
        assert_eq!(
            paths.drive_definition(&id),
            PathBuf::from(format!("/tmp/test-data/drives/{simple}/drive.json"))
        );
        assert_eq!(
            paths.drive_temp_dir(&id),
            PathBuf::from(format!("/tmp/test-data/drives/{simple}/temp"))
        );
        assert_eq!(
            paths.drive_files_dir(&id),
            PathBuf::from(format!("/tmp/test-data/drives/{simple}/files"))
        );
    }

    #[test]
    fn key_and_db_paths_are_correct() {
        let paths = StoragePaths::default();
        assert_eq!(paths.master_key(), PathBuf::from("/data/keys/master.key"));
        assert_eq!(paths.offline_key(), PathBuf::from("/data/keys/offline.pem"));
        assert_eq!(paths.index_db(), PathBuf::from("/data/db/index.redb"));
        assert_eq!(paths.outbox_db(), PathBuf::from("/data/db/outbox.redb"));
        assert_eq!(paths.inbox_db(), PathBuf::from("/data/db/inbox.redb"));
    }
}
