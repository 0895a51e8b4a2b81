// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Tenant filesystem operations.
//!
//! Everything the host keeps outside redb lives under the tenant data
//! directory: drive definitions and file headers as JSON, payload and
//! thumbnail parts as raw bytes, plus key files. Writes go to a sibling
//! `.tmp` file first and are renamed into place, so a reader never sees a
//! half-written header or part.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use super::StoragePaths;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage not initialized")]
    NotInitialized,

    #[error("Invalid range: start {start} is beyond length {len}")]
    InvalidRange { start: u64, len: u64 },
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(e.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Filesystem access rooted at the tenant data directory.
#[derive(Debug, Clone)]
pub struct TenantStorage {
    paths: StoragePaths,
    initialized: bool,
}

impl TenantStorage {
    /// Does NOT create the directory structure. Call `initialize()` first.
    pub fn new(paths: StoragePaths) -> Self {
        Self {
            paths,
            initialized: false,
        }
    }

    /// Create and initialize storage rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let mut storage = Self::new(StoragePaths::new(root));
        storage.initialize()?;
        Ok(storage)
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Create the top-level directories. Idempotent.
    pub fn initialize(&mut self) -> StorageResult<()> {
        for dir in [self.paths.drives_dir(), self.paths.keys_dir(), self.paths.db_dir()] {
            fs::create_dir_all(&dir)?;
        }
        self.initialized = true;
        Ok(())
    }

    fn ensure_initialized(&self) -> StorageResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(StorageError::NotInitialized)
        }
    }

    /// Write-read-delete probe of the data directory.
    pub fn health_check(&self) -> StorageResult<()> {
        self.ensure_initialized()?;
        let probe = self.paths.root().join(".health_check");
        let data = b"health_check_data";
        fs::write(&probe, data)?;
        let read = fs::read(&probe)?;
        fs::remove_file(&probe)?;
        if read != data {
            return Err(StorageError::Io(io::Error::other("health check data mismatch")));
        }
        Ok(())
    }

    // ========== JSON ==========

    pub fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> StorageResult<T> {
        self.ensure_initialized()?;
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Read a JSON file, mapping absence to `None`.
    pub fn read_json_opt<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> StorageResult<Option<T>> {
        match self.read_json(path) {
            Ok(v) => Ok(Some(v)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Atomic JSON write; returns the number of bytes written.
    pub fn write_json<T: Serialize>(&self, path: impl AsRef<Path>, value: &T) -> StorageResult<u64> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_raw(path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    // ========== Raw bytes ==========

    /// Atomic raw write via a sibling temp file.
    pub fn write_raw(&self, path: impl AsRef<Path>, data: &[u8]) -> StorageResult<()> {
        self.ensure_initialized()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_sibling(path);
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(data)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_raw(&self, path: impl AsRef<Path>) -> StorageResult<Vec<u8>> {
        self.ensure_initialized()?;
        let mut file = File::open(path.as_ref())?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Read up to `length` bytes starting at `start`. A start at or past
    /// the end of a non-empty file is an error; the length is clamped.
    pub fn read_range(&self, path: impl AsRef<Path>, start: u64, length: Option<u64>) -> StorageResult<Vec<u8>> {
        self.ensure_initialized()?;
        let mut file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        if start > len || (start == len && len > 0) {
            return Err(StorageError::InvalidRange { start, len });
        }
        let available = len - start;
        let take = length.map(|l| l.min(available)).unwrap_or(available);
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; take as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn file_len(&self, path: impl AsRef<Path>) -> StorageResult<u64> {
        self.ensure_initialized()?;
        Ok(fs::metadata(path.as_ref())?.len())
    }

    /// Uses `File::open()` rather than `Path::exists()` so permission
    /// problems read as absence.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        File::open(path.as_ref()).is_ok()
    }

    /// Rename `from` to `to`, replacing any existing file.
    pub fn move_file(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> StorageResult<()> {
        self.ensure_initialized()?;
        let to = to.as_ref();
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from.as_ref(), to)?;
        Ok(())
    }

    pub fn delete(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        self.ensure_initialized()?;
        fs::remove_file(path.as_ref())?;
        Ok(())
    }

    /// Delete a file if present. Never fails on absence.
    pub fn ensure_deleted(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        match self.delete(path) {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn create_dir(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        self.ensure_initialized()?;
        fs::create_dir_all(path.as_ref())?;
        Ok(())
    }

    // ========== Listing ==========

    /// File names (with extension) in `dir` whose name starts with `prefix`.
    pub fn list_files_with_prefix(&self, dir: impl AsRef<Path>, prefix: &str) -> StorageResult<Vec<String>> {
        self.ensure_initialized()?;
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) && !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn list_dirs(&self, dir: impl AsRef<Path>) -> StorageResult<Vec<String>> {
        self.ensure_initialized()?;
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Every file below `dir` (recursively) with the given extension,
    /// sorted by path.
    pub fn walk_files(&self, dir: impl AsRef<Path>, extension: &str) -> StorageResult<Vec<PathBuf>> {
        self.ensure_initialized()?;
        let mut out = Vec::new();
        let mut stack = vec![dir.as_ref().to_path_buf()];
        while let Some(current) = stack.pop() {
            if !current.exists() {
                continue;
            }
            for entry in fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == extension) {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn test_storage() -> (TenantStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = TenantStorage::open(dir.path()).unwrap();
        (storage, dir)
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        id: String,
        value: i32,
    }

    #[test]
    fn initialize_creates_directories() {
        let (storage, _dir) = test_storage();
        assert!(storage.paths().drives_dir().exists());
        assert!(storage.paths().keys_dir().exists());
        assert!(storage.paths().db_dir().exists());
    }

    #[test]
    fn write_and_read_json() {
        let (storage, _dir) = test_storage();
        let data = TestData {
            id: "a".into(),
            value: 42,
        };
        let path = storage.paths().drives_dir().join("x").join("t.json");
        let written = storage.write_json(&path, &data).unwrap();
        assert!(written > 0);
        assert_eq!(storage.read_json::<TestData>(&path).unwrap(), data);
        assert!(!storage.exists(tmp_sibling(&path)));
    }

    #[test]
    fn missing_json_reads_as_none() {
        let (storage, _dir) = test_storage();
        let path = storage.paths().drives_dir().join("missing.json");
        assert!(storage.read_json_opt::<TestData>(&path).unwrap().is_none());
    }

    #[test]
    fn read_range_clamps_length_and_rejects_bad_start() {
        let (storage, _dir) = test_storage();
        let path = storage.paths().drives_dir().join("part.bin");
        storage.write_raw(&path, b"0123456789").unwrap();

        assert_eq!(storage.read_range(&path, 2, Some(3)).unwrap(), b"234");
        assert_eq!(storage.read_range(&path, 8, Some(100)).unwrap(), b"89");
        assert_eq!(storage.read_range(&path, 0, None).unwrap(), b"0123456789");
        assert!(matches!(
            storage.read_range(&path, 10, None),
            Err(StorageError::InvalidRange { start: 10, len: 10 })
        ));
    }

    #[test]
    fn move_file_replaces_destination() {
        let (storage, _dir) = test_storage();
        let from = storage.paths().drives_dir().join("a.bin");
        let to = storage.paths().drives_dir().join("nested").join("b.bin");
        storage.write_raw(&to, b"old").unwrap();
        storage.write_raw(&from, b"new").unwrap();

        storage.move_file(&from, &to).unwrap();
        assert_eq!(storage.read_raw(&to).unwrap(), b"new");
        assert!(!storage.exists(&from));
    }

    #[test]
    fn ensure_deleted_tolerates_absence() {
        let (storage, _dir) = test_storage();
        let path = storage.paths().drives_dir().join("gone.bin");
        storage.ensure_deleted(&path).unwrap();
        storage.write_raw(&path, b"x").unwrap();
        storage.ensure_deleted(&path).unwrap();
        assert!(!storage.exists(&path));
    }

    #[test]
    fn walk_files_finds_nested_headers() {
        let (storage, _dir) = test_storage();
        let root = storage.paths().drives_dir().join("d");
        storage.write_raw(root.join("2026/01/02/03/a.header"), b"{}").unwrap();
        storage.write_raw(root.join("2026/02/01/00/b.header"), b"{}").unwrap();
        storage.write_raw(root.join("2026/02/01/00/b-k.payload"), b"p").unwrap();

        let found = storage.walk_files(&root, "header").unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn list_files_with_prefix_skips_temp_files() {
        let (storage, _dir) = test_storage();
        let dir = storage.paths().drives_dir();
        storage.write_raw(dir.join("f1-a.payload"), b"1").unwrap();
        storage.write_raw(dir.join("f1-b.payload"), b"2").unwrap();
        storage.write_raw(dir.join("f2-a.payload"), b"3").unwrap();
        fs::write(dir.join("f1-c.payload.tmp"), b"4").unwrap();

        let names = storage.list_files_with_prefix(&dir, "f1-").unwrap();
        assert_eq!(names, vec!["f1-a.payload".to_string(), "f1-b.payload".to_string()]);
    }

    #[test]
    fn health_check_works() {
        let (storage, _dir) = test_storage();
        storage.health_check().unwrap();
    }

    #[test]
    fn uninitialized_storage_returns_error() {
        let storage = TenantStorage::new(StoragePaths::new("/tmp/never-init"));
        let result = storage.read_json::<TestData>("/tmp/any.json");
        assert!(matches!(result, Err(StorageError::NotInitialized)));
    }
}
