// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Committed file storage for one drive.
//!
//! ```text
//! drives/{drive_id}/files/{yyyy}/{mm}/{dd}/{hh}/
//!   {file_id}.header
//!   {file_id}-{payload_key}.payload
//!   {file_id}-{payload_key}-{w}x{h}.thumb
//! ```
//!
//! The date path comes from the timestamp embedded in the time-ordered
//! file id, so a file's directory never changes across overwrites.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use uuid::Uuid;

use super::{StorageError, TenantStorage};
use crate::drive::{sequential_id, PayloadDescriptor, ServerFileHeader};
use crate::error::{ClientErrorCode, HostError, HostResult};

const HEADER_EXT: &str = "header";
const PAYLOAD_EXT: &str = "payload";
const THUMB_EXT: &str = "thumb";

/// A byte range of a part. `length` is clamped to the end of the part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub start: u64,
    pub length: u64,
}

/// Addressable binary part of a committed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePart {
    Payload { key: String },
    Thumbnail { key: String, width: u32, height: u32 },
}

impl FilePart {
    pub fn payload(key: impl Into<String>) -> Self {
        FilePart::Payload { key: key.into() }
    }

    pub fn thumbnail(key: impl Into<String>, width: u32, height: u32) -> Self {
        FilePart::Thumbnail {
            key: key.into(),
            width,
            height,
        }
    }
}

fn storage_name(file_id: &Uuid) -> String {
    file_id.simple().to_string()
}

/// Long-term storage of one drive.
pub struct LongTermStorageManager<'a> {
    storage: &'a TenantStorage,
    drive_id: Uuid,
}

impl<'a> LongTermStorageManager<'a> {
    pub fn new(storage: &'a TenantStorage, drive_id: Uuid) -> Self {
        Self { storage, drive_id }
    }

    pub fn drive_id(&self) -> Uuid {
        self.drive_id
    }

    pub fn create_file_id(&self) -> Uuid {
        sequential_id()
    }

    // ========== Paths ==========

    fn file_dir(&self, file_id: &Uuid) -> PathBuf {
        let created = file_id
            .get_timestamp()
            .and_then(|ts| {
                let (secs, _) = ts.to_unix();
                DateTime::<Utc>::from_timestamp(secs as i64, 0)
            })
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        self.storage
            .paths()
            .drive_files_dir(&self.drive_id)
            .join(format!("{:04}", created.year()))
            .join(format!("{:02}", created.month()))
            .join(format!("{:02}", created.day()))
            .join(format!("{:02}", created.hour()))
    }

    fn header_path(&self, file_id: &Uuid) -> PathBuf {
        self.file_dir(file_id)
            .join(format!("{}.{HEADER_EXT}", storage_name(file_id)))
    }

    fn part_path(&self, file_id: &Uuid, part: &FilePart) -> PathBuf {
        let name = storage_name(file_id);
        let file_name = match part {
            FilePart::Payload { key } => format!("{name}-{key}.{PAYLOAD_EXT}"),
            FilePart::Thumbnail { key, width, height } => {
                format!("{name}-{key}-{width}x{height}.{THUMB_EXT}")
            }
        };
        self.file_dir(file_id).join(file_name)
    }

    // ========== Headers ==========

    /// Persist a header; returns its serialized length.
    pub fn save_header(&self, header: &ServerFileHeader) -> HostResult<u64> {
        let file_id = header.file_metadata.file.file_id;
        Ok(self.storage.write_json(self.header_path(&file_id), header)?)
    }

    /// Serialized length a header would occupy on disk.
    pub fn header_len(header: &ServerFileHeader) -> HostResult<u64> {
        Ok(serde_json::to_vec_pretty(header)?.len() as u64)
    }

    pub fn get_server_file_header(&self, file_id: &Uuid) -> HostResult<Option<ServerFileHeader>> {
        Ok(self.storage.read_json_opt(self.header_path(file_id))?)
    }

    /// One page of every header on the drive, in file id order.
    pub fn get_server_file_headers(&self, skip: usize, take: usize) -> HostResult<Vec<ServerFileHeader>> {
        let root = self.storage.paths().drive_files_dir(&self.drive_id);
        let mut headers = Vec::new();
        for path in self.storage.walk_files(&root, HEADER_EXT)?.into_iter().skip(skip).take(take) {
            match self.storage.read_json::<ServerFileHeader>(&path) {
                Ok(h) => headers.push(h),
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(headers)
    }

    // ========== Parts ==========

    pub fn write_part_stream(&self, file_id: &Uuid, part: &FilePart, bytes: &[u8]) -> HostResult<()> {
        Ok(self.storage.write_raw(self.part_path(file_id, part), bytes)?)
    }

    /// Read a part, optionally a chunk of it. A missing part is `None`.
    pub fn get_file_part_stream(
        &self,
        file_id: &Uuid,
        part: &FilePart,
        chunk: Option<FileChunk>,
    ) -> HostResult<Option<Vec<u8>>> {
        let path = self.part_path(file_id, part);
        let result = match chunk {
            Some(c) => self.storage.read_range(&path, c.start, Some(c.length)),
            None => self.storage.read_raw(&path),
        };
        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(StorageError::InvalidRange { start, len }) => Err(HostError::client(
                ClientErrorCode::InvalidChunkStart,
                format!("chunk start {start} is beyond the part length {len}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn move_payload_to_long_term(&self, file_id: &Uuid, key: &str, source: &Path) -> HostResult<()> {
        let dest = self.part_path(file_id, &FilePart::payload(key));
        self.storage.move_file(source, &dest)?;
        tracing::debug!(drive_id = %self.drive_id, file_id = %file_id, key, "Payload moved to long-term storage");
        Ok(())
    }

    pub fn move_thumbnail_to_long_term(
        &self,
        file_id: &Uuid,
        key: &str,
        width: u32,
        height: u32,
        source: &Path,
    ) -> HostResult<()> {
        let dest = self.part_path(file_id, &FilePart::thumbnail(key, width, height));
        self.storage.move_file(source, &dest)?;
        Ok(())
    }

    /// Parsed (payload key, optional thumbnail size) of every part on disk.
    fn parts_on_disk(&self, file_id: &Uuid) -> HostResult<Vec<(PathBuf, FilePart)>> {
        let dir = self.file_dir(file_id);
        let prefix = format!("{}-", storage_name(file_id));
        let mut parts = Vec::new();
        for name in self.storage.list_files_with_prefix(&dir, &prefix)? {
            let rest = &name[prefix.len()..];
            let part = if let Some(key) = rest.strip_suffix(&format!(".{PAYLOAD_EXT}")) {
                Some(FilePart::payload(key))
            } else if let Some(stem) = rest.strip_suffix(&format!(".{THUMB_EXT}")) {
                stem.rsplit_once('-').and_then(|(key, size)| {
                    let (w, h) = size.split_once('x')?;
                    Some(FilePart::thumbnail(key, w.parse().ok()?, h.parse().ok()?))
                })
            } else {
                None
            };
            if let Some(part) = part {
                parts.push((dir.join(&name), part));
            }
        }
        Ok(parts)
    }

    /// Delete payload files whose key is not in `keep`.
    pub fn delete_missing_payloads(&self, file_id: &Uuid, keep: &[PayloadDescriptor]) -> HostResult<()> {
        for (path, part) in self.parts_on_disk(file_id)? {
            if let FilePart::Payload { key } = part {
                if !keep.iter().any(|p| p.key == key) {
                    self.storage.ensure_deleted(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Delete thumbnail files not described by any payload in `keep`.
    pub fn delete_missing_thumbnail_files(&self, file_id: &Uuid, keep: &[PayloadDescriptor]) -> HostResult<()> {
        for (path, part) in self.parts_on_disk(file_id)? {
            if let FilePart::Thumbnail { key, width, height } = part {
                let kept = keep.iter().any(|p| {
                    p.key == key
                        && p.thumbnails
                            .iter()
                            .any(|t| t.pixel_width == width && t.pixel_height == height)
                });
                if !kept {
                    self.storage.ensure_deleted(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Delete every payload and thumbnail, keeping the header.
    pub fn delete_attachments(&self, file_id: &Uuid) -> HostResult<()> {
        for (path, _) in self.parts_on_disk(file_id)? {
            self.storage.ensure_deleted(&path)?;
        }
        Ok(())
    }

    pub fn hard_delete(&self, file_id: &Uuid) -> HostResult<()> {
        self.delete_attachments(file_id)?;
        self.storage.ensure_deleted(self.header_path(file_id))?;
        Ok(())
    }

    /// True when the header and every payload it describes exist.
    pub fn file_exists(&self, file_id: &Uuid) -> HostResult<bool> {
        let Some(header) = self.get_server_file_header(file_id)? else {
            return Ok(false);
        };
        Ok(header
            .file_metadata
            .payloads
            .iter()
            .all(|p| self.storage.exists(self.part_path(file_id, &FilePart::payload(&p.key)))))
    }

    /// Bytes used by all payloads and thumbnails of a file.
    pub fn get_payload_disk_usage(&self, file_id: &Uuid) -> HostResult<u64> {
        let mut total = 0;
        for (path, _) in self.parts_on_disk(file_id)? {
            total += self.storage.file_len(&path)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyHeader;
    use crate::crypto::SymmetricKey;
    use crate::drive::{
        AppData, FileMetadata, FileSystemType, InternalDriveFileId, ServerMetadata, ThumbnailDescriptor,
    };
    use crate::identity::AccessControlList;

    fn setup() -> (TenantStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (TenantStorage::open(dir.path()).unwrap(), dir)
    }

    fn header(drive_id: Uuid, file_id: Uuid, payloads: Vec<PayloadDescriptor>) -> ServerFileHeader {
        let key = SymmetricKey::generate().unwrap();
        let mut metadata = FileMetadata::new(InternalDriveFileId::new(drive_id, file_id), AppData::default());
        metadata.payloads = payloads;
        ServerFileHeader {
            encrypted_key_header: KeyHeader::empty().encrypt(&key).unwrap(),
            file_metadata: metadata,
            server_metadata: ServerMetadata::new(AccessControlList::owner_only(), FileSystemType::Standard),
        }
    }

    #[test]
    fn header_roundtrip_and_missing_is_none() {
        let (storage, _dir) = setup();
        let lts = LongTermStorageManager::new(&storage, Uuid::new_v4());
        let file_id = lts.create_file_id();

        assert!(lts.get_server_file_header(&file_id).unwrap().is_none());
        let h = header(lts.drive_id(), file_id, vec![]);
        let len = lts.save_header(&h).unwrap();
        assert_eq!(len, LongTermStorageManager::header_len(&h).unwrap());
        assert_eq!(lts.get_server_file_header(&file_id).unwrap(), Some(h));
    }

    #[test]
    fn date_path_is_derived_from_file_id() {
        let (storage, _dir) = setup();
        let lts = LongTermStorageManager::new(&storage, Uuid::new_v4());
        let file_id = lts.create_file_id();
        let path = lts.header_path(&file_id);
        let year = format!("{:04}", Utc::now().year());
        assert!(path.to_string_lossy().contains(&format!("/files/{year}/")));
    }

    #[test]
    fn chunked_reads_clamp_and_reject_bad_start() {
        let (storage, _dir) = setup();
        let lts = LongTermStorageManager::new(&storage, Uuid::new_v4());
        let file_id = lts.create_file_id();
        let part = FilePart::payload("pst");
        lts.write_part_stream(&file_id, &part, b"abcdefgh").unwrap();

        let chunk = lts
            .get_file_part_stream(&file_id, &part, Some(FileChunk { start: 6, length: 10 }))
            .unwrap();
        assert_eq!(chunk.as_deref(), Some(&b"gh"[..]));

        let err = lts
            .get_file_part_stream(&file_id, &part, Some(FileChunk { start: 20, length: 1 }))
            .unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::InvalidChunkStart));

        assert!(lts
            .get_file_part_stream(&file_id, &FilePart::payload("nope"), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn delete_missing_parts_keeps_described_ones() {
        let (storage, _dir) = setup();
        let lts = LongTermStorageManager::new(&storage, Uuid::new_v4());
        let file_id = lts.create_file_id();
        for part in [
            FilePart::payload("keep-me"),
            FilePart::payload("drop"),
            FilePart::thumbnail("keep-me", 10, 10),
            FilePart::thumbnail("keep-me", 20, 20),
        ] {
            lts.write_part_stream(&file_id, &part, b"x").unwrap();
        }
        let keep = vec![PayloadDescriptor::new("keep-me", "image/png")
            .with_thumbnail(ThumbnailDescriptor::new(10, 10, "image/png"))];

        lts.delete_missing_payloads(&file_id, &keep).unwrap();
        lts.delete_missing_thumbnail_files(&file_id, &keep).unwrap();

        let remaining: Vec<FilePart> = lts.parts_on_disk(&file_id).unwrap().into_iter().map(|(_, p)| p).collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&FilePart::payload("keep-me")));
        assert!(remaining.contains(&FilePart::thumbnail("keep-me", 10, 10)));
    }

    #[test]
    fn file_exists_requires_every_payload() {
        let (storage, _dir) = setup();
        let lts = LongTermStorageManager::new(&storage, Uuid::new_v4());
        let file_id = lts.create_file_id();
        let h = header(lts.drive_id(), file_id, vec![PayloadDescriptor::new("a", "text/plain")]);
        lts.save_header(&h).unwrap();
        assert!(!lts.file_exists(&file_id).unwrap());

        lts.write_part_stream(&file_id, &FilePart::payload("a"), b"12345").unwrap();
        assert!(lts.file_exists(&file_id).unwrap());
        assert_eq!(lts.get_payload_disk_usage(&file_id).unwrap(), 5);
    }

    #[test]
    fn hard_delete_removes_everything() {
        let (storage, _dir) = setup();
        let lts = LongTermStorageManager::new(&storage, Uuid::new_v4());
        let file_id = lts.create_file_id();
        lts.save_header(&header(lts.drive_id(), file_id, vec![])).unwrap();
        lts.write_part_stream(&file_id, &FilePart::payload("a"), b"1").unwrap();

        lts.hard_delete(&file_id).unwrap();
        assert!(lts.get_server_file_header(&file_id).unwrap().is_none());
        assert_eq!(lts.get_payload_disk_usage(&file_id).unwrap(), 0);
        // idempotent
        lts.hard_delete(&file_id).unwrap();
    }

    #[test]
    fn get_server_file_headers_pages_all_files() {
        let (storage, _dir) = setup();
        let lts = LongTermStorageManager::new(&storage, Uuid::new_v4());
        for _ in 0..5 {
            let id = lts.create_file_id();
            lts.save_header(&header(lts.drive_id(), id, vec![])).unwrap();
        }
        assert_eq!(lts.get_server_file_headers(0, 3).unwrap().len(), 3);
        assert_eq!(lts.get_server_file_headers(3, 3).unwrap().len(), 2);
    }
}
