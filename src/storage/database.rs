// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared pieces of the embedded redb databases (index, outbox, inbox).
//!
//! Keys are composite byte strings. Fixed-width fields are big-endian so
//! lexicographic order equals numeric order; an inverted timestamp gives
//! newest-first scans. Paging cursors are the hex of the last key
//! returned; a scan resumes strictly after it.

use std::path::Path;

use redb::Database;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid cursor")]
    InvalidCursor,

    #[error("corrupt key in table {0}")]
    CorruptKey(&'static str),
}

pub type DbResult<T> = Result<T, DbError>;

/// Open (or create) a database file, creating its parent directory.
pub fn open_database(path: &Path) -> DbResult<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    Ok(Database::create(path)?)
}

// =============================================================================
// Key helpers
// =============================================================================

/// Incrementally built composite key.
#[derive(Debug, Default, Clone)]
pub struct KeyBuilder(Vec<u8>);

impl KeyBuilder {
    pub fn new() -> Self {
        Self(Vec::with_capacity(64))
    }

    pub fn uuid(mut self, id: &Uuid) -> Self {
        self.0.extend_from_slice(id.as_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Bitwise-inverted uuid, for descending scans.
    pub fn uuid_desc(mut self, id: &Uuid) -> Self {
        self.0.extend(id.as_bytes().iter().map(|b| !b));
        self
    }

    /// Signed timestamp mapped to an order-preserving unsigned value.
    pub fn timestamp(self, ms: i64) -> Self {
        self.u64(order_preserving(ms))
    }

    /// Inverted timestamp, for newest-first scans.
    pub fn timestamp_desc(self, ms: i64) -> Self {
        self.u64(!order_preserving(ms))
    }

    pub fn str(mut self, s: &str) -> Self {
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(0);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.0
    }
}

fn order_preserving(ms: i64) -> u64 {
    (ms as u64) ^ (1u64 << 63)
}

/// Exclusive upper bound of every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    end.extend_from_slice(&[0xFF; 64]);
    end
}

pub fn read_uuid(bytes: &[u8], offset: usize) -> Option<Uuid> {
    bytes
        .get(offset..offset + 16)
        .and_then(|s| Uuid::from_slice(s).ok())
}

/// Read back a uuid written with [`KeyBuilder::uuid_desc`].
pub fn read_uuid_desc(bytes: &[u8], offset: usize) -> Option<Uuid> {
    let slice = bytes.get(offset..offset + 16)?;
    let mut raw = [0u8; 16];
    for (dst, src) in raw.iter_mut().zip(slice) {
        *dst = !src;
    }
    Some(Uuid::from_bytes(raw))
}

pub fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    bytes
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_be_bytes)
}

// =============================================================================
// Cursor encoding
// =============================================================================

pub fn encode_cursor(key: &[u8]) -> String {
    hex::encode(key)
}

pub fn decode_cursor(cursor: &str) -> DbResult<Vec<u8>> {
    hex::decode(cursor).map_err(|_| DbError::InvalidCursor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descending_timestamps_sort_newest_first() {
        let old = KeyBuilder::new().timestamp_desc(1_000).build();
        let new = KeyBuilder::new().timestamp_desc(2_000).build();
        assert!(new < old);
    }

    #[test]
    fn ascending_timestamps_handle_negative_values() {
        let neg = KeyBuilder::new().timestamp(-5).build();
        let zero = KeyBuilder::new().timestamp(0).build();
        let pos = KeyBuilder::new().timestamp(5).build();
        assert!(neg < zero && zero < pos);
    }

    #[test]
    fn prefix_end_bounds_all_extensions() {
        let prefix = KeyBuilder::new().uuid(&Uuid::new_v4()).build();
        let longer = KeyBuilder::new()
            .uuid(&Uuid::from_slice(&prefix).unwrap())
            .u64(u64::MAX)
            .uuid(&Uuid::from_u128(u128::MAX))
            .build();
        assert!(longer.as_slice() < prefix_end(&prefix).as_slice());
        assert!(longer.as_slice() > prefix.as_slice());
    }

    #[test]
    fn cursor_roundtrip_and_rejects_garbage() {
        let key = KeyBuilder::new().u32(7).str("x").build();
        assert_eq!(decode_cursor(&encode_cursor(&key)).unwrap(), key);
        assert!(matches!(decode_cursor("zz"), Err(DbError::InvalidCursor)));
    }

    #[test]
    fn read_helpers_extract_fields() {
        let id = Uuid::new_v4();
        let key = KeyBuilder::new().u64(42).uuid(&id).build();
        assert_eq!(read_u64(&key, 0), Some(42));
        assert_eq!(read_uuid(&key, 8), Some(id));
        assert_eq!(read_uuid(&key, 20), None);

        let desc = KeyBuilder::new().uuid_desc(&id).build();
        assert_eq!(read_uuid_desc(&desc, 0), Some(id));
    }

    #[test]
    fn descending_uuids_sort_in_reverse() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert!(KeyBuilder::new().uuid_desc(&b).build() < KeyBuilder::new().uuid_desc(&a).build());
    }
}
