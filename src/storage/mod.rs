// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Tenant Storage
//!
//! Durable state of one tenant, all below the data directory:
//!
//! ```text
//! {DATA_DIR}/
//!   drives/{drive_id}/
//!     drive.json                     # drive definition
//!     temp/{file_id}.{ext}           # upload staging
//!     files/{yyyy}/{mm}/{dd}/{hh}/   # committed headers and parts
//!   keys/
//!     master.key                     # tenant master key
//!     offline.pem                    # offline key pair
//!   db/
//!     index.redb                     # query index + identity keys
//!     outbox.redb                    # transit outbox
//!     inbox.redb                     # transit inbox
//! ```

pub mod database;
pub mod long_term;
pub mod paths;
pub mod temp;
pub mod tenant_fs;

pub use database::{DbError, DbResult};
pub use long_term::{FileChunk, FilePart, LongTermStorageManager};
pub use paths::StoragePaths;
pub use temp::TempStorageManager;
pub use tenant_fs::{StorageError, StorageResult, TenantStorage};
