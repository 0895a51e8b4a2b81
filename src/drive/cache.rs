// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process cache of drive definitions.
//!
//! Definitions are kept in an LRU keyed by drive id; the alias index
//! (target drive -> id) is never evicted so alias lookups stay cheap even
//! when a definition has to be re-read from disk.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use uuid::Uuid;

use super::{StorageDrive, TargetDrive};

struct Inner {
    drives: LruCache<Uuid, StorageDrive>,
    aliases: HashMap<TargetDrive, Uuid>,
}

pub struct DriveCache {
    inner: Mutex<Inner>,
}

impl DriveCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                drives: LruCache::new(capacity),
                aliases: HashMap::new(),
            }),
        }
    }

    pub fn get(&self, drive_id: &Uuid) -> Option<StorageDrive> {
        let mut inner = self.inner.lock().ok()?;
        inner.drives.get(drive_id).cloned()
    }

    pub fn id_for(&self, target: &TargetDrive) -> Option<Uuid> {
        let inner = self.inner.lock().ok()?;
        inner.aliases.get(target).copied()
    }

    /// Insert or replace a definition.
    pub fn put(&self, drive: StorageDrive) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.aliases.insert(drive.target_drive, drive.id);
            inner.drives.put(drive.id, drive);
        }
    }

    /// Every known drive id, cached or not.
    pub fn known_ids(&self) -> Vec<Uuid> {
        match self.inner.lock() {
            Ok(inner) => inner.aliases.values().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn invalidate(&self, drive_id: &Uuid) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.drives.pop(drive_id);
        }
    }
}
