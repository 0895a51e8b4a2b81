// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Storage notifications.
//!
//! The storage service and drive manager publish on a tokio broadcast
//! channel; the index updater and anything else interested subscribe.
//! Publishing never blocks and never fails: with no subscribers the
//! notification is dropped.

use tokio::sync::broadcast;
use uuid::Uuid;

use super::{InternalDriveFileId, ServerFileHeader, StorageDrive};

pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum DriveNotification {
    FileAdded {
        header: ServerFileHeader,
    },
    FileChanged {
        header: ServerFileHeader,
        previous: Option<ServerFileHeader>,
    },
    FileDeleted {
        file: InternalDriveFileId,
        previous: Option<ServerFileHeader>,
        /// The tombstone header for soft deletes; `None` for hard deletes.
        header: Option<ServerFileHeader>,
        is_hard_delete: bool,
    },
    ReactionPreviewUpdated {
        header: ServerFileHeader,
    },
    DriveDefinitionAdded {
        drive: StorageDrive,
    },
    DriveDefinitionChanged {
        drive: StorageDrive,
    },
}

impl DriveNotification {
    pub fn drive_id(&self) -> Uuid {
        match self {
            DriveNotification::FileAdded { header }
            | DriveNotification::FileChanged { header, .. }
            | DriveNotification::ReactionPreviewUpdated { header } => header.file().drive_id,
            DriveNotification::FileDeleted { file, .. } => file.drive_id,
            DriveNotification::DriveDefinitionAdded { drive }
            | DriveNotification::DriveDefinitionChanged { drive } => drive.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DriveNotification::FileAdded { .. } => "file_added",
            DriveNotification::FileChanged { .. } => "file_changed",
            DriveNotification::FileDeleted { .. } => "file_deleted",
            DriveNotification::ReactionPreviewUpdated { .. } => "reaction_preview_updated",
            DriveNotification::DriveDefinitionAdded { .. } => "drive_definition_added",
            DriveNotification::DriveDefinitionChanged { .. } => "drive_definition_changed",
        }
    }
}

#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<DriveNotification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: DriveNotification) {
        let kind = notification.kind();
        let drive_id = notification.drive_id();
        if self.tx.send(notification).is_err() {
            tracing::trace!(kind, drive_id = %drive_id, "Notification dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriveNotification> {
        self.tx.subscribe()
    }
}
