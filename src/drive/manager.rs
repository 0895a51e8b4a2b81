// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Drive definitions: creation, lookup, and the few mutable settings.
//!
//! Definitions are persisted as `drives/{id}/drive.json` and mirrored in a
//! [`DriveCache`] that is filled at startup by [`DriveManager::load_all`].
//! All writes go through one tenant-wide async lock so alias/type
//! uniqueness holds without a database constraint.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    unix_time_ms, CreateDriveRequest, DriveCache, DriveNotification, NotificationHub, Page, PageOptions,
    StorageDrive, TargetDrive,
};
use crate::crypto::SymmetricKey;
use crate::error::{ClientErrorCode, HostError, HostResult};
use crate::identity::{CallerContext, DrivePermission};
use crate::storage::TenantStorage;

pub struct DriveManager {
    storage: TenantStorage,
    cache: DriveCache,
    hub: NotificationHub,
    write_lock: Mutex<()>,
}

impl DriveManager {
    pub fn new(storage: TenantStorage, cache: DriveCache, hub: NotificationHub) -> Self {
        Self {
            storage,
            cache,
            hub,
            write_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &TenantStorage {
        &self.storage
    }

    /// Read every persisted definition into the cache. Returns the count.
    pub fn load_all(&self) -> HostResult<usize> {
        let mut count = 0;
        for name in self.storage.list_dirs(self.storage.paths().drives_dir())? {
            let Ok(id) = Uuid::parse_str(&name) else {
                tracing::warn!(dir = %name, "Skipping unexpected directory under drives/");
                continue;
            };
            if let Some(drive) = self.read_definition(&id)? {
                self.cache.put(drive);
                count += 1;
            }
        }
        tracing::info!(drives = count, "Drive definitions loaded");
        Ok(count)
    }

    fn read_definition(&self, id: &Uuid) -> HostResult<Option<StorageDrive>> {
        Ok(self.storage.read_json_opt(self.storage.paths().drive_definition(id))?)
    }

    fn persist(&self, drive: &StorageDrive) -> HostResult<()> {
        self.storage
            .write_json(self.storage.paths().drive_definition(&drive.id), drive)?;
        self.storage.create_dir(self.storage.paths().drive_temp_dir(&drive.id))?;
        self.cache.put(drive.clone());
        Ok(())
    }

    // ========== Create ==========

    pub async fn create_drive(&self, request: CreateDriveRequest, caller: &CallerContext) -> HostResult<StorageDrive> {
        self.create_drive_internal(request, false, caller).await
    }

    async fn create_drive_internal(
        &self,
        request: CreateDriveRequest,
        is_system_drive: bool,
        caller: &CallerContext,
    ) -> HostResult<StorageDrive> {
        if request.name.trim().is_empty() {
            return Err(HostError::client(ClientErrorCode::InvalidDriveName, "drive name cannot be empty"));
        }
        if !request.target_drive.is_valid() {
            return Err(HostError::client(
                ClientErrorCode::InvalidTargetDrive,
                format!("invalid target drive {}", request.target_drive),
            ));
        }
        validate_owner_only(request.owner_only, request.allow_anonymous_reads, request.allow_subscriptions)?;
        let master_key = caller.assert_has_master_key()?;

        let _guard = self.write_lock.lock().await;

        if self.get_drive_id_by_alias(&request.target_drive, false)?.is_some() {
            return Err(HostError::client(
                ClientErrorCode::DriveAliasAndTypeAlreadyExists,
                format!("a drive with target {} already exists", request.target_drive),
            ));
        }

        let id = Uuid::new_v4();
        let storage_key = SymmetricKey::generate()?;
        let drive = StorageDrive {
            id,
            target_drive: request.target_drive,
            name: request.name,
            metadata: request.metadata,
            master_key_encrypted_storage_key: master_key.wrap(&storage_key)?,
            encrypted_id_value: storage_key.encrypt(id.as_bytes())?,
            allow_anonymous_reads: request.allow_anonymous_reads,
            owner_only: request.owner_only,
            allow_subscriptions: request.allow_subscriptions,
            attributes: request.attributes,
            is_system_drive,
            created: unix_time_ms(),
        };
        self.persist(&drive)?;

        tracing::info!(drive_id = %drive.id, target_drive = %drive.target_drive, "Drive created");
        self.hub.publish(DriveNotification::DriveDefinitionAdded { drive: drive.clone() });
        Ok(drive)
    }

    /// Create the feed and transient temp drives if they are missing.
    pub async fn ensure_system_drives(&self, caller: &CallerContext) -> HostResult<()> {
        let system = [
            ("Feed", TargetDrive::feed_drive(), true),
            ("Transient temp", TargetDrive::transient_temp_drive(), false),
        ];
        for (name, target, allow_subscriptions) in system {
            if self.get_drive_id_by_alias(&target, false)?.is_some() {
                continue;
            }
            let mut request = CreateDriveRequest::new(name, target);
            request.allow_subscriptions = allow_subscriptions;
            match self.create_drive_internal(request, true, caller).await {
                Ok(_) => {}
                Err(HostError::Client {
                    code: ClientErrorCode::DriveAliasAndTypeAlreadyExists,
                    ..
                }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ========== Lookup ==========

    pub fn get_drive(&self, drive_id: &Uuid, fail_if_invalid: bool) -> HostResult<Option<StorageDrive>> {
        if let Some(drive) = self.cache.get(drive_id) {
            return Ok(Some(drive));
        }
        match self.read_definition(drive_id)? {
            Some(drive) => {
                self.cache.put(drive.clone());
                Ok(Some(drive))
            }
            None if fail_if_invalid => Err(HostError::client(
                ClientErrorCode::InvalidTargetDrive,
                format!("invalid drive id {drive_id}"),
            )),
            None => Ok(None),
        }
    }

    /// Like `get_drive(.., true)` but never `None`.
    pub fn require_drive(&self, drive_id: &Uuid) -> HostResult<StorageDrive> {
        self.get_drive(drive_id, true)?
            .ok_or_else(|| HostError::not_found(format!("drive {drive_id}")))
    }

    pub fn get_drive_id_by_alias(&self, target: &TargetDrive, fail_if_invalid: bool) -> HostResult<Option<Uuid>> {
        if let Some(id) = self.cache.id_for(target) {
            return Ok(Some(id));
        }
        let found = self.all_drives()?.into_iter().find(|d| d.target_drive == *target);
        match found {
            Some(d) => Ok(Some(d.id)),
            None if fail_if_invalid => Err(HostError::client(
                ClientErrorCode::InvalidTargetDrive,
                format!("invalid target drive {target}"),
            )),
            None => Ok(None),
        }
    }

    pub fn get_drive_by_alias(&self, target: &TargetDrive) -> HostResult<StorageDrive> {
        let id = self
            .get_drive_id_by_alias(target, true)?
            .ok_or_else(|| HostError::not_found(format!("target drive {target}")))?;
        self.require_drive(&id)
    }

    /// Every drive, ordered by creation time.
    pub fn all_drives(&self) -> HostResult<Vec<StorageDrive>> {
        let mut drives = Vec::new();
        let mut ids = self.cache.known_ids();
        if ids.is_empty() {
            ids = self
                .storage
                .list_dirs(self.storage.paths().drives_dir())?
                .iter()
                .filter_map(|n| Uuid::parse_str(n).ok())
                .collect();
        }
        for id in ids {
            if let Some(d) = self.get_drive(&id, false)? {
                drives.push(d);
            }
        }
        drives.sort_by_key(|d| (d.created, d.id));
        Ok(drives)
    }

    /// Drives visible to the caller, optionally of one drive type.
    pub fn get_drives(
        &self,
        drive_type: Option<Uuid>,
        page: PageOptions,
        caller: &CallerContext,
    ) -> HostResult<Page<StorageDrive>> {
        let visible = self
            .all_drives()?
            .into_iter()
            .filter(|d| drive_type.is_none_or(|t| d.target_drive.drive_type == t))
            .filter(|d| {
                if caller.is_owner() {
                    true
                } else if caller.is_anonymous() {
                    d.allow_anonymous_reads && !d.owner_only
                } else {
                    !d.owner_only
                        && (d.allow_anonymous_reads || caller.has_drive_permission(&d.id, DrivePermission::READ))
                }
            })
            .collect();
        Ok(Page::from_all(visible, page))
    }

    // ========== Mutations ==========

    async fn mutate<F>(&self, drive_id: &Uuid, caller: &CallerContext, f: F) -> HostResult<StorageDrive>
    where
        F: FnOnce(&mut StorageDrive) -> HostResult<bool>,
    {
        caller.assert_has_master_key()?;
        let _guard = self.write_lock.lock().await;
        let mut drive = self.require_drive(drive_id)?;
        if f(&mut drive)? {
            self.persist(&drive)?;
            tracing::info!(drive_id = %drive.id, "Drive definition changed");
            self.hub.publish(DriveNotification::DriveDefinitionChanged { drive: drive.clone() });
        }
        Ok(drive)
    }

    pub async fn set_drive_read_mode(
        &self,
        drive_id: &Uuid,
        allow_anonymous: bool,
        caller: &CallerContext,
    ) -> HostResult<StorageDrive> {
        self.mutate(drive_id, caller, |drive| {
            assert_not_system(drive)?;
            validate_owner_only(drive.owner_only, allow_anonymous, false)?;
            if drive.allow_anonymous_reads == allow_anonymous {
                return Ok(false);
            }
            drive.allow_anonymous_reads = allow_anonymous;
            Ok(true)
        })
        .await
    }

    pub async fn set_allow_subscriptions(
        &self,
        drive_id: &Uuid,
        allow_subscriptions: bool,
        caller: &CallerContext,
    ) -> HostResult<StorageDrive> {
        self.mutate(drive_id, caller, |drive| {
            assert_not_system(drive)?;
            validate_owner_only(drive.owner_only, false, allow_subscriptions)?;
            if drive.allow_subscriptions == allow_subscriptions {
                return Ok(false);
            }
            drive.allow_subscriptions = allow_subscriptions;
            Ok(true)
        })
        .await
    }

    pub async fn update_metadata(&self, drive_id: &Uuid, metadata: String, caller: &CallerContext) -> HostResult<StorageDrive> {
        self.mutate(drive_id, caller, |drive| {
            if drive.metadata == metadata {
                return Ok(false);
            }
            drive.metadata = metadata;
            Ok(true)
        })
        .await
    }

    pub async fn update_attributes(
        &self,
        drive_id: &Uuid,
        attributes: BTreeMap<String, String>,
        caller: &CallerContext,
    ) -> HostResult<StorageDrive> {
        self.mutate(drive_id, caller, |drive| {
            if drive.attributes == attributes {
                return Ok(false);
            }
            drive.attributes = attributes;
            Ok(true)
        })
        .await
    }

    // ========== Keys ==========

    /// The drive storage key, unwrapped from the master key or taken from
    /// the caller's grant, and checked against the encrypted drive id.
    pub fn storage_key(&self, drive: &StorageDrive, caller: &CallerContext) -> HostResult<SymmetricKey> {
        let key = if let Some(master_key) = caller.master_key() {
            master_key.unwrap_key(&drive.master_key_encrypted_storage_key).map_err(|e| {
                tracing::error!(drive_id = %drive.id, error = %e, "Master key cannot unwrap drive storage key");
                HostError::system(format!("cannot unwrap storage key of drive {}", drive.id))
            })?
        } else if let Some(key) = caller.drive_grant(&drive.id).and_then(|g| g.storage_key.clone()) {
            key
        } else {
            return Err(HostError::security(format!("no storage key available for drive {}", drive.id)));
        };

        let valid = key
            .decrypt(&drive.encrypted_id_value)
            .map(|plain| plain.as_slice() == drive.id.as_bytes())
            .unwrap_or(false);
        if !valid {
            tracing::error!(drive_id = %drive.id, "Drive storage key failed validation");
            return Err(HostError::system(format!("storage key mismatch for drive {}", drive.id)));
        }
        Ok(key)
    }
}

fn validate_owner_only(owner_only: bool, allow_anonymous: bool, allow_subscriptions: bool) -> HostResult<()> {
    if owner_only && allow_anonymous {
        return Err(HostError::client(
            ClientErrorCode::CannotAllowAnonymousReadsOnOwnerOnlyDrive,
            "a drive cannot be owner-only and allow anonymous reads",
        ));
    }
    if owner_only && allow_subscriptions {
        return Err(HostError::client(
            ClientErrorCode::CannotAllowSubscriptionsOnOwnerOnlyDrive,
            "a drive cannot be owner-only and allow subscriptions",
        ));
    }
    Ok(())
}

fn assert_not_system(drive: &StorageDrive) -> HostResult<()> {
    if drive.is_system_drive {
        tracing::warn!(drive_id = %drive.id, "Attempt to change a system drive");
        return Err(HostError::security("cannot change a system drive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DriveGrant, OdinId, SecurityGroup};

    fn owner() -> CallerContext {
        CallerContext::owner(OdinId::new("frodo.dotyou.cloud"), SymmetricKey::from_bytes([7u8; 32]), None)
    }

    fn manager() -> (DriveManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = TenantStorage::open(dir.path()).unwrap();
        (DriveManager::new(storage, DriveCache::new(16), NotificationHub::default()), dir)
    }

    fn request(name: &str) -> CreateDriveRequest {
        CreateDriveRequest::new(name, TargetDrive::new(Uuid::new_v4(), Uuid::new_v4()))
    }

    #[tokio::test]
    async fn create_drive_validates_and_persists() {
        let (mgr, _dir) = manager();
        let caller = owner();

        let drive = mgr.create_drive(request("photos"), &caller).await.unwrap();
        assert_eq!(mgr.get_drive(&drive.id, true).unwrap(), Some(drive.clone()));
        assert_eq!(mgr.get_drive_id_by_alias(&drive.target_drive, true).unwrap(), Some(drive.id));

        let dup = CreateDriveRequest::new("again", drive.target_drive);
        let err = mgr.create_drive(dup, &caller).await.unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::DriveAliasAndTypeAlreadyExists));

        let err = mgr.create_drive(request("  "), &caller).await.unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::InvalidDriveName));
    }

    #[tokio::test]
    async fn owner_only_exclusions_are_enforced() {
        let (mgr, _dir) = manager();
        let mut req = request("secret");
        req.owner_only = true;
        req.allow_anonymous_reads = true;
        let err = mgr.create_drive(req, &owner()).await.unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::CannotAllowAnonymousReadsOnOwnerOnlyDrive));

        let mut req = request("secret");
        req.owner_only = true;
        let drive = mgr.create_drive(req, &owner()).await.unwrap();
        let err = mgr.set_allow_subscriptions(&drive.id, true, &owner()).await.unwrap_err();
        assert_eq!(err.client_code(), Some(ClientErrorCode::CannotAllowSubscriptionsOnOwnerOnlyDrive));
    }

    #[tokio::test]
    async fn create_requires_master_key() {
        let (mgr, _dir) = manager();
        let peer = CallerContext::peer(OdinId::new("sam.dotyou.cloud"), SecurityGroup::Connected, vec![], None);
        assert!(matches!(mgr.create_drive(request("x"), &peer).await, Err(HostError::Security(_))));
    }

    #[tokio::test]
    async fn definitions_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TenantStorage::open(dir.path()).unwrap();
        let first = DriveManager::new(storage.clone(), DriveCache::new(4), NotificationHub::default());
        let drive = first.create_drive(request("docs"), &owner()).await.unwrap();

        let second = DriveManager::new(storage, DriveCache::new(4), NotificationHub::default());
        assert_eq!(second.load_all().unwrap(), 1);
        assert_eq!(second.get_drive_id_by_alias(&drive.target_drive, false).unwrap(), Some(drive.id));
    }

    #[tokio::test]
    async fn system_drives_are_created_once_and_protected() {
        let (mgr, _dir) = manager();
        mgr.ensure_system_drives(&owner()).await.unwrap();
        mgr.ensure_system_drives(&owner()).await.unwrap();

        let feed = mgr.get_drive_by_alias(&TargetDrive::feed_drive()).unwrap();
        assert!(feed.is_system_drive && feed.is_feed_drive());
        assert_eq!(mgr.all_drives().unwrap().len(), 2);

        let err = mgr.set_drive_read_mode(&feed.id, true, &owner()).await.unwrap_err();
        assert!(matches!(err, HostError::Security(_)));
    }

    #[tokio::test]
    async fn mutations_only_write_on_change_and_notify() {
        let (mgr, _dir) = manager();
        let mut rx = mgr.hub.subscribe();
        let drive = mgr.create_drive(request("blog"), &owner()).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), DriveNotification::DriveDefinitionAdded { .. }));

        let updated = mgr.set_drive_read_mode(&drive.id, true, &owner()).await.unwrap();
        assert!(updated.allow_anonymous_reads);
        assert!(matches!(rx.recv().await.unwrap(), DriveNotification::DriveDefinitionChanged { .. }));

        mgr.set_drive_read_mode(&drive.id, true, &owner()).await.unwrap();
        assert!(rx.try_recv().is_err());

        let mut attrs = BTreeMap::new();
        attrs.insert("k".to_string(), "v".to_string());
        let updated = mgr.update_attributes(&drive.id, attrs.clone(), &owner()).await.unwrap();
        assert_eq!(updated.attributes, attrs);
        let updated = mgr.update_metadata(&drive.id, "meta".into(), &owner()).await.unwrap();
        assert_eq!(updated.metadata, "meta");
    }

    #[tokio::test]
    async fn anonymous_sees_only_public_drives() {
        let (mgr, _dir) = manager();
        let mut public = request("public");
        public.allow_anonymous_reads = true;
        let public = mgr.create_drive(public, &owner()).await.unwrap();
        mgr.create_drive(request("private"), &owner()).await.unwrap();

        let page = mgr.get_drives(None, PageOptions::ALL, &CallerContext::anonymous()).unwrap();
        assert_eq!(page.results.len(), 1);
        assert_eq!(page.results[0].id, public.id);

        let all = mgr.get_drives(None, PageOptions::ALL, &owner()).unwrap();
        assert_eq!(all.total, 2);

        let typed = mgr
            .get_drives(Some(public.target_drive.drive_type), PageOptions::ALL, &owner())
            .unwrap();
        assert_eq!(typed.total, 1);
    }

    #[tokio::test]
    async fn storage_key_is_validated() {
        let (mgr, _dir) = manager();
        let drive = mgr.create_drive(request("k"), &owner()).await.unwrap();
        let key = mgr.storage_key(&drive, &owner()).unwrap();

        let granted = CallerContext::peer(OdinId::new("sam.dotyou.cloud"), SecurityGroup::Connected, vec![], None)
            .with_drive_grant(
                drive.id,
                DriveGrant {
                    permission: DrivePermission::READ,
                    storage_key: Some(key.clone()),
                },
            );
        assert_eq!(mgr.storage_key(&drive, &granted).unwrap(), key);

        let wrong = CallerContext::peer(OdinId::new("sam.dotyou.cloud"), SecurityGroup::Connected, vec![], None)
            .with_drive_grant(
                drive.id,
                DriveGrant {
                    permission: DrivePermission::READ,
                    storage_key: Some(SymmetricKey::generate().unwrap()),
                },
            );
        assert!(matches!(mgr.storage_key(&drive, &wrong), Err(HostError::System(_))));

        let other_owner = CallerContext::owner(OdinId::new("frodo.dotyou.cloud"), SymmetricKey::generate().unwrap(), None);
        assert!(matches!(mgr.storage_key(&drive, &other_owner), Err(HostError::System(_))));
    }
}
