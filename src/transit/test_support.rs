// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! A complete in-process host for transit tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use super::transport::PeerTransport;
use super::{InMemoryPublicKeyDirectory, TransitInbox, TransitOutbox, TransitReceiver, TransitSender};
use crate::config::TransitConfig;
use crate::crypto::KeyHeader;
use crate::drive::{
    AppData, CommandMessageQueue, CreateDriveRequest, DriveCache, DriveManager, FileMetadata, FileSystemResolver,
    FileSystemType, InternalDriveFileId, NotificationHub, PayloadDescriptor, ServerFileHeader, ServerMetadata,
    StorageDrive, TargetDrive, ThumbnailDescriptor,
};
use crate::identity::{
    AccessControlList, CallerContext, CircleNetwork, ClientAuthToken, DefaultAclAuthorizer, DriveAclAuthorizer,
    DrivePermission, InMemoryCircleNetwork, OdinId, SecurityGroup,
};
use crate::keys::{load_or_create_master_key, OfflineKeyService};
use crate::query::{DriveQueryManager, QueryIndex};
use crate::storage::database::open_database;
use crate::storage::temp::{payload_extension, thumbnail_extension};
use crate::storage::TenantStorage;

pub(crate) struct TestHost {
    pub tenant: OdinId,
    pub owner: CallerContext,
    pub drives: Arc<DriveManager>,
    pub query: Arc<DriveQueryManager>,
    pub files: FileSystemResolver,
    pub outbox: Arc<TransitOutbox>,
    pub inbox: Arc<TransitInbox>,
    pub keys: OfflineKeyService,
    pub network: Arc<InMemoryCircleNetwork>,
    pub directory: Arc<InMemoryPublicKeyDirectory>,
    pub authorizer: Arc<dyn DriveAclAuthorizer>,
    pub config: TransitConfig,
    _dir: TempDir,
}

impl TestHost {
    pub async fn new(tenant: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage = TenantStorage::open(dir.path()).unwrap();
        let tenant = OdinId::new(tenant);
        let master_key = load_or_create_master_key(&storage).unwrap();
        let keys = OfflineKeyService::load_or_create(&storage).unwrap();

        let index_db = Arc::new(open_database(&storage.paths().index_db()).unwrap());
        let outbox_db = Arc::new(open_database(&storage.paths().outbox_db()).unwrap());
        let inbox_db = Arc::new(open_database(&storage.paths().inbox_db()).unwrap());
        let index = Arc::new(QueryIndex::open(index_db.clone()).unwrap());
        let commands = Arc::new(CommandMessageQueue::open(index_db).unwrap());
        let outbox = Arc::new(TransitOutbox::open(outbox_db).unwrap());
        let inbox = Arc::new(TransitInbox::open(inbox_db).unwrap());

        let hub = NotificationHub::default();
        let drives = Arc::new(DriveManager::new(storage, DriveCache::new(16), hub.clone()));
        let network = Arc::new(InMemoryCircleNetwork::new());
        let authorizer: Arc<dyn DriveAclAuthorizer> = Arc::new(DefaultAclAuthorizer::new(network.clone()));
        let query = Arc::new(DriveQueryManager::new(index.clone(), drives.clone(), authorizer.clone()));
        let files = FileSystemResolver::new(drives.clone(), index, query.clone(), commands, authorizer.clone(), hub);

        let owner = CallerContext::owner(tenant.clone(), master_key, None);
        drives.ensure_system_drives(&owner).await.unwrap();
        query.initialize().unwrap();

        let config = TransitConfig {
            outbox_max_attempts: 5,
            inbox_max_attempts: 3,
            peer_operation_max_attempts: 2,
            peer_operation_delay: Duration::from_millis(1),
            ..TransitConfig::default()
        };

        Self {
            tenant,
            owner,
            drives,
            query,
            files,
            outbox,
            inbox,
            keys,
            network,
            directory: Arc::new(InMemoryPublicKeyDirectory::new()),
            authorizer,
            config,
            _dir: dir,
        }
    }

    /// The owner caller doubles as the system caller.
    pub fn system(&self) -> CallerContext {
        self.owner.clone()
    }

    pub fn sender(&self, transport: Arc<dyn PeerTransport>) -> TransitSender {
        TransitSender::new(
            self.files.clone(),
            self.drives.clone(),
            self.outbox.clone(),
            transport,
            self.directory.clone(),
            self.network.clone(),
            self.authorizer.clone(),
            self.keys.outbox_sealing_key().unwrap(),
            self.system(),
            self.config.clone(),
        )
    }

    pub fn receiver(&self) -> TransitReceiver {
        TransitReceiver::new(
            self.files.clone(),
            self.drives.clone(),
            self.inbox.clone(),
            self.keys.clone(),
            self.network.clone(),
            self.system(),
            self.config.clone(),
        )
    }

    /// Connect both ways: tokens on both networks and each other's offline
    /// key in both directories.
    pub async fn connect(&self, other: &TestHost) {
        let ours = ClientAuthToken::new(format!("{}>{}", self.tenant, other.tenant));
        let theirs = ClientAuthToken::new(format!("{}>{}", other.tenant, self.tenant));
        self.link(&other.tenant, ours.clone(), theirs.clone()).await;
        other.link(&self.tenant, theirs, ours).await;
        self.directory.insert(other.tenant.clone(), other.keys.public_key()).await;
        other.directory.insert(self.tenant.clone(), self.keys.public_key()).await;
    }

    async fn link(&self, peer: &OdinId, outgoing: ClientAuthToken, incoming: ClientAuthToken) {
        let mut connection = self.network.connection(peer).await.unwrap_or_default();
        connection.outgoing_token = Some(outgoing);
        connection.incoming_token = Some(incoming);
        self.network.connect(peer.clone(), connection).await;
    }

    pub async fn grant_drive(&self, peer: &OdinId, target: TargetDrive, permission: DrivePermission) {
        let mut connection = self.network.connection(peer).await.unwrap_or_default();
        connection.drive_grants.push((target, permission));
        self.network.connect(peer.clone(), connection).await;
    }

    pub async fn drive(&self, name: &str) -> StorageDrive {
        self.drive_with_target(name, TargetDrive::new(Uuid::new_v4(), Uuid::new_v4()))
            .await
    }

    pub async fn drive_with_target(&self, name: &str, target: TargetDrive) -> StorageDrive {
        self.drives
            .create_drive(CreateDriveRequest::new(name, target), &self.owner)
            .await
            .unwrap()
    }

    /// Commit a file with payload `pst` and a 20x20 thumbnail, readable by
    /// connected identities.
    pub fn commit_file(
        &self,
        drive: &StorageDrive,
        app_data: AppData,
        configure: impl FnOnce(&mut FileMetadata, &mut ServerMetadata),
    ) -> InternalDriveFileId {
        let storage = &self.files.standard().storage;
        let file = storage.create_internal_file_id(&drive.id, &self.owner).unwrap();
        storage
            .write_temp_stream(&file, &payload_extension("pst"), b"payload bytes", &self.owner)
            .unwrap();
        storage
            .write_temp_stream(&file, &thumbnail_extension("pst", 20, 20), b"thumb", &self.owner)
            .unwrap();

        let mut metadata = FileMetadata::new(file, app_data);
        let mut payload = PayloadDescriptor::new("pst", "text/plain");
        payload.thumbnails.push(ThumbnailDescriptor::new(20, 20, "image/png"));
        metadata.payloads.push(payload);
        let mut server = ServerMetadata::new(
            AccessControlList::for_group(SecurityGroup::Connected),
            FileSystemType::Standard,
        );
        configure(&mut metadata, &mut server);

        storage
            .commit_new_file(file, &KeyHeader::empty(), metadata, server, false, &self.owner)
            .unwrap();
        file
    }

    /// Commit a header-only encrypted file.
    pub fn commit_encrypted_file(&self, drive: &StorageDrive) -> InternalDriveFileId {
        let storage = &self.files.standard().storage;
        let file = storage.create_internal_file_id(&drive.id, &self.owner).unwrap();
        let mut metadata = FileMetadata::new(file, AppData::default());
        metadata.is_encrypted = true;
        let server = ServerMetadata::new(
            AccessControlList::for_group(SecurityGroup::Connected),
            FileSystemType::Standard,
        );
        storage
            .commit_new_file(file, &KeyHeader::new_random().unwrap(), metadata, server, false, &self.owner)
            .unwrap();
        file
    }

    pub fn header(&self, file: &InternalDriveFileId) -> ServerFileHeader {
        self.files
            .standard()
            .storage
            .get_server_file_header(file, &self.owner)
            .unwrap()
            .unwrap()
    }
}
