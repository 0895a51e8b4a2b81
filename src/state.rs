// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Host composition: opens the tenant's storage and wires every service
//! together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::HostConfig;
use crate::drive::{CommandMessageQueue, DriveCache, DriveManager, FileSystemResolver, NotificationHub};
use crate::error::HostResult;
use crate::identity::{CallerContext, CircleNetwork, DefaultAclAuthorizer, DriveAclAuthorizer, InMemoryCircleNetwork, OdinId};
use crate::keys::{load_or_create_master_key, OfflineKeyService};
use crate::query::{DriveQueryManager, IndexUpdater, QueryIndex};
use crate::storage::database::open_database;
use crate::storage::TenantStorage;
use crate::transit::{
    InboxProcessor, OutboxProcessor, PeerPublicKeyDirectory, ReqwestTransport, TransitInbox, TransitOutbox,
    TransitReceiver, TransitSender,
};

/// Timeout of a single host-to-host request.
const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Every service of one tenant.
pub struct Host {
    pub config: HostConfig,
    pub tenant: OdinId,
    pub system: CallerContext,
    pub hub: NotificationHub,
    pub drives: Arc<DriveManager>,
    pub query: Arc<DriveQueryManager>,
    pub files: FileSystemResolver,
    pub network: Arc<InMemoryCircleNetwork>,
    pub sender: Arc<TransitSender>,
    pub receiver: Arc<TransitReceiver>,
}

impl Host {
    /// Open (or create) the tenant under `config.data_dir`, load drives and
    /// make sure the system drives exist.
    pub async fn open(config: HostConfig) -> HostResult<Self> {
        let tenant = OdinId::new(&config.tenant);
        let storage = TenantStorage::open(&config.data_dir)?;
        let master_key = load_or_create_master_key(&storage)?;
        let keys = OfflineKeyService::load_or_create(&storage)?;

        let index_db = Arc::new(open_database(&storage.paths().index_db())?);
        let index = Arc::new(QueryIndex::open(index_db.clone())?);
        let commands = Arc::new(CommandMessageQueue::open(index_db)?);
        let outbox = Arc::new(TransitOutbox::open(Arc::new(open_database(&storage.paths().outbox_db())?))?);
        let inbox = Arc::new(TransitInbox::open(Arc::new(open_database(&storage.paths().inbox_db())?))?);

        let hub = NotificationHub::default();
        let drives = Arc::new(DriveManager::new(
            storage,
            DriveCache::new(config.drive_cache_capacity),
            hub.clone(),
        ));
        let network = Arc::new(InMemoryCircleNetwork::new());
        let circles: Arc<dyn CircleNetwork> = network.clone();
        let authorizer: Arc<dyn DriveAclAuthorizer> = Arc::new(DefaultAclAuthorizer::new(circles.clone()));
        let query = Arc::new(DriveQueryManager::new(index.clone(), drives.clone(), authorizer.clone()));
        let files = FileSystemResolver::new(
            drives.clone(),
            index,
            query.clone(),
            commands,
            authorizer.clone(),
            hub.clone(),
        );

        let system = CallerContext::system(tenant.clone(), master_key);
        let loaded = drives.load_all()?;
        drives.ensure_system_drives(&system).await?;
        let indexed = query.initialize()?;
        info!(tenant = %tenant, drives = loaded, indexed, "Tenant opened");

        let transit = config.transit.clone();
        let sender = Arc::new(TransitSender::new(
            files.clone(),
            drives.clone(),
            outbox,
            Arc::new(ReqwestTransport::new(tenant.clone(), transit.peer_scheme.clone(), PEER_REQUEST_TIMEOUT)?),
            Arc::new(PeerPublicKeyDirectory::new(transit.peer_scheme.clone(), PEER_REQUEST_TIMEOUT)?),
            circles.clone(),
            authorizer,
            keys.outbox_sealing_key()?,
            system.clone(),
            transit.clone(),
        ));
        let receiver = Arc::new(TransitReceiver::new(
            files.clone(),
            drives.clone(),
            inbox,
            keys,
            circles,
            system.clone(),
            transit,
        ));

        Ok(Self {
            config,
            tenant,
            system,
            hub,
            drives,
            query,
            files,
            network,
            sender,
            receiver,
        })
    }

    /// Start the index updater and the transit processors.
    pub fn spawn_background(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let poll = self.config.transit.outbox_poll_interval;
        vec![
            tokio::spawn(IndexUpdater::new(self.query.clone(), &self.hub).run(shutdown.clone())),
            tokio::spawn(OutboxProcessor::new(self.sender.clone(), poll).run(shutdown.clone())),
            tokio::spawn(InboxProcessor::new(self.receiver.clone(), poll).run(shutdown.clone())),
        ]
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            receiver: self.receiver.clone(),
            drives: self.drives.clone(),
        }
    }
}

/// State shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub receiver: Arc<TransitReceiver>,
    pub drives: Arc<DriveManager>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_reopens_a_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig {
            data_dir: dir.path().to_path_buf(),
            ..HostConfig::default()
        };

        let host = Host::open(config.clone()).await.unwrap();
        let drives = host.drives.all_drives().unwrap().len();
        assert!(drives >= 2);
        let key = host.receiver.offline_keys().public_key();
        drop(host);

        let reopened = Host::open(config).await.unwrap();
        assert_eq!(reopened.drives.all_drives().unwrap().len(), drives);
        assert_eq!(reopened.receiver.offline_keys().public_key(), key);
    }
}
