// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Background tasks that drain the outbox and the inbox.
//!
//! Both follow the same shape: release work left claimed by a previous
//! run, then sweep on a fixed interval until the cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TransitReceiver, TransitSender};

/// Delivers queued outbox items and retries transfer keys.
pub struct OutboxProcessor {
    sender: Arc<TransitSender>,
    poll_interval: Duration,
}

impl OutboxProcessor {
    pub fn new(sender: Arc<TransitSender>, poll_interval: Duration) -> Self {
        Self { sender, poll_interval }
    }

    /// Run until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(processor.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.poll_interval.as_millis() as u64, "Outbox processor starting");
        match self.sender.outbox().recover_checked_out() {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Released outbox items from an interrupted run"),
            Err(e) => warn!(error = %e, "Failed to release checked-out outbox items"),
        }

        loop {
            if shutdown.is_cancelled() {
                info!("Outbox processor shutting down");
                return;
            }

            self.sweep().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Outbox processor shutting down");
                    return;
                }
            }
        }
    }

    async fn sweep(&self) {
        match self.sender.process_transfer_key_queue().await {
            Ok(0) => {}
            Ok(resolved) => debug!(resolved, "Transfer keys created"),
            Err(e) => warn!(error = %e, "Transfer key queue sweep failed"),
        }
        match self.sender.process_outbox().await {
            Ok(0) => {}
            Ok(delivered) => debug!(delivered, "Outbox sweep finished"),
            Err(e) => warn!(error = %e, "Outbox sweep failed"),
        }
    }
}

/// Applies received transfers to their drives.
pub struct InboxProcessor {
    receiver: Arc<TransitReceiver>,
    poll_interval: Duration,
}

impl InboxProcessor {
    pub fn new(receiver: Arc<TransitReceiver>, poll_interval: Duration) -> Self {
        Self {
            receiver,
            poll_interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.poll_interval.as_millis() as u64, "Inbox processor starting");
        match self.receiver.inbox().recover_popped() {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Released inbox items from an interrupted run"),
            Err(e) => warn!(error = %e, "Failed to release popped inbox items"),
        }

        loop {
            if shutdown.is_cancelled() {
                info!("Inbox processor shutting down");
                return;
            }

            // Storage and index work is blocking.
            let receiver = self.receiver.clone();
            match tokio::task::spawn_blocking(move || receiver.process_all()).await {
                Ok(Ok(result)) if result.processed + result.retried + result.dead_lettered > 0 => {
                    debug!(?result, "Inbox sweep finished");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Inbox sweep failed"),
                Err(e) => warn!(error = %e, "Inbox sweep task panicked"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Inbox processor shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyHeader;
    use crate::drive::{AppData, FileMetadata, FileSystemType, InternalDriveFileId};
    use crate::identity::{CallerContext, DriveGrant, DrivePermission, OdinId, SecurityGroup};
    use crate::transit::receiver::IncomingTransfer;
    use crate::transit::test_support::TestHost;
    use crate::transit::transport::testing::RecordingTransport;
    use crate::transit::{
        FileTransferOptions, SendContents, TransferFileType, TransferInstructionSet, TransitOptions,
    };

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn outbox_processor_delivers_queued_items() {
        let host = TestHost::new("frodo.dotyou.cloud").await;
        let sam = TestHost::new("sam.dotyou.cloud").await;
        host.connect(&sam).await;
        let transport = Arc::new(RecordingTransport::new());
        let sender = Arc::new(host.sender(transport.clone()));
        let drive = host.drive("chat").await;
        let file = host.commit_file(&drive, AppData::default(), |_, _| {});

        sender
            .send_file(
                file,
                TransitOptions::new(vec![sam.tenant.clone()]),
                FileTransferOptions {
                    transfer_file_type: TransferFileType::Normal,
                    file_system_type: FileSystemType::Standard,
                },
                &host.owner,
            )
            .await
            .unwrap();
        assert_eq!(host.outbox.count(&drive.id).unwrap(), 1);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(OutboxProcessor::new(sender, Duration::from_millis(10)).run(shutdown.clone()));
        wait_for(|| host.outbox.count(&drive.id).unwrap() == 0).await;
        assert_eq!(transport.call_count(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn inbox_processor_applies_staged_transfers() {
        let host = TestHost::new("sam.dotyou.cloud").await;
        let drive = host.drive("chat").await;
        let receiver = Arc::new(host.receiver());

        let frodo = OdinId::new("frodo.dotyou.cloud");
        let caller = CallerContext::peer(frodo.clone(), SecurityGroup::Connected, vec![], None).with_drive_grant(
            drive.id,
            DriveGrant {
                permission: DrivePermission::WRITE,
                storage_key: None,
            },
        );
        let unique_id = uuid::Uuid::new_v4();
        let metadata = FileMetadata::new(
            InternalDriveFileId::redacted(),
            AppData {
                unique_id: Some(unique_id),
                ..Default::default()
            },
        );
        receiver
            .accept_transfer(
                IncomingTransfer {
                    instruction_set: TransferInstructionSet {
                        transfer_key: KeyHeader::new_random()
                            .unwrap()
                            .seal_for_recipient(&host.keys.public_key())
                            .unwrap(),
                        target_drive: drive.target_drive,
                        transfer_file_type: TransferFileType::Normal,
                        file_system_type: FileSystemType::Standard,
                        contents_provided: SendContents::HEADER,
                    },
                    metadata: serde_json::to_vec(&metadata).unwrap(),
                    payloads: vec![],
                    thumbnails: vec![],
                },
                &caller,
            )
            .unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(InboxProcessor::new(receiver, Duration::from_millis(10)).run(shutdown.clone()));
        wait_for(|| host.inbox.count(&drive.id).unwrap() == 0).await;

        let file = host.query.resolve_unique_id(&drive.id, &unique_id).unwrap().unwrap();
        assert_eq!(host.header(&file).file_metadata.sender_odin_id, Some(frodo));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
