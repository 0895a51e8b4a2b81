// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Transit
//!
//! Store-and-forward delivery of files between identity hosts.
//!
//! ## Sending
//!
//! ```text
//! send_file ──> outbox (outbox.redb) ──> OutboxProcessor ──> PeerTransport ──> remote host
//!     │                                        │
//!     └─ no public key yet ──> transfer key queue (retried by the processor)
//! ```
//!
//! Each recipient gets its own outbox item carrying a transfer instruction
//! set: the file's key header sealed to the recipient's offline public key
//! plus the target drive and file types. Results update the file's
//! transfer history; retryable failures go back into the outbox with a
//! backoff, terminal ones are dropped.
//!
//! ## Receiving
//!
//! The peer endpoint stages the parts in the target drive's temp storage
//! and queues a [`TransferBoxItem`](inbox::TransferBoxItem). The inbox
//! processor opens the key header, reconciles the incoming file against
//! existing files by unique id and global transit id, and writes it
//! through the drive storage service.
//!
//! ## Modules
//!
//! - `outbox` - outbox and transfer key queue tables
//! - `transport` - host-to-host HTTP client
//! - `directory` - recipient public keys
//! - `sender` - building outbox items and delivering them
//! - `inbox` - inbox table
//! - `receiver` - accepting and processing incoming transfers
//! - `processor` - background loops

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::TransferKeyEnvelope;
use crate::drive::{FileSystemType, LatestProblemStatus, TargetDrive};
use crate::identity::OdinId;

pub mod directory;
pub mod inbox;
pub mod outbox;
pub mod processor;
pub mod receiver;
pub mod sender;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use directory::{InMemoryPublicKeyDirectory, PeerPublicKeyDirectory, PublicKeyDirectory};
pub use inbox::TransitInbox;
pub use outbox::TransitOutbox;
pub use processor::{InboxProcessor, OutboxProcessor};
pub use receiver::TransitReceiver;
pub use sender::TransitSender;
pub use transport::{PeerTransport, ReqwestTransport};

/// Multipart part names of a host-to-host transfer.
pub mod parts {
    pub const TRANSFER_INSTRUCTION_SET: &str = "transferInstructionSet";
    pub const METADATA: &str = "metadata";
    pub const PAYLOAD: &str = "payload";
    pub const THUMBNAIL: &str = "thumbnail";
    /// Separates key, width and height in a thumbnail part's file name.
    pub const THUMBNAIL_KEY_DELIMITER: char = '|';
}

/// How the receiving host treats a transferred file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferFileType {
    #[default]
    Normal,
    /// Committed and queued for the command message handler.
    CommandMessage,
    /// Written to the recipient's feed drive.
    EncryptedFileForFeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstructionType {
    SaveFile,
    DeleteLinkedFile,
    ReadReceipt,
}

/// Which parts of a file travel with it. The header always does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendContents {
    pub payload: bool,
    pub thumbnails: bool,
}

impl SendContents {
    pub const HEADER: SendContents = SendContents {
        payload: false,
        thumbnails: false,
    };
    pub const ALL: SendContents = SendContents {
        payload: true,
        thumbnails: true,
    };
}

impl Default for SendContents {
    fn default() -> Self {
        Self::ALL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleOptions {
    /// Deliver inside the request and report final statuses.
    SendNowAwaitResponse,
    /// Queue and let the outbox processor deliver.
    #[default]
    SendLater,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitOptions {
    pub recipients: Vec<OdinId>,
    #[serde(default)]
    pub schedule: ScheduleOptions,
    #[serde(default)]
    pub send_contents: SendContents,
    /// Hard-delete the local file once every recipient has been handled.
    #[serde(default)]
    pub is_transient: bool,
    /// Drive to write to on the recipient's host; defaults to the source
    /// drive's target drive.
    #[serde(default)]
    pub remote_target_drive: Option<TargetDrive>,
    #[serde(default)]
    pub override_remote_global_transit_id: Option<Uuid>,
}

impl TransitOptions {
    pub fn new(recipients: Vec<OdinId>) -> Self {
        Self {
            recipients,
            schedule: ScheduleOptions::default(),
            send_contents: SendContents::default(),
            is_transient: false,
            remote_target_drive: None,
            override_remote_global_transit_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferOptions {
    pub transfer_file_type: TransferFileType,
    pub file_system_type: FileSystemType,
}

/// What a sender is told about one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    /// Queued in the outbox.
    Enqueued,
    /// Queued until the recipient's public key can be resolved.
    AwaitingTransferKey,
    DeliveredToInbox,
    DeliveredToTargetDrive,
    /// Failed for now; the outbox retries.
    PendingRetry,
    /// Failed for good; the client may try again later.
    TotalRejectionClientShouldRetry,
    RecipientDoesNotHavePermissionToFileAcl,
    FileDoesNotAllowDistribution,
    RecipientReturnedAccessDenied,
}

/// Why one delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferFailureReason {
    EncryptedTransferInstructionSetNotAvailable,
    CouldNotEncrypt,
    RecipientServerError,
    RecipientServerNotResponding,
    RecipientServerReturnedAccessDenied,
    RecipientDoesNotHavePermissionToFileAcl,
    FileDoesNotAllowDistribution,
    UnknownError,
}

impl TransferFailureReason {
    /// Retryable failures go back into the outbox.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferFailureReason::EncryptedTransferInstructionSetNotAvailable
                | TransferFailureReason::CouldNotEncrypt
                | TransferFailureReason::RecipientServerError
                | TransferFailureReason::RecipientServerNotResponding
        )
    }

    /// Delay before retry number `attempt` (1-based): a per-reason base,
    /// doubled per attempt, capped at one hour.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let base_secs: u64 = match self {
            TransferFailureReason::RecipientServerNotResponding => 15,
            TransferFailureReason::RecipientServerError => 30,
            TransferFailureReason::EncryptedTransferInstructionSetNotAvailable
            | TransferFailureReason::CouldNotEncrypt => 60,
            _ => 0,
        };
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        std::time::Duration::from_secs(base_secs.saturating_mul(factor).min(3_600))
    }

    /// Status reported when the failure is final for this request.
    pub fn terminal_status(&self) -> TransferStatus {
        match self {
            TransferFailureReason::RecipientDoesNotHavePermissionToFileAcl => {
                TransferStatus::RecipientDoesNotHavePermissionToFileAcl
            }
            TransferFailureReason::FileDoesNotAllowDistribution => TransferStatus::FileDoesNotAllowDistribution,
            TransferFailureReason::RecipientServerReturnedAccessDenied => TransferStatus::RecipientReturnedAccessDenied,
            _ => TransferStatus::TotalRejectionClientShouldRetry,
        }
    }

    /// What the file's transfer history records for a final failure.
    pub fn problem_status(&self) -> LatestProblemStatus {
        match self {
            TransferFailureReason::FileDoesNotAllowDistribution => LatestProblemStatus::LocalFileDistributionDenied,
            TransferFailureReason::RecipientServerReturnedAccessDenied
            | TransferFailureReason::RecipientDoesNotHavePermissionToFileAcl => LatestProblemStatus::AccessDenied,
            _ => LatestProblemStatus::ClientMustRetry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerResponseCode {
    AcceptedIntoInbox,
    AcceptedDirectWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerTransferResponse {
    pub code: PeerResponseCode,
}

impl PeerTransferResponse {
    pub fn accepted_into_inbox() -> Self {
        Self {
            code: PeerResponseCode::AcceptedIntoInbox,
        }
    }
}

/// Everything a recipient needs to decrypt and place a transferred file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInstructionSet {
    /// The file's key header sealed to the recipient's offline key.
    pub transfer_key: TransferKeyEnvelope,
    pub target_drive: TargetDrive,
    pub transfer_file_type: TransferFileType,
    pub file_system_type: FileSystemType,
    pub contents_provided: SendContents,
}

/// Ask a recipient to soft-delete its copy of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteLinkedFileRequest {
    pub global_transit_id: Uuid,
    pub target_drive: TargetDrive,
    pub file_system_type: FileSystemType,
}

/// Tell the original sender that its file was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptRequest {
    pub global_transit_id: Uuid,
    pub target_drive: TargetDrive,
    pub file_system_type: FileSystemType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_reasons_back_off_exponentially() {
        let reason = TransferFailureReason::RecipientServerError;
        assert!(reason.is_retryable());
        assert_eq!(reason.backoff(1).as_secs(), 30);
        assert_eq!(reason.backoff(2).as_secs(), 60);
        assert_eq!(reason.backoff(30).as_secs(), 3_600);
    }

    #[test]
    fn terminal_reasons_map_to_final_statuses() {
        for reason in [
            TransferFailureReason::RecipientServerReturnedAccessDenied,
            TransferFailureReason::RecipientDoesNotHavePermissionToFileAcl,
            TransferFailureReason::FileDoesNotAllowDistribution,
            TransferFailureReason::UnknownError,
        ] {
            assert!(!reason.is_retryable(), "{reason:?}");
        }
        assert_eq!(
            TransferFailureReason::FileDoesNotAllowDistribution.terminal_status(),
            TransferStatus::FileDoesNotAllowDistribution
        );
        assert_eq!(
            TransferFailureReason::UnknownError.terminal_status(),
            TransferStatus::TotalRejectionClientShouldRetry
        );
        assert_eq!(
            TransferFailureReason::RecipientServerReturnedAccessDenied.problem_status(),
            LatestProblemStatus::AccessDenied
        );
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: TransitOptions = serde_json::from_str(r#"{"recipients":["sam.dotyou.cloud"]}"#).unwrap();
        assert_eq!(options.schedule, ScheduleOptions::SendLater);
        assert_eq!(options.send_contents, SendContents::ALL);
        assert!(!options.is_transient);
    }
}
