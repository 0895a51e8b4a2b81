// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Host-to-host HTTP calls.
//!
//! Requests carry the sending identity in [`PEER_IDENTITY_HEADER`] and the
//! connection's client auth token as a bearer token. A file travels as a
//! multipart form: the instruction set and metadata as JSON parts, then
//! one part per payload (file name = payload key) and per thumbnail (file
//! name = `key|width|height`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Serialize;

use super::{parts, DeleteLinkedFileRequest, PeerTransferResponse, ReadReceiptRequest, TransferInstructionSet};
use crate::drive::FileMetadata;
use crate::error::{HostError, HostResult};
use crate::identity::{ClientAuthToken, OdinId};

pub const PEER_IDENTITY_HEADER: &str = "x-odin-identity";

pub const HOST_TO_HOST_PATH: &str = "/api/v1/peer/transit/host-to-host";
pub const DELETE_LINKED_FILE_PATH: &str = "/api/v1/peer/transit/delete";
pub const READ_RECEIPT_PATH: &str = "/api/v1/peer/transit/read-receipt";
pub const OFFLINE_PUBLIC_KEY_PATH: &str = "/api/v1/peer/keys/offline";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerTransportError {
    /// The remote host answered with a non-success status.
    #[error("remote host returned status {0}")]
    Status(u16),

    /// The remote host could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl PeerTransportError {
    /// Whether another attempt within the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PeerTransportError::Transport(_))
    }
}

pub type TransportResult<T> = Result<T, PeerTransportError>;

#[derive(Debug, Clone)]
pub struct OutgoingPayload {
    pub key: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingThumbnail {
    pub key: String,
    pub width: u32,
    pub height: u32,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// One file addressed to one recipient.
#[derive(Debug, Clone)]
pub struct HostToHostTransfer {
    pub instruction_set: TransferInstructionSet,
    /// Redacted metadata as the recipient will see it.
    pub metadata: FileMetadata,
    pub payloads: Vec<OutgoingPayload>,
    pub thumbnails: Vec<OutgoingThumbnail>,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_file(
        &self,
        recipient: &OdinId,
        token: &ClientAuthToken,
        transfer: &HostToHostTransfer,
    ) -> TransportResult<PeerTransferResponse>;

    async fn delete_linked_file(
        &self,
        recipient: &OdinId,
        token: &ClientAuthToken,
        request: &DeleteLinkedFileRequest,
    ) -> TransportResult<PeerTransferResponse>;

    async fn send_read_receipt(
        &self,
        recipient: &OdinId,
        token: &ClientAuthToken,
        request: &ReadReceiptRequest,
    ) -> TransportResult<PeerTransferResponse>;
}

/// [`PeerTransport`] over HTTPS.
pub struct ReqwestTransport {
    client: reqwest::Client,
    sender: OdinId,
    scheme: String,
}

impl ReqwestTransport {
    pub fn new(sender: OdinId, scheme: impl Into<String>, timeout: Duration) -> HostResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("drive-host/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HostError::system(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            sender,
            scheme: scheme.into(),
        })
    }

    fn url(&self, recipient: &OdinId, path: &str) -> String {
        format!("{}://{}{}", self.scheme, recipient, path)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> TransportResult<PeerTransferResponse> {
        let response = request
            .send()
            .await
            .map_err(|e| PeerTransportError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PeerTransportError::Status(status.as_u16()));
        }
        response
            .json::<PeerTransferResponse>()
            .await
            .map_err(|e| PeerTransportError::InvalidResponse(e.to_string()))
    }

    fn post(&self, recipient: &OdinId, token: &ClientAuthToken, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(recipient, path))
            .header(PEER_IDENTITY_HEADER, self.sender.as_str())
            .bearer_auth(token.as_str())
    }
}

fn json_part<T: Serialize>(value: &T, file_name: &str) -> TransportResult<Part> {
    let json = serde_json::to_vec(value).map_err(|e| PeerTransportError::InvalidRequest(e.to_string()))?;
    Part::bytes(json)
        .file_name(file_name.to_string())
        .mime_str("application/json")
        .map_err(|e| PeerTransportError::InvalidRequest(e.to_string()))
}

fn bytes_part(bytes: &[u8], file_name: String, content_type: &str) -> TransportResult<Part> {
    Part::bytes(bytes.to_vec())
        .file_name(file_name)
        .mime_str(content_type)
        .map_err(|e| PeerTransportError::InvalidRequest(e.to_string()))
}

/// Multipart form of a host-to-host transfer.
pub fn transfer_form(transfer: &HostToHostTransfer) -> TransportResult<Form> {
    let mut form = Form::new()
        .part(
            parts::TRANSFER_INSTRUCTION_SET,
            json_part(&transfer.instruction_set, parts::TRANSFER_INSTRUCTION_SET)?,
        )
        .part(parts::METADATA, json_part(&transfer.metadata, parts::METADATA)?);

    for payload in &transfer.payloads {
        form = form.part(
            parts::PAYLOAD,
            bytes_part(&payload.bytes, payload.key.clone(), &payload.content_type)?,
        );
    }
    for thumb in &transfer.thumbnails {
        let name = thumbnail_part_name(&thumb.key, thumb.width, thumb.height);
        form = form.part(parts::THUMBNAIL, bytes_part(&thumb.bytes, name, &thumb.content_type)?);
    }
    Ok(form)
}

pub fn thumbnail_part_name(key: &str, width: u32, height: u32) -> String {
    let d = parts::THUMBNAIL_KEY_DELIMITER;
    format!("{key}{d}{width}{d}{height}")
}

/// Inverse of [`thumbnail_part_name`].
pub fn parse_thumbnail_part_name(name: &str) -> Option<(String, u32, u32)> {
    let mut fields = name.rsplitn(3, parts::THUMBNAIL_KEY_DELIMITER);
    let height = fields.next()?.parse().ok()?;
    let width = fields.next()?.parse().ok()?;
    let key = fields.next()?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), width, height))
}

#[async_trait]
impl PeerTransport for ReqwestTransport {
    async fn send_file(
        &self,
        recipient: &OdinId,
        token: &ClientAuthToken,
        transfer: &HostToHostTransfer,
    ) -> TransportResult<PeerTransferResponse> {
        let form = transfer_form(transfer)?;
        tracing::debug!(
            recipient = %recipient,
            payloads = transfer.payloads.len(),
            thumbnails = transfer.thumbnails.len(),
            "Sending file to peer"
        );
        self.execute(self.post(recipient, token, HOST_TO_HOST_PATH).multipart(form))
            .await
    }

    async fn delete_linked_file(
        &self,
        recipient: &OdinId,
        token: &ClientAuthToken,
        request: &DeleteLinkedFileRequest,
    ) -> TransportResult<PeerTransferResponse> {
        self.execute(self.post(recipient, token, DELETE_LINKED_FILE_PATH).json(request))
            .await
    }

    async fn send_read_receipt(
        &self,
        recipient: &OdinId,
        token: &ClientAuthToken,
        request: &ReadReceiptRequest,
    ) -> TransportResult<PeerTransferResponse> {
        self.execute(self.post(recipient, token, READ_RECEIPT_PATH).json(request))
            .await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum RecordedCall {
        File(OdinId, HostToHostTransfer),
        Delete(OdinId, DeleteLinkedFileRequest),
        ReadReceipt(OdinId, ReadReceiptRequest),
    }

    /// Records every call and answers from a script, then with
    /// `AcceptedIntoInbox`.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<RecordedCall>>,
        script: Mutex<VecDeque<TransportResult<PeerTransferResponse>>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_response(&self, response: TransportResult<PeerTransferResponse>) {
            self.script.lock().unwrap().push_back(response);
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn files(&self) -> Vec<(OdinId, HostToHostTransfer)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| match c {
                    RecordedCall::File(r, t) => Some((r.clone(), t.clone())),
                    _ => None,
                })
                .collect()
        }

        fn respond(&self, call: RecordedCall) -> TransportResult<PeerTransferResponse> {
            self.calls.lock().unwrap().push(call);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PeerTransferResponse::accepted_into_inbox()))
        }
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn send_file(
            &self,
            recipient: &OdinId,
            _token: &ClientAuthToken,
            transfer: &HostToHostTransfer,
        ) -> TransportResult<PeerTransferResponse> {
            self.respond(RecordedCall::File(recipient.clone(), transfer.clone()))
        }

        async fn delete_linked_file(
            &self,
            recipient: &OdinId,
            _token: &ClientAuthToken,
            request: &DeleteLinkedFileRequest,
        ) -> TransportResult<PeerTransferResponse> {
            self.respond(RecordedCall::Delete(recipient.clone(), request.clone()))
        }

        async fn send_read_receipt(
            &self,
            recipient: &OdinId,
            _token: &ClientAuthToken,
            request: &ReadReceiptRequest,
        ) -> TransportResult<PeerTransferResponse> {
            self.respond(RecordedCall::ReadReceipt(recipient.clone(), request.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnail_part_names() {
        let name = thumbnail_part_name("pay1", 200, 100);
        assert_eq!(name, "pay1|200|100");
        assert_eq!(parse_thumbnail_part_name(&name), Some(("pay1".to_string(), 200, 100)));
        assert_eq!(parse_thumbnail_part_name("pay1|200"), None);
        assert_eq!(parse_thumbnail_part_name("|1|2"), None);
        assert_eq!(parse_thumbnail_part_name("pay1|x|2"), None);
    }

    #[test]
    fn only_transport_failures_are_transient() {
        assert!(PeerTransportError::Transport("refused".into()).is_transient());
        assert!(!PeerTransportError::Status(500).is_transient());
        assert!(!PeerTransportError::InvalidResponse("eof".into()).is_transient());
    }

    #[test]
    fn urls_use_configured_scheme() {
        let transport =
            ReqwestTransport::new(OdinId::new("frodo.dotyou.cloud"), "http", Duration::from_secs(5)).unwrap();
        assert_eq!(
            transport.url(&OdinId::new("sam.dotyou.cloud"), HOST_TO_HOST_PATH),
            "http://sam.dotyou.cloud/api/v1/peer/transit/host-to-host"
        );
    }
}
