// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Host-to-host transit endpoints.
//!
//! Callers identify with the `x-odin-identity` header and authenticate
//! with the bearer token of their connection to this identity.

use axum::{
    extract::{Multipart, State},
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use tracing::debug;

use crate::error::{ApiError, ClientErrorCode, HostError};
use crate::identity::{CallerContext, OdinId};
use crate::state::AppState;
use crate::transit::directory::OfflinePublicKeyResponse;
use crate::transit::receiver::{IncomingPayload, IncomingThumbnail, IncomingTransfer};
use crate::transit::transport::{parse_thumbnail_part_name, PEER_IDENTITY_HEADER};
use crate::transit::{parts, DeleteLinkedFileRequest, PeerTransferResponse, ReadReceiptRequest};

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<CallerContext, ApiError> {
    let sender = headers
        .get(PEER_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(OdinId::new)
        .ok_or_else(|| ApiError::forbidden("missing peer identity"))?;
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::forbidden("missing bearer token"))?;
    Ok(state.receiver.peer_caller(&sender, token).await?)
}

fn multipart_error(e: impl std::fmt::Display) -> ApiError {
    ApiError::bad_request(format!("multipart error: {e}"))
}

/// Read the sections of a host-to-host upload.
async fn read_transfer(mut multipart: Multipart) -> Result<IncomingTransfer, ApiError> {
    let mut instruction_set = None;
    let mut metadata = None;
    let mut payloads = Vec::new();
    let mut thumbnails = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(multipart_error)?;

        match name.as_str() {
            parts::TRANSFER_INSTRUCTION_SET => {
                instruction_set = Some(serde_json::from_slice(&bytes).map_err(|e| {
                    HostError::client(
                        ClientErrorCode::InvalidInstructionSet,
                        format!("invalid transfer instruction set: {e}"),
                    )
                })?);
            }
            parts::METADATA => metadata = Some(bytes.to_vec()),
            parts::PAYLOAD => {
                let key = file_name.ok_or_else(|| ApiError::bad_request("payload section without a key"))?;
                payloads.push(IncomingPayload {
                    key,
                    bytes: bytes.to_vec(),
                });
            }
            parts::THUMBNAIL => {
                let (key, width, height) = file_name
                    .as_deref()
                    .and_then(parse_thumbnail_part_name)
                    .ok_or_else(|| ApiError::bad_request("thumbnail section without key and size"))?;
                thumbnails.push(IncomingThumbnail {
                    key,
                    width,
                    height,
                    bytes: bytes.to_vec(),
                });
            }
            other => debug!(section = other, "Ignoring unknown multipart section"),
        }
    }

    let instruction_set = instruction_set.ok_or_else(|| {
        HostError::client(ClientErrorCode::InvalidInstructionSet, "transfer instruction set missing")
    })?;
    let metadata =
        metadata.ok_or_else(|| HostError::client(ClientErrorCode::MissingUploadData, "metadata missing"))?;
    Ok(IncomingTransfer {
        instruction_set,
        metadata,
        payloads,
        thumbnails,
    })
}

/// Receive a file from a connected identity into the inbox.
#[utoipa::path(
    post,
    path = "/api/v1/peer/transit/host-to-host",
    tag = "Peer",
    responses(
        (status = 200, description = "Accepted into the inbox"),
        (status = 400, description = "Invalid transfer"),
        (status = 403, description = "Unknown sender, bad token or no write access")
    )
)]
pub async fn host_to_host(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<PeerTransferResponse>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    let transfer = read_transfer(multipart).await?;
    let receiver = state.receiver.clone();
    // Staging writes to disk.
    let response = tokio::task::spawn_blocking(move || receiver.accept_transfer(transfer, &caller))
        .await
        .map_err(|e| HostError::system(format!("transfer task failed: {e}")))??;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/api/v1/peer/transit/delete",
    tag = "Peer",
    responses(
        (status = 200, description = "Accepted into the inbox"),
        (status = 403, description = "Unknown sender, bad token or no write access")
    )
)]
pub async fn delete_linked_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<DeleteLinkedFileRequest>,
) -> Result<Json<PeerTransferResponse>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    Ok(Json(state.receiver.accept_delete_linked_file(&request, &caller)?))
}

#[utoipa::path(
    post,
    path = "/api/v1/peer/transit/read-receipt",
    tag = "Peer",
    responses(
        (status = 200, description = "Accepted into the inbox"),
        (status = 404, description = "No file with that global transit id")
    )
)]
pub async fn read_receipt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ReadReceiptRequest>,
) -> Result<Json<PeerTransferResponse>, ApiError> {
    let caller = authenticate(&state, &headers).await?;
    Ok(Json(state.receiver.accept_read_receipt(&request, &caller)?))
}

/// This identity's offline public key, used by senders to seal transfer
/// key headers.
#[utoipa::path(
    get,
    path = "/api/v1/peer/keys/offline",
    tag = "Peer",
    responses((status = 200, description = "SEC1 public key, hex, with its crc32"))
)]
pub async fn offline_public_key(State(state): State<AppState>) -> Json<OfflinePublicKeyResponse> {
    Json(OfflinePublicKeyResponse::from_key(&state.receiver.offline_keys().public_key()))
}
