// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Host error taxonomy and its HTTP mapping.
//!
//! Every core operation returns [`HostResult`]. The variants follow the
//! categories callers need to tell apart:
//!
//! - `Client`: the request is invalid; carries a stable [`ClientErrorCode`]
//!   and is never retried automatically.
//! - `Security`: the caller lacks permission (ACL, master key, feed sender).
//! - `NotFound` / `NoValidIndex`: missing drive, file, or a drive index that
//!   is not ready for queries.
//! - `System` and the wrapped infrastructure errors: the tenant's storage
//!   or cryptographic state cannot be trusted; the whole operation fails.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::storage::{DbError, StorageError};

/// Stable codes for client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientErrorCode {
    InvalidDriveName,
    DriveAliasAndTypeAlreadyExists,
    CannotAllowAnonymousReadsOnOwnerOnlyDrive,
    CannotAllowSubscriptionsOnOwnerOnlyDrive,
    InvalidTargetDrive,
    VersionTagMismatch,
    CannotOverwriteNonExistentFile,
    CannotUpdateNonActiveFile,
    CannotChangeEncryption,
    InvalidKeyHeader,
    InvalidFileSystemType,
    ExistingFileWithUniqueId,
    InvalidChunkStart,
    MissingUploadData,
    InvalidPayloadKey,
    DuplicateQueryName,
    InvalidRecipient,
    InvalidTransferType,
    InvalidInstructionSet,
}

impl ClientErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientErrorCode::InvalidDriveName => "invalid_drive_name",
            ClientErrorCode::DriveAliasAndTypeAlreadyExists => "drive_alias_and_type_already_exists",
            ClientErrorCode::CannotAllowAnonymousReadsOnOwnerOnlyDrive => {
                "cannot_allow_anonymous_reads_on_owner_only_drive"
            }
            ClientErrorCode::CannotAllowSubscriptionsOnOwnerOnlyDrive => {
                "cannot_allow_subscriptions_on_owner_only_drive"
            }
            ClientErrorCode::InvalidTargetDrive => "invalid_target_drive",
            ClientErrorCode::VersionTagMismatch => "version_tag_mismatch",
            ClientErrorCode::CannotOverwriteNonExistentFile => "cannot_overwrite_non_existent_file",
            ClientErrorCode::CannotUpdateNonActiveFile => "cannot_update_non_active_file",
            ClientErrorCode::CannotChangeEncryption => "cannot_change_encryption",
            ClientErrorCode::InvalidKeyHeader => "invalid_key_header",
            ClientErrorCode::InvalidFileSystemType => "invalid_file_system_type",
            ClientErrorCode::ExistingFileWithUniqueId => "existing_file_with_unique_id",
            ClientErrorCode::InvalidChunkStart => "invalid_chunk_start",
            ClientErrorCode::MissingUploadData => "missing_upload_data",
            ClientErrorCode::InvalidPayloadKey => "invalid_payload_key",
            ClientErrorCode::DuplicateQueryName => "duplicate_query_name",
            ClientErrorCode::InvalidRecipient => "invalid_recipient",
            ClientErrorCode::InvalidTransferType => "invalid_transfer_type",
            ClientErrorCode::InvalidInstructionSet => "invalid_instruction_set",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("{message}")]
    Client {
        code: ClientErrorCode,
        message: String,
    },

    #[error("access denied: {0}")]
    Security(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no valid index for drive {0}")]
    NoValidIndex(Uuid),

    #[error("system error: {0}")]
    System(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    pub fn client(code: ClientErrorCode, message: impl Into<String>) -> Self {
        HostError::Client {
            code,
            message: message.into(),
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        HostError::Security(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HostError::NotFound(message.into())
    }

    pub fn system(message: impl Into<String>) -> Self {
        HostError::System(message.into())
    }

    /// The client error code, if this is a client error.
    pub fn client_code(&self) -> Option<ClientErrorCode> {
        match self {
            HostError::Client { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            HostError::Client { code, .. } => code.as_str(),
            HostError::Security(_) => "access_denied",
            HostError::NotFound(_) => "not_found",
            HostError::NoValidIndex(_) => "no_valid_index",
            HostError::System(_) => "system_error",
            HostError::Storage(_) => "storage_error",
            HostError::Database(_) => "database_error",
            HostError::Crypto(_) => "crypto_error",
            HostError::Serde(_) => "serialization_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HostError::Client { .. } => StatusCode::BAD_REQUEST,
            HostError::Security(_) => StatusCode::FORBIDDEN,
            HostError::NotFound(_) => StatusCode::NOT_FOUND,
            HostError::NoValidIndex(_) => StatusCode::SERVICE_UNAVAILABLE,
            HostError::System(_)
            | HostError::Storage(_)
            | HostError::Database(_)
            | HostError::Crypto(_)
            | HostError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_code: String,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error_code: error_code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "access_denied", message)
    }
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        let status = err.status_code();
        // Internal details stay in the logs.
        let message = if status.is_server_error() {
            tracing::error!(error = %err, "Request failed with a host error");
            "internal error".to_string()
        } else {
            err.to_string()
        };
        Self::new(status, err.error_code(), message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            error_code: self.error_code,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn client_errors_map_to_400_with_stable_code() {
        let err = HostError::client(ClientErrorCode::VersionTagMismatch, "stale");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "version_tag_mismatch");
        assert_eq!(err.client_code(), Some(ClientErrorCode::VersionTagMismatch));
    }

    #[test]
    fn security_and_index_errors_have_distinct_statuses() {
        assert_eq!(HostError::security("nope").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            HostError::NoValidIndex(Uuid::nil()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(HostError::not_found("f").status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let api: ApiError = HostError::client(ClientErrorCode::InvalidDriveName, "bad name").into();
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["error"], "bad name");
        assert_eq!(body["error_code"], "invalid_drive_name");
    }

    #[tokio::test]
    async fn server_errors_hide_details() {
        let api: ApiError = HostError::system("storage key mismatch").into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.message, "internal error");
    }
}
