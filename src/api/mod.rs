// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Peer perimeter: the HTTP surface other identity hosts call.

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::drive::{FileSystemType, TargetDrive};
use crate::state::AppState;
use crate::transit::{DeleteLinkedFileRequest, ReadReceiptRequest};
use crate::transit::transport::{
    DELETE_LINKED_FILE_PATH, HOST_TO_HOST_PATH, OFFLINE_PUBLIC_KEY_PATH, READ_RECEIPT_PATH,
};

pub mod health;
pub mod peer;

/// Upper bound for a host-to-host upload.
const MAX_TRANSFER_BYTES: usize = 256 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route(HOST_TO_HOST_PATH, post(peer::host_to_host))
        .route(DELETE_LINKED_FILE_PATH, post(peer::delete_linked_file))
        .route(READ_RECEIPT_PATH, post(peer::read_receipt))
        .route(OFFLINE_PUBLIC_KEY_PATH, get(peer::offline_public_key))
        .route("/api-doc/openapi.json", get(openapi))
        .layer(DefaultBodyLimit::max(MAX_TRANSFER_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        peer::host_to_host,
        peer::delete_linked_file,
        peer::read_receipt,
        peer::offline_public_key
    ),
    components(schemas(
        health::HealthReport,
        health::ComponentChecks,
        health::LiveResponse,
        DeleteLinkedFileRequest,
        ReadReceiptRequest,
        TargetDrive,
        FileSystemType
    )),
    tags(
        (name = "Health", description = "Liveness and readiness"),
        (name = "Peer", description = "Host-to-host transit")
    )
)]
struct ApiDoc;
