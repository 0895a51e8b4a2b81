// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Liveness and readiness probes of the peer perimeter.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthReport {
    /// "ok" or "degraded".
    pub status: String,
    pub checks: ComponentChecks,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ComponentChecks {
    /// Whether the tenant data directory passes a write-read-delete probe.
    pub data_dir: bool,
    /// Received transfers not yet applied; absent when the inbox could not
    /// be read.
    pub inbox_pending: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LiveResponse {
    pub status: String,
    pub version: String,
}

fn report(state: &AppState) -> (StatusCode, Json<HealthReport>) {
    let data_dir = match state.drives.storage().health_check() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Data directory health check failed");
            false
        }
    };
    let checks = ComponentChecks {
        data_dir,
        inbox_pending: state.receiver.pending_inbox_items().ok(),
    };
    let healthy = checks.data_dir && checks.inbox_pending.is_some();
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(HealthReport {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            checks,
        }),
    )
}

/// Component health; 503 when storage or the inbox is unavailable.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "All components available", body = HealthReport),
        (status = 503, description = "A component is unavailable", body = HealthReport)
    )
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    report(&state)
}

#[utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses((status = 200, description = "Process is running", body = LiveResponse))
)]
pub async fn liveness() -> Json<LiveResponse> {
    Json(LiveResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Same checks as `/health`, for orchestrator readiness probes.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Ready to accept transfers", body = HealthReport),
        (status = 503, description = "Not ready", body = HealthReport)
    )
)]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    report(&state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::state::Host;

    #[tokio::test]
    async fn healthy_host_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::open(HostConfig {
            data_dir: dir.path().to_path_buf(),
            ..HostConfig::default()
        })
        .await
        .unwrap();

        let (status, Json(report)) = health(State(host.app_state())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report.status, "ok");
        assert_eq!(report.checks.inbox_pending, Some(0));
        assert!(report.checks.data_dir);
    }

    #[tokio::test]
    async fn missing_data_dir_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::open(HostConfig {
            data_dir: dir.path().to_path_buf(),
            ..HostConfig::default()
        })
        .await
        .unwrap();
        std::fs::remove_dir_all(dir.path()).unwrap();

        let (status, Json(report)) = readiness(State(host.app_state())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.status, "degraded");
        assert!(!report.checks.data_dir);
    }
}
