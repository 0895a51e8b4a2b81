// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use drive_host::api::router;
use drive_host::config::HostConfig;
use drive_host::state::Host;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = HostConfig::from_env();
    init_tracing(&config.log_format);
    info!("Starting drive host v{}", env!("CARGO_PKG_VERSION"));

    let host = Host::open(config.clone()).await?;
    let shutdown = CancellationToken::new();
    let tasks = host.spawn_background(&shutdown);

    let addr: SocketAddr = config.bind_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, tenant = %host.tenant, "Peer perimeter listening");

    let signal = shutdown.clone();
    axum::serve(listener, router(host.app_state()))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Drive host stopped");
    Ok(())
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    if format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
