mod config;
mod dispatch;
mod models;
mod protocols;
mod receiver;
mod server;
mod stores;
mod tracking;

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use dispatch::mapping::MappingSender;
use dispatch::relay::Relay;
use receiver::{EgtsReceiver, WialonReceiver};
use server::IngestServer;
use stores::{RouteStore, ScheduleStore, VehicleStore};
use tracking::TrackingService;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    info!(
        mapping_endpoints = config.mapping.len(),
        wialon = config.wialon.enabled,
        egts = config.egts.enabled,
        relay = config.relay.is_some(),
        "Loaded configuration"
    );

    let token = CancellationToken::new();
    let mut workers = JoinSet::new();

    // Reference data stores with their watch loops
    let routes = Arc::new(RouteStore::new(&config.datasource.routes_file));
    let vehicles = Arc::new(VehicleStore::new(&config.datasource.vehicles_file));
    let schedules = Arc::new(ScheduleStore::new(&config.datasource.schedules_file));

    {
        let routes = routes.clone();
        let token = token.clone();
        workers.spawn(async move {
            if let Err(err) = routes.run(token).await {
                error!(error = %err, "route store watch loop");
            }
        });
    }
    {
        let vehicles = vehicles.clone();
        let token = token.clone();
        workers.spawn(async move {
            if let Err(err) = vehicles.run(token).await {
                error!(error = %err, "vehicle store watch loop");
            }
        });
    }
    {
        let schedules = schedules.clone();
        let token = token.clone();
        workers.spawn(async move {
            if let Err(err) = schedules.run(token).await {
                error!(error = %err, "schedule store watch loop");
            }
        });
    }

    let tracking = Arc::new(TrackingService::new(routes, vehicles, schedules));

    // Tracker listeners
    if config.wialon.enabled {
        let server = IngestServer::bind(
            &config.wialon.listen_addr,
            WialonReceiver::new(tracking.clone()),
        )
        .await
        .expect("Failed to bind WialonIPS listener");
        let token = token.clone();
        workers.spawn(server.run(token));
    }

    if config.egts.enabled {
        let server = IngestServer::bind(
            &config.egts.listen_addr,
            EgtsReceiver::new(tracking.clone()),
        )
        .await
        .expect("Failed to bind EGTS listener");
        let token = token.clone();
        workers.spawn(server.run(token));
    }

    // Outbound dispatchers
    for mapping in &config.mapping {
        let sender = MappingSender::new(mapping).expect("Failed to build mapping sender");
        let rx = tracking.subscribe();
        let token = token.clone();
        workers.spawn(async move { sender.run(rx, token).await });
    }

    if let Some(relay_config) = &config.relay {
        let relay = Relay::new(relay_config);
        let rx = tracking.subscribe_raw();
        let token = token.clone();
        workers.spawn(async move { relay.run(rx, token).await });
    }

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    info!("signal received, starting graceful shutdown");
    token.cancel();
    while workers.join_next().await.is_some() {}
    info!("graceful shutdown complete");
}
