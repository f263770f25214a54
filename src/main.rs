use anyhow::Context;
use sma_victron_grid_meter::{
    config, dbus_service::DbusService, grid_meter, meter_listener, AttributeStore, BusPeer,
    ChangeNotifier, Config, MeterListener,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging first, so configuration warnings are not lost
    tracing_subscriber::fmt()
        .with_max_level(config::log_level_from_env())
        .init();
    let config = Config::from_env();

    tracing::info!("Starting SMA to Victron grid meter bridge");
    tracing::debug!("Configuration: {config:?}");

    let store = Arc::new(AttributeStore::new());
    grid_meter::initialize(&store);

    // Startup failures are fatal; restarting is the supervisor's job
    let service = DbusService::start(
        &config.dbus_name,
        BusPeer::new(store.clone()),
        &grid_meter::published_paths(),
    )
    .await?;
    tracing::info!(
        "Successfully connected to dbus and registered as a meter... Commencing reading of the SMA meter"
    );

    let (notifier, changes) = ChangeNotifier::new();
    let publisher = service.spawn_publisher(changes);

    let socket = meter_listener::bind_multicast(config.multicast_address)
        .await
        .with_context(|| format!("failed to listen on {}", config.multicast_address))?;
    let listener = MeterListener::new(store, notifier, config.serial_filter).spawn(socket);

    wait_for_shutdown().await?;
    tracing::info!("Shutting down");

    listener.abort();
    publisher.abort();
    service.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to wait for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
