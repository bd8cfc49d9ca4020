use anyhow::{Context, Result};
use iot_monitor::api::{start_api_server, AppState};
use iot_monitor::broker::create_client;
use iot_monitor::config::Config;
use iot_monitor::document_store::{DocumentStore, PgDocumentStore};
use iot_monitor::mqtt_bridge::{run_event_loop, IngestionBridge};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting IoT monitor");

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    let shutdown = CancellationToken::new();

    // Storage starts even when the database is down; calls fail until it is reachable
    let store = Arc::new(PgDocumentStore::connect(&config.database).await);
    let reconnect_handle = tokio::spawn(store.clone().maintain_connection(shutdown.clone()));

    let (mqtt_client, eventloop) =
        create_client(&config.mqtt).context("Failed to create MQTT client")?;

    let document_store: Arc<dyn DocumentStore> = store.clone();
    let bridge = Arc::new(IngestionBridge::new(
        Arc::new(mqtt_client),
        document_store.clone(),
        config.mqtt.subscribe_topic.clone(),
        config.bridge.retry_queue_capacity,
    )
    .with_max_packet_size(config.mqtt.max_packet_size));

    let bridge_handle = tokio::spawn({
        let bridge = bridge.clone();
        let mqtt_config = config.mqtt.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = run_event_loop(bridge, eventloop, mqtt_config, shutdown).await {
                error!(error = %e, "MQTT bridge error");
            }
        }
    });

    let api_state = AppState {
        store: document_store,
        bridge,
        upload_dir: config.api.upload_dir(),
    };

    let api_handle = tokio::spawn({
        let api_config = config.api.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
                error!(error = %e, "API server error");
            }
        }
    });

    info!("IoT monitor started successfully");

    shutdown_signal().await;

    info!("Shutting down IoT monitor");
    shutdown.cancel();

    for (name, handle) in [
        ("api", api_handle),
        ("bridge", bridge_handle),
        ("db-reconnect", reconnect_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task failed during shutdown");
        }
    }

    store.close().await;

    info!("IoT monitor stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
