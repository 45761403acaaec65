mod auth;
mod config;
mod console;
mod error;
mod ingest;
mod models;
mod partition;
mod query;
mod sensor;
mod state;
mod storage;
mod tasks;
mod utils;
mod validation;

use log::{error, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::BufReader;

use auth::AuthConfig;
use config::{ServerConfig, StorageBackend};
use console::Console;
use ingest::Ingestor;
use models::Reading;
use partition::{current_partition, range_of};
use query::QueryFacade;
use state::AggregationState;
use storage::{
    DurableStore, JsonFileStore, PostgresStore, RetentionSweeper, Snapshotter, StatusFiles,
};
use tasks::{BackgroundTasks, TaskSchedule};
use utils::format_datetime;

async fn open_store(config: &ServerConfig) -> Result<Arc<dyn DurableStore>, Box<dyn std::error::Error>> {
    match &config.backend {
        StorageBackend::Json => {
            info!("Using JSON partition files under {}", config.storage_root.display());
            Ok(Arc::new(JsonFileStore::new(
                &config.storage_root,
                config.partition_interval,
                config.compression,
            )))
        }
        StorageBackend::Postgres { database_url } => {
            info!("Using PostgreSQL storage");
            let store = PostgresStore::new(database_url, config.partition_interval);
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Rebuild the aggregation state from the status files and the readings of
/// the current partition
async fn restore_state(
    state: &AggregationState,
    files: &StatusFiles,
    store: &dyn DurableStore,
    config: &ServerConfig,
) {
    let devices = files.load_devices().unwrap_or_else(|e| {
        warn!("Failed to load device statuses, starting empty: {}", e);
        HashMap::new()
    });
    let clients = files.load_clients().unwrap_or_else(|e| {
        warn!("Failed to load client statuses, starting empty: {}", e);
        HashMap::new()
    });

    let range = range_of(&current_partition(config.partition_interval));
    let mut readings: HashMap<String, Vec<Reading>> = HashMap::new();
    for device_key in devices.keys() {
        match store
            .load(device_key, Some(range.start), Some(range.last_instant()))
            .await
        {
            Ok(loaded) if !loaded.is_empty() => {
                readings.insert(device_key.clone(), loaded);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load recent readings of {}: {}", device_key, e),
        }
    }

    state.restore(devices, clients, readings);
    let summary = state.summary();
    info!(
        "Restored {} devices, {} clients and {} recent readings",
        summary.devices, summary.clients, summary.buffered_readings
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match ServerConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.storage_root) {
        error!(
            "Cannot create storage root {}: {}",
            config.storage_root.display(),
            e
        );
        return Err(e.into());
    }

    let store = open_store(&config).await?;
    let files = StatusFiles::new(&config.storage_root);

    let auth = files.load_auth().unwrap_or_else(|e| {
        warn!("Failed to load API keys, authorization disabled: {}", e);
        AuthConfig::default()
    });
    if !auth.is_enabled() {
        warn!("No API keys configured, accepting readings from any client");
    }
    let auth = Arc::new(RwLock::new(auth));

    let state = Arc::new(AggregationState::new(config.ring_capacity, config.limits.clone()));
    restore_state(&state, &files, store.as_ref(), &config).await;

    let snapshotter = Arc::new(Snapshotter::new(
        store.clone(),
        files.clone(),
        config.partition_interval,
    ));
    let sweeper = Arc::new(RetentionSweeper::new(store.clone(), config.retention));
    let tasks = BackgroundTasks::spawn(
        TaskSchedule {
            snapshot_interval: config.snapshot_interval,
            stale_sweep_interval: config.stale_sweep_interval,
            retention_interval: config.retention_sweep_interval,
            client_idle_timeout: config.client_idle_timeout,
            device_idle_horizon: config.device_idle_horizon,
        },
        state.clone(),
        snapshotter.clone(),
        sweeper,
    );

    let ingestor = Arc::new(Ingestor::new(
        state.clone(),
        auth.clone(),
        config.device_names.clone(),
    ));
    let facade = QueryFacade::new(state.clone(), store.clone());
    let console = Console::new(ingestor, facade, auth.clone(), files.clone());

    info!(
        "Service started at {}",
        format_datetime(&OffsetDateTime::now_utc())
    );

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        let _ = tx.send(());
    });

    // Serve the console until stdin closes or shutdown is requested
    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console.run(stdin, tokio::io::stdout()) => {
            match result {
                Ok(_) => {
                    info!("Console closed, running until terminated");
                    let _ = (&mut rx).await;
                }
                Err(e) => error!("Console failed: {}", e),
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    if !tasks.shutdown(config.shutdown_grace).await {
        warn!("Some background tasks were aborted");
    }

    let report = snapshotter.persist(&state.snapshot()).await;
    info!(
        "Final snapshot: {} devices, {} partitions saved, {} failures",
        report.devices, report.saved_partitions, report.failed
    );

    let auth = auth.read().clone();
    if let Err(e) = files.save_auth(&auth) {
        error!("Failed to save API keys: {}", e);
    }

    Ok(())
}
