/// File-backed durable store: one directory per partition, one JSON array
/// of readings per device
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use super::compression::{compress_partition_dir, compressed_path, read_maybe_compressed};
use super::retention::{plan_retention, RetentionReport};
use super::{reading_file_name, write_json_atomic, CompressionSummary, DurableStore};
use crate::error::StorageError;
use crate::models::Reading;
use crate::partition::PartitionKey;
use crate::validation::is_canonical_device_key;

/// One lock per partition directory, shared by every clone of a store
type PartitionLocks = Arc<Mutex<HashMap<PartitionKey, Arc<Mutex<()>>>>>;

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
    interval: Duration,
    compression: bool,
    locks: PartitionLocks,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>, interval: Duration, compression: bool) -> Self {
        Self {
            root: root.into(),
            interval,
            compression,
            locks: PartitionLocks::default(),
        }
    }

    fn partition_dir(&self, partition: &PartitionKey) -> PathBuf {
        self.root.join(partition.as_str())
    }

    /// Saves, compression and deletion of a partition never overlap; a save
    /// racing a compression pass could otherwise lose the fresh file.
    fn partition_lock(&self, partition: &PartitionKey) -> Arc<Mutex<()>> {
        self.locks.lock().entry(partition.clone()).or_default().clone()
    }

    fn check_device_key(device_key: &str) -> Result<(), StorageError> {
        if is_canonical_device_key(device_key) {
            Ok(())
        } else {
            Err(StorageError::InvalidDeviceKey(device_key.to_string()))
        }
    }

    pub fn save_blocking(
        &self,
        device_key: &str,
        partition: &PartitionKey,
        readings: &[Reading],
    ) -> Result<(), StorageError> {
        Self::check_device_key(device_key)?;

        let lock = self.partition_lock(partition);
        let _guard = lock.lock();
        let dir = self.partition_dir(partition);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(reading_file_name(device_key));
        write_json_atomic(&path, readings)?;

        // The fresh uncompressed file supersedes any compressed twin
        match std::fs::remove_file(compressed_path(&path)) {
            Ok(()) => debug!("Replaced compressed {} with a fresh save", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Readings stored for a device in one partition, None when the device
    /// has no file there
    fn read_device_file(
        &self,
        device_key: &str,
        partition: &PartitionKey,
    ) -> Result<Option<Vec<Reading>>, StorageError> {
        let lock = self.partition_lock(partition);
        let _guard = lock.lock();
        let plain = self.partition_dir(partition).join(reading_file_name(device_key));
        let compressed = compressed_path(&plain);

        // An original left next to its twin by an interrupted compression is
        // the authoritative copy
        let path = if plain.exists() {
            plain
        } else if compressed.exists() {
            compressed
        } else {
            return Ok(None);
        };

        let bytes = read_maybe_compressed(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn load_blocking(
        &self,
        device_key: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<Reading>, StorageError> {
        Self::check_device_key(device_key)?;

        let mut readings = Vec::new();
        for partition in self.list_partitions_blocking()? {
            if !partition.range().intersects(from, to) {
                continue;
            }
            match self.read_device_file(device_key, &partition) {
                Ok(Some(stored)) => readings.extend(stored),
                Ok(None) => {}
                Err(e) => warn!(
                    "Skipping unreadable readings of {} in partition {}: {}",
                    device_key, partition, e
                ),
            }
        }

        readings.retain(|r| {
            from.map_or(true, |from| r.timestamp >= from) && to.map_or(true, |to| r.timestamp <= to)
        });
        readings.sort_by_key(|r| r.timestamp);
        Ok(readings)
    }

    pub fn list_partitions_blocking(&self) -> Result<Vec<PartitionKey>, StorageError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut partitions = Vec::new();
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match PartitionKey::parse(&name) {
                Ok(partition) => partitions.push(partition),
                Err(e) => warn!("Ignoring unexpected directory in storage root: {}", e),
            }
        }

        partitions.sort();
        Ok(partitions)
    }

    pub fn compress_blocking(
        &self,
        partition: &PartitionKey,
    ) -> Result<CompressionSummary, StorageError> {
        let lock = self.partition_lock(partition);
        let _guard = lock.lock();
        Ok(compress_partition_dir(&self.partition_dir(partition))?)
    }

    /// Remove expired partition directories, recording each outcome
    fn delete_partitions_blocking(&self, expired: &[PartitionKey]) -> RetentionReport {
        let mut report = RetentionReport::default();
        for partition in expired {
            let lock = self.partition_lock(partition);
            let _guard = lock.lock();
            match std::fs::remove_dir_all(self.partition_dir(partition)) {
                Ok(()) => {
                    info!("Deleted expired partition {}", partition);
                    report.deleted.push(partition.to_string());
                }
                Err(e) => {
                    warn!("Failed to delete expired partition {}: {}", partition, e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[async_trait]
impl DurableStore for JsonFileStore {
    async fn save(
        &self,
        device_key: &str,
        partition: &PartitionKey,
        readings: &[Reading],
    ) -> Result<(), StorageError> {
        let store = self.clone();
        let device_key = device_key.to_string();
        let partition = partition.clone();
        let readings = readings.to_vec();
        tokio::task::spawn_blocking(move || store.save_blocking(&device_key, &partition, &readings))
            .await?
    }

    async fn load(
        &self,
        device_key: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<Reading>, StorageError> {
        let store = self.clone();
        let device_key = device_key.to_string();
        tokio::task::spawn_blocking(move || store.load_blocking(&device_key, from, to)).await?
    }

    async fn compress(&self, partition: &PartitionKey) -> Result<CompressionSummary, StorageError> {
        let store = self.clone();
        let partition = partition.clone();
        tokio::task::spawn_blocking(move || store.compress_blocking(&partition)).await?
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionKey>, StorageError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_partitions_blocking()).await?
    }

    async fn enforce_retention(
        &self,
        retention: Duration,
        now: OffsetDateTime,
    ) -> Result<RetentionReport, StorageError> {
        let partitions = self.list_partitions().await?;
        let plan = plan_retention(&partitions, retention, now, self.interval, self.compression);

        let store = self.clone();
        let expired = plan.expired;
        let mut report =
            tokio::task::spawn_blocking(move || store.delete_partitions_blocking(&expired)).await?;

        for partition in plan.compressible {
            match self.compress(&partition).await {
                Ok(summary) => {
                    if summary.compressed > 0 {
                        report.compressed_partitions += 1;
                        report.compressed_files += summary.compressed;
                    }
                    report.failed += summary.failed;
                }
                Err(e) => {
                    warn!("Failed to compress partition {}: {}", partition, e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
