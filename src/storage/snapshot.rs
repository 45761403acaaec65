//! Persisting aggregation snapshots
//!
//! Status maps go to `devices.json` and `clients.json` in the storage root.
//! Ring contents are merged into the partition files of the durable store.

use log::{debug, error, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{read_json_file, write_json_atomic, DurableStore};
use crate::auth::AuthConfig;
use crate::error::StorageError;
use crate::models::{ClientStatus, DeviceStatus, Reading};
use crate::partition::{partition_for, range_of, PartitionKey};
use crate::state::StateSnapshot;
use crate::utils::format_datetime;

pub const DEVICES_FILE: &str = "devices.json";
pub const CLIENTS_FILE: &str = "clients.json";
pub const AUTH_FILE: &str = "auth.json";

/// The JSON status files kept directly in the storage root
#[derive(Debug, Clone)]
pub struct StatusFiles {
    root: PathBuf,
}

impl StatusFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn save_devices(&self, devices: &HashMap<String, DeviceStatus>) -> Result<(), StorageError> {
        let sorted: BTreeMap<&String, &DeviceStatus> = devices.iter().collect();
        write_json_atomic(&self.root.join(DEVICES_FILE), &sorted)
    }

    pub fn load_devices(&self) -> Result<HashMap<String, DeviceStatus>, StorageError> {
        Ok(read_json_file(&self.root.join(DEVICES_FILE))?.unwrap_or_default())
    }

    pub fn save_clients(&self, clients: &HashMap<String, ClientStatus>) -> Result<(), StorageError> {
        let sorted: BTreeMap<&String, &ClientStatus> = clients.iter().collect();
        write_json_atomic(&self.root.join(CLIENTS_FILE), &sorted)
    }

    pub fn load_clients(&self) -> Result<HashMap<String, ClientStatus>, StorageError> {
        Ok(read_json_file(&self.root.join(CLIENTS_FILE))?.unwrap_or_default())
    }

    pub fn save_auth(&self, auth: &AuthConfig) -> Result<(), StorageError> {
        write_json_atomic(&self.root.join(AUTH_FILE), auth)
    }

    pub fn load_auth(&self) -> Result<AuthConfig, StorageError> {
        Ok(read_json_file(&self.root.join(AUTH_FILE))?.unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub devices: usize,
    pub saved_partitions: usize,
    pub failed: usize,
}

/// Writes aggregation snapshots to disk.
///
/// For each device only the readings added since its last successful persist
/// are written, detected through the device's reading count. They are merged
/// with what the partition already holds, so the overwrite semantics of
/// [`DurableStore::save`] never drop readings that already left the ring.
pub struct Snapshotter {
    store: Arc<dyn DurableStore>,
    files: StatusFiles,
    interval: Duration,
    persisted_counts: Mutex<HashMap<String, u64>>,
}

impl Snapshotter {
    pub fn new(store: Arc<dyn DurableStore>, files: StatusFiles, interval: Duration) -> Self {
        Self {
            store,
            files,
            interval,
            persisted_counts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn persist(&self, snapshot: &StateSnapshot) -> PersistReport {
        let mut report = PersistReport {
            devices: snapshot.devices.len(),
            ..Default::default()
        };

        let files = self.files.clone();
        let devices = snapshot.devices.clone();
        let clients = snapshot.clients.clone();
        let written = tokio::task::spawn_blocking(move || {
            files.save_devices(&devices)?;
            files.save_clients(&clients)
        })
        .await
        .map_err(StorageError::from)
        .and_then(|result| result);
        if let Err(e) = written {
            error!("Failed to write status files: {}", e);
            report.failed += 1;
        }

        // Held for the whole pass so overlapping persists cannot race on counts
        let mut persisted = self.persisted_counts.lock().await;
        persisted.retain(|key, _| snapshot.devices.contains_key(key));

        for (device_key, ring) in &snapshot.rings {
            let count = snapshot
                .devices
                .get(device_key)
                .map_or(0, |status| status.reading_count);
            let fresh = match persisted.get(device_key) {
                Some(&done) if done == count => continue,
                Some(&done) if done < count => (count - done) as usize,
                _ => count as usize,
            };

            let mut by_partition: BTreeMap<PartitionKey, Vec<Reading>> = BTreeMap::new();
            for reading in ring.latest(fresh) {
                by_partition
                    .entry(partition_for(reading.timestamp, self.interval))
                    .or_default()
                    .push(reading.clone());
            }

            let mut complete = true;
            for (partition, readings) in by_partition {
                match self.merge_and_save(device_key, &partition, readings).await {
                    Ok(total) => {
                        debug!(
                            "Saved {} readings of {} to partition {}",
                            total, device_key, partition
                        );
                        report.saved_partitions += 1;
                    }
                    Err(e) => {
                        error!(
                            "Failed to persist readings of {} to partition {}: {}",
                            device_key, partition, e
                        );
                        report.failed += 1;
                        complete = false;
                    }
                }
            }

            if complete {
                persisted.insert(device_key.clone(), count);
            } else {
                warn!("Readings of {} will be retried on the next snapshot", device_key);
            }
        }

        debug!(
            "Snapshot taken at {} persisted: {} partitions saved, {} failures",
            format_datetime(&snapshot.taken_at),
            report.saved_partitions,
            report.failed
        );
        report
    }

    async fn merge_and_save(
        &self,
        device_key: &str,
        partition: &PartitionKey,
        fresh: Vec<Reading>,
    ) -> Result<usize, StorageError> {
        let range = range_of(partition);
        let existing = self
            .store
            .load(device_key, Some(range.start), Some(range.last_instant()))
            .await?;

        // Deduplicate on (timestamp, client); later copies win
        let mut merged: BTreeMap<(i128, String), Reading> = BTreeMap::new();
        for reading in existing.into_iter().chain(fresh) {
            merged.insert(
                (reading.timestamp.unix_timestamp_nanos(), reading.client_id.clone()),
                reading,
            );
        }

        let readings: Vec<Reading> = merged.into_values().collect();
        self.store.save(device_key, partition, &readings).await?;
        Ok(readings.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKey;
    use crate::state::tests::reading_at;
    use crate::state::AggregationState;
    use crate::storage::{CompressionSummary, JsonFileStore, RetentionReport};
    use crate::validation::ValidationLimits;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use time::OffsetDateTime;

    const DAY: Duration = Duration::from_secs(86_400);
    const DEVICE: &str = "aabbccddeeff";

    /// File store whose saves fail while `failing` is set
    struct FlakyStore {
        inner: JsonFileStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn save(
            &self,
            device_key: &str,
            partition: &PartitionKey,
            readings: &[Reading],
        ) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Database("disk full".to_string()));
            }
            self.inner.save(device_key, partition, readings).await
        }

        async fn load(
            &self,
            device_key: &str,
            from: Option<OffsetDateTime>,
            to: Option<OffsetDateTime>,
        ) -> Result<Vec<Reading>, StorageError> {
            self.inner.load(device_key, from, to).await
        }

        async fn compress(&self, partition: &PartitionKey) -> Result<CompressionSummary, StorageError> {
            self.inner.compress(partition).await
        }

        async fn list_partitions(&self) -> Result<Vec<PartitionKey>, StorageError> {
            self.inner.list_partitions().await
        }

        async fn enforce_retention(
            &self,
            retention: Duration,
            now: OffsetDateTime,
        ) -> Result<RetentionReport, StorageError> {
            self.inner.enforce_retention(retention, now).await
        }
    }

    fn setup(root: &Path, ring: usize) -> (Arc<JsonFileStore>, Snapshotter, AggregationState) {
        let store = Arc::new(JsonFileStore::new(root, DAY, true));
        let snapshotter = Snapshotter::new(store.clone(), StatusFiles::new(root), DAY);
        let state = AggregationState::new(ring, ValidationLimits::default());
        (store, snapshotter, state)
    }

    #[test]
    fn test_status_files_round_trip() {
        let dir = tempdir().unwrap();
        let files = StatusFiles::new(dir.path());
        assert!(files.load_devices().unwrap().is_empty());
        assert!(files.load_auth().unwrap().keys.is_empty());

        let state = AggregationState::new(10, ValidationLimits::default());
        let now = OffsetDateTime::now_utc();
        state
            .record_at(reading_at(DEVICE, "pi", 20.0, now), now)
            .unwrap();
        let snapshot = state.snapshot();

        files.save_devices(&snapshot.devices).unwrap();
        files.save_clients(&snapshot.clients).unwrap();
        assert_eq!(files.load_devices().unwrap(), snapshot.devices);
        assert_eq!(files.load_clients().unwrap(), snapshot.clients);

        let mut auth = AuthConfig::default();
        auth.keys.insert("k".to_string(), ApiKey::client("pi"));
        files.save_auth(&auth).unwrap();
        assert_eq!(files.load_auth().unwrap(), auth);
    }

    #[test]
    fn test_corrupt_status_file_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(DEVICES_FILE), "[").unwrap();
        assert!(StatusFiles::new(dir.path()).load_devices().is_err());
    }

    #[tokio::test]
    async fn test_persist_writes_ring_and_status() {
        let dir = tempdir().unwrap();
        let (store, snapshotter, state) = setup(dir.path(), 100);
        let now = OffsetDateTime::now_utc();
        for i in 0..3 {
            let t = now - time::Duration::seconds(10 - i);
            state.record_at(reading_at(DEVICE, "pi", 20.0, t), now).unwrap();
        }

        let report = snapshotter.persist(&state.snapshot()).await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.devices, 1);
        assert!(dir.path().join(DEVICES_FILE).exists());
        assert!(dir.path().join(CLIENTS_FILE).exists());
        assert_eq!(store.load(DEVICE, None, None).await.unwrap().len(), 3);

        // Nothing new: nothing saved
        let report = snapshotter.persist(&state.snapshot()).await;
        assert_eq!(report.saved_partitions, 0);
    }

    #[tokio::test]
    async fn test_persist_keeps_readings_evicted_from_ring() {
        let dir = tempdir().unwrap();
        let (store, snapshotter, state) = setup(dir.path(), 2);
        let now = OffsetDateTime::now_utc();
        let base = now - time::Duration::minutes(10);

        for i in 0..2 {
            let t = base + time::Duration::seconds(i);
            state.record_at(reading_at(DEVICE, "pi", 20.0, t), now).unwrap();
        }
        snapshotter.persist(&state.snapshot()).await;

        // Both earlier readings are evicted from the two-slot ring
        for i in 2..4 {
            let t = base + time::Duration::seconds(i);
            state.record_at(reading_at(DEVICE, "pi", 21.0, t), now).unwrap();
        }
        snapshotter.persist(&state.snapshot()).await;

        let stored = store.load(DEVICE, None, None).await.unwrap();
        assert_eq!(stored.len(), 4);
        assert!(stored.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_failed_save_is_retried_on_next_persist() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FlakyStore {
            inner: JsonFileStore::new(dir.path(), DAY, true),
            failing: AtomicBool::new(true),
        });
        let snapshotter = Snapshotter::new(store.clone(), StatusFiles::new(dir.path()), DAY);
        let state = AggregationState::new(10, ValidationLimits::default());
        let now = OffsetDateTime::now_utc();
        for i in 0..3 {
            let t = now - time::Duration::seconds(10 - i);
            state.record_at(reading_at(DEVICE, "pi", 20.0, t), now).unwrap();
        }

        let report = snapshotter.persist(&state.snapshot()).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.saved_partitions, 0);
        assert!(store.load(DEVICE, None, None).await.unwrap().is_empty());

        // Same snapshot again: the watermark did not move, so everything is written
        store.failing.store(false, Ordering::SeqCst);
        let report = snapshotter.persist(&state.snapshot()).await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.saved_partitions, 1);
        assert_eq!(store.load(DEVICE, None, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_restarted_snapshotter_does_not_duplicate() {
        let dir = tempdir().unwrap();
        let (store, snapshotter, state) = setup(dir.path(), 10);
        let now = OffsetDateTime::now_utc();
        state.record_at(reading_at(DEVICE, "pi", 20.0, now), now).unwrap();
        snapshotter.persist(&state.snapshot()).await;

        // A fresh snapshotter has no watermarks and rewrites the whole ring
        let again = Snapshotter::new(store.clone(), StatusFiles::new(dir.path()), DAY);
        let report = again.persist(&state.snapshot()).await;
        assert_eq!(report.saved_partitions, 1);
        assert_eq!(store.load(DEVICE, None, None).await.unwrap().len(), 1);
    }
}
