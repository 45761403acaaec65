//! Durable storage of readings in time partitions
//!
//! [`DurableStore`] is the capability the rest of the service depends on. The
//! default backend is [`JsonFileStore`], one JSON file per device per
//! partition directory; [`PostgresStore`] keeps the same contract on a single
//! table.

pub mod compression;
pub mod connection;
pub mod json_store;
pub mod postgres;
pub mod retention;
pub mod snapshot;

pub use json_store::JsonFileStore;
pub use postgres::PostgresStore;
pub use retention::{RetentionReport, RetentionSweeper};
pub use snapshot::{Snapshotter, StatusFiles};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::models::Reading;
use crate::partition::PartitionKey;

/// Files touched by one compression pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionSummary {
    pub compressed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Replace everything stored for a device in one partition with `readings`
    async fn save(
        &self,
        device_key: &str,
        partition: &PartitionKey,
        readings: &[Reading],
    ) -> Result<(), StorageError>;

    /// Readings of one device with `from <= timestamp <= to`, ascending.
    /// A missing bound is unbounded on that side.
    async fn load(
        &self,
        device_key: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<Reading>, StorageError>;

    async fn compress(&self, partition: &PartitionKey) -> Result<CompressionSummary, StorageError>;

    /// All partitions, ascending
    async fn list_partitions(&self) -> Result<Vec<PartitionKey>, StorageError>;

    /// Delete partitions past the retention horizon and compress older ones.
    /// A zero retention disables deletion.
    async fn enforce_retention(
        &self,
        retention: Duration,
        now: OffsetDateTime,
    ) -> Result<RetentionReport, StorageError>;
}

/// File name of a device's readings inside a partition directory
pub fn reading_file_name(device_key: &str) -> String {
    format!("readings_{}.json", device_key)
}

/// Write a file by writing a sibling temp file and renaming it into place
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    let mut file = std::fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(tmp, path)
}

pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Read a JSON file, returning None when it does not exist
pub(crate) fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
