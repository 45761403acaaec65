/// PostgreSQL durable store
///
/// All readings live in one table with the partition key as a column, so
/// retention deletes by partition key and compression is left to the database.
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use time::OffsetDateTime;
use tokio_postgres::Row;

use super::connection::execute_with_retry;
use super::retention::{plan_retention, RetentionReport};
use super::{CompressionSummary, DurableStore};
use crate::error::StorageError;
use crate::models::Reading;
use crate::partition::PartitionKey;
use crate::validation::is_canonical_device_key;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS readings (
        device_key TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        name TEXT NOT NULL,
        temperature DOUBLE PRECISION NOT NULL,
        temperature_f DOUBLE PRECISION NOT NULL,
        humidity DOUBLE PRECISION NOT NULL,
        absolute_humidity DOUBLE PRECISION NOT NULL,
        dew_point DOUBLE PRECISION NOT NULL,
        vapor_pressure_deficit DOUBLE PRECISION NOT NULL,
        battery DOUBLE PRECISION NOT NULL,
        rssi SMALLINT NOT NULL,
        time TIMESTAMPTZ NOT NULL,
        client_id TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS readings_device_time ON readings (device_key, time);
    CREATE INDEX IF NOT EXISTS readings_partition ON readings (partition_key);
";

const INSERT_READING: &str = "
    INSERT INTO readings(device_key, partition_key, name, temperature, temperature_f, humidity,
                         absolute_humidity, dew_point, vapor_pressure_deficit, battery, rssi,
                         time, client_id)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)";

const SELECT_READINGS: &str = "
    SELECT device_key, name, temperature, temperature_f, humidity, absolute_humidity, dew_point,
           vapor_pressure_deficit, battery, rssi, time, client_id
    FROM readings
    WHERE device_key = $1
      AND ($2::timestamptz IS NULL OR time >= $2)
      AND ($3::timestamptz IS NULL OR time <= $3)
    ORDER BY time";

fn row_to_reading(row: &Row) -> Result<Reading, tokio_postgres::Error> {
    Ok(Reading {
        device_key: row.try_get("device_key")?,
        name: row.try_get("name")?,
        temperature: row.try_get("temperature")?,
        temperature_f: row.try_get("temperature_f")?,
        humidity: row.try_get("humidity")?,
        absolute_humidity: row.try_get("absolute_humidity")?,
        dew_point: row.try_get("dew_point")?,
        vapor_pressure_deficit: row.try_get("vapor_pressure_deficit")?,
        battery: row.try_get("battery")?,
        rssi: row.try_get("rssi")?,
        timestamp: row.try_get("time")?,
        client_id: row.try_get("client_id")?,
    })
}

pub struct PostgresStore {
    database_url: String,
    interval: Duration,
}

impl PostgresStore {
    pub fn new(database_url: &str, interval: Duration) -> Self {
        Self {
            database_url: database_url.to_string(),
            interval,
        }
    }

    /// Create the readings table and its indexes if missing
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        execute_with_retry(&self.database_url, |client| async move {
            client.batch_execute(SCHEMA).await
        })
        .await
        .map_err(StorageError::Database)?;
        info!("PostgreSQL schema ready");
        Ok(())
    }
}

#[async_trait]
impl DurableStore for PostgresStore {
    async fn save(
        &self,
        device_key: &str,
        partition: &PartitionKey,
        readings: &[Reading],
    ) -> Result<(), StorageError> {
        if !is_canonical_device_key(device_key) {
            return Err(StorageError::InvalidDeviceKey(device_key.to_string()));
        }
        let device_key = device_key.to_string();
        let partition_key = partition.as_str().to_string();
        let readings = readings.to_vec();

        let inserted = execute_with_retry(&self.database_url, move |mut client| {
            let device_key = device_key.clone();
            let partition_key = partition_key.clone();
            let readings = readings.clone();
            async move {
                // Replace the device's readings for this partition atomically
                let tx = client.transaction().await?;
                tx.execute(
                    "DELETE FROM readings WHERE device_key = $1 AND partition_key = $2",
                    &[&device_key, &partition_key],
                )
                .await?;
                let insert = tx.prepare(INSERT_READING).await?;
                for reading in &readings {
                    tx.execute(
                        &insert,
                        &[
                            &device_key,
                            &partition_key,
                            &reading.name,
                            &reading.temperature,
                            &reading.temperature_f,
                            &reading.humidity,
                            &reading.absolute_humidity,
                            &reading.dew_point,
                            &reading.vapor_pressure_deficit,
                            &reading.battery,
                            &reading.rssi,
                            &reading.timestamp,
                            &reading.client_id,
                        ],
                    )
                    .await?;
                }
                tx.commit().await?;
                Ok::<_, tokio_postgres::Error>(readings.len())
            }
        })
        .await
        .map_err(StorageError::Database)?;

        debug!("Stored {} readings in PostgreSQL", inserted);
        Ok(())
    }

    async fn load(
        &self,
        device_key: &str,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<Reading>, StorageError> {
        if !is_canonical_device_key(device_key) {
            return Err(StorageError::InvalidDeviceKey(device_key.to_string()));
        }
        let device_key = device_key.to_string();

        execute_with_retry(&self.database_url, move |client| {
            let device_key = device_key.clone();
            async move {
                let rows = client
                    .query(SELECT_READINGS, &[&device_key, &from, &to])
                    .await?;
                rows.iter()
                    .map(row_to_reading)
                    .collect::<Result<Vec<Reading>, _>>()
            }
        })
        .await
        .map_err(StorageError::Database)
    }

    async fn compress(&self, partition: &PartitionKey) -> Result<CompressionSummary, StorageError> {
        debug!("Partition {} is stored in PostgreSQL, nothing to compress", partition);
        Ok(CompressionSummary::default())
    }

    async fn list_partitions(&self) -> Result<Vec<PartitionKey>, StorageError> {
        let names: Vec<String> = execute_with_retry(&self.database_url, |client| async move {
            let rows = client
                .query(
                    "SELECT DISTINCT partition_key FROM readings ORDER BY partition_key",
                    &[],
                )
                .await?;
            rows.iter()
                .map(|row| row.try_get::<_, String>(0))
                .collect::<Result<Vec<String>, _>>()
        })
        .await
        .map_err(StorageError::Database)?;

        let mut partitions = Vec::new();
        for name in names {
            match PartitionKey::parse(&name) {
                Ok(partition) => partitions.push(partition),
                Err(e) => warn!("Ignoring unexpected partition key in readings table: {}", e),
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    async fn enforce_retention(
        &self,
        retention: Duration,
        now: OffsetDateTime,
    ) -> Result<RetentionReport, StorageError> {
        let partitions = self.list_partitions().await?;
        let plan = plan_retention(&partitions, retention, now, self.interval, false);

        let mut report = RetentionReport::default();
        if plan.expired.is_empty() {
            return Ok(report);
        }

        let expired: Vec<String> = plan.expired.iter().map(|p| p.to_string()).collect();
        let deleted_rows = {
            let expired = expired.clone();
            execute_with_retry(&self.database_url, move |client| {
                let expired = expired.clone();
                async move {
                    client
                        .execute(
                            "DELETE FROM readings WHERE partition_key = ANY($1)",
                            &[&expired],
                        )
                        .await
                }
            })
            .await
            .map_err(StorageError::Database)?
        };

        info!(
            "Deleted {} rows from {} expired partitions",
            deleted_rows,
            expired.len()
        );
        report.deleted = expired;
        Ok(report)
    }
}
