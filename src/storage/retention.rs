//! Retention and compression policy for partitions
//!
//! A partition is expired once its latest instant is at or before the cutoff
//! `now - retention`. Expired partitions are deleted wholesale. Partitions that
//! are still retained but have already ended are eligible for compression; the
//! partition covering `now` is never touched.

use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use super::DurableStore;
use crate::error::StorageError;
use crate::partition::{partition_for, range_of, PartitionKey};
use crate::utils::{checked_before, format_datetime};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted: Vec<String>,
    pub compressed_partitions: usize,
    pub compressed_files: usize,
    pub failed: usize,
}

/// What a retention pass should do with each partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub expired: Vec<PartitionKey>,
    pub compressible: Vec<PartitionKey>,
}

/// Cutoff instant for a retention duration.
///
/// None when retention is disabled or reaches back past the earliest
/// representable instant; either way nothing is old enough to delete.
pub fn retention_cutoff(retention: Duration, now: OffsetDateTime) -> Option<OffsetDateTime> {
    if retention.is_zero() {
        None
    } else {
        checked_before(now, retention)
    }
}

pub fn is_expired(partition: &PartitionKey, cutoff: OffsetDateTime) -> bool {
    range_of(partition).last_instant() <= cutoff
}

/// Split partitions into those to delete and those to compress
pub fn plan_retention(
    partitions: &[PartitionKey],
    retention: Duration,
    now: OffsetDateTime,
    interval: Duration,
    compression: bool,
) -> RetentionPlan {
    let cutoff = retention_cutoff(retention, now);
    let current = partition_for(now, interval);

    let mut plan = RetentionPlan::default();
    for partition in partitions {
        if cutoff.map_or(false, |cutoff| is_expired(partition, cutoff)) {
            plan.expired.push(partition.clone());
        } else if compression && *partition != current && range_of(partition).end <= now {
            plan.compressible.push(partition.clone());
        }
    }
    plan
}

/// Periodic driver for [`DurableStore::enforce_retention`]
pub struct RetentionSweeper {
    store: Arc<dyn DurableStore>,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn DurableStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub async fn run_once(&self) -> Result<RetentionReport, StorageError> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_at(&self, now: OffsetDateTime) -> Result<RetentionReport, StorageError> {
        match retention_cutoff(self.retention, now) {
            Some(cutoff) => info!(
                "Enforcing retention, deleting partitions ending before {}",
                format_datetime(&cutoff)
            ),
            None => info!("Retention disabled, compressing older partitions only"),
        }

        let report = self.store.enforce_retention(self.retention, now).await;
        match &report {
            Ok(report) => info!(
                "Retention pass done: {} partitions deleted, {} files compressed in {} partitions, {} failures",
                report.deleted.len(),
                report.compressed_files,
                report.compressed_partitions,
                report.failed
            ),
            Err(e) => error!("Retention pass failed: {}", e),
        }
        report
    }
}
