//! In-memory aggregation state
//!
//! Holds the latest status per device, liveness per client and a bounded ring
//! of recent readings per device. All three live behind one lock and are only
//! ever updated together, so a reader never observes a device status without
//! the matching ring entry.

mod ring;

pub use ring::RingBuffer;

use log::debug;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::ValidationError;
use crate::models::{ClientStatus, DeviceStats, DeviceStatus, Reading};
use crate::utils::{calculate_stats, checked_before};
use crate::validation::{validate_reading, ValidationLimits};

/// Clients idle for this many client timeouts are forgotten entirely
const CLIENT_EXPIRY_FACTOR: u32 = 10;

/// Point-in-time copy of the aggregation state.
///
/// Rings are shared with the live state copy-on-write, so holding a snapshot
/// never blocks writers and never observes later readings.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub taken_at: OffsetDateTime,
    pub devices: HashMap<String, DeviceStatus>,
    pub clients: HashMap<String, ClientStatus>,
    pub rings: HashMap<String, Arc<RingBuffer<Reading>>>,
}

/// Outcome of one stale sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deactivated_clients: usize,
    pub removed_clients: usize,
    pub removed_devices: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSummary {
    pub devices: usize,
    pub clients: usize,
    pub buffered_readings: usize,
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<String, DeviceStatus>,
    clients: HashMap<String, ClientStatus>,
    rings: HashMap<String, Arc<RingBuffer<Reading>>>,
    /// Devices ever attributed to each client, for incremental device counts
    client_devices: HashMap<String, HashSet<String>>,
}

pub struct AggregationState {
    inner: RwLock<Inner>,
    ring_capacity: usize,
    limits: ValidationLimits,
}

impl AggregationState {
    pub fn new(ring_capacity: usize, limits: ValidationLimits) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            ring_capacity,
            limits,
        }
    }

    /// Validate and record a reading received now
    pub fn record(&self, reading: Reading) -> Result<(), ValidationError> {
        self.record_at(reading, OffsetDateTime::now_utc())
    }

    /// Validate and record a reading received at `now`.
    ///
    /// Rejected readings leave the state untouched. Accepted readings update
    /// the device status, the client status and the device ring under a single
    /// write lock; the work done under the lock does not depend on how many
    /// devices or clients are tracked.
    pub fn record_at(&self, reading: Reading, now: OffsetDateTime) -> Result<(), ValidationError> {
        validate_reading(&reading, now, &self.limits)?;

        let device_key = reading.device_key.clone();
        let client_id = reading.client_id.clone();

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        match inner.devices.get_mut(&device_key) {
            Some(status) => {
                status.latest = reading.clone();
                status.last_seen = now;
                status.client_id = client_id.clone();
                status.reading_count += 1;
            }
            None => {
                inner.devices.insert(
                    device_key.clone(),
                    DeviceStatus {
                        device_key: device_key.clone(),
                        latest: reading.clone(),
                        last_seen: now,
                        client_id: client_id.clone(),
                        reading_count: 1,
                    },
                );
            }
        }

        let first_attribution = inner
            .client_devices
            .entry(client_id.clone())
            .or_default()
            .insert(device_key.clone());

        let client = inner
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| ClientStatus {
                client_id: client_id.clone(),
                last_seen: now,
                device_count: 0,
                reading_count: 0,
                connected_since: now,
                active: true,
            });
        if !client.active {
            debug!("Client {} is active again", client_id);
            client.active = true;
            client.connected_since = now;
        }
        client.last_seen = now;
        client.reading_count += 1;
        if first_attribution {
            client.device_count += 1;
        }

        let capacity = self.ring_capacity;
        let ring = inner
            .rings
            .entry(device_key)
            .or_insert_with(|| Arc::new(RingBuffer::new(capacity)));
        Arc::make_mut(ring).push(reading);

        Ok(())
    }

    /// Copy the current state while holding the shared lock only for the copy
    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read();
        StateSnapshot {
            taken_at: OffsetDateTime::now_utc(),
            devices: inner.devices.clone(),
            clients: inner.clients.clone(),
            rings: inner.rings.clone(),
        }
    }

    /// Replace the state with previously persisted statuses and readings.
    ///
    /// Client device counts are rebuilt from the restored device statuses.
    pub fn restore(
        &self,
        devices: HashMap<String, DeviceStatus>,
        clients: HashMap<String, ClientStatus>,
        readings: HashMap<String, Vec<Reading>>,
    ) {
        let mut client_devices: HashMap<String, HashSet<String>> = HashMap::new();
        for (key, status) in &devices {
            client_devices
                .entry(status.client_id.clone())
                .or_default()
                .insert(key.clone());
        }

        let mut clients = clients;
        for (client_id, client) in clients.iter_mut() {
            client.device_count = client_devices.get(client_id).map_or(0, |d| d.len() as u64);
        }

        let rings = readings
            .into_iter()
            .filter(|(key, _)| devices.contains_key(key))
            .map(|(key, readings)| {
                let mut ring = RingBuffer::new(self.ring_capacity);
                ring.extend(readings);
                (key, Arc::new(ring))
            })
            .collect();

        let mut inner = self.inner.write();
        *inner = Inner {
            devices,
            clients,
            rings,
            client_devices,
        };
    }

    /// Flip idle clients to inactive and drop clients and devices idle past
    /// their horizons
    pub fn sweep_stale(&self, client_idle_timeout: Duration, device_idle_horizon: Duration) -> SweepReport {
        self.sweep_stale_at(OffsetDateTime::now_utc(), client_idle_timeout, device_idle_horizon)
    }

    pub fn sweep_stale_at(
        &self,
        now: OffsetDateTime,
        client_idle_timeout: Duration,
        device_idle_horizon: Duration,
    ) -> SweepReport {
        // A horizon reaching past the earliest representable instant never expires
        let before = |idle: Option<Duration>| idle.and_then(|idle| checked_before(now, idle));
        let inactive_before = before(Some(client_idle_timeout));
        let client_expired_before = before(client_idle_timeout.checked_mul(CLIENT_EXPIRY_FACTOR));
        let device_expired_before = before(Some(device_idle_horizon));
        let idle = |last_seen: OffsetDateTime, cutoff: Option<OffsetDateTime>| {
            cutoff.map_or(false, |cutoff| last_seen < cutoff)
        };

        let mut report = SweepReport::default();
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let stale_devices: Vec<String> = inner
            .devices
            .iter()
            .filter(|(_, status)| idle(status.last_seen, device_expired_before))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale_devices {
            inner.devices.remove(&key);
            inner.rings.remove(&key);
            for (client_id, devices) in inner.client_devices.iter_mut() {
                if devices.remove(&key) {
                    if let Some(client) = inner.clients.get_mut(client_id) {
                        client.device_count = client.device_count.saturating_sub(1);
                    }
                }
            }
            report.removed_devices += 1;
        }

        let mut expired_clients = Vec::new();
        for (client_id, client) in inner.clients.iter_mut() {
            if idle(client.last_seen, client_expired_before) {
                expired_clients.push(client_id.clone());
            } else if client.active && idle(client.last_seen, inactive_before) {
                client.active = false;
                report.deactivated_clients += 1;
            }
        }
        for client_id in expired_clients {
            inner.clients.remove(&client_id);
            inner.client_devices.remove(&client_id);
            report.removed_clients += 1;
        }

        report
    }

    /// All device statuses ordered by device key
    pub fn device_statuses(&self) -> Vec<DeviceStatus> {
        let inner = self.inner.read();
        let mut devices: Vec<DeviceStatus> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.device_key.cmp(&b.device_key));
        devices
    }

    /// All client statuses ordered by client id
    pub fn client_statuses(&self) -> Vec<ClientStatus> {
        let inner = self.inner.read();
        let mut clients: Vec<ClientStatus> = inner.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// Contents of a device's ring, oldest first
    pub fn recent_readings(&self, device_key: &str) -> Option<Vec<Reading>> {
        let inner = self.inner.read();
        inner.rings.get(device_key).map(|ring| ring.to_vec())
    }

    pub fn stats(&self, device_key: &str) -> Option<DeviceStats> {
        let inner = self.inner.read();
        let ring = inner.rings.get(device_key)?;
        calculate_stats(device_key, ring.iter())
    }

    pub fn summary(&self) -> StateSummary {
        let inner = self.inner.read();
        StateSummary {
            devices: inner.devices.len(),
            clients: inner.clients.len(),
            buffered_readings: inner.rings.values().map(|ring| ring.len()).sum(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ingest::build_reading;
    use crate::models::Measurement;

    pub(crate) fn reading_at(
        device_key: &str,
        client_id: &str,
        temperature: f64,
        timestamp: OffsetDateTime,
    ) -> Reading {
        build_reading(
            Measurement {
                device_key: device_key.to_string(),
                name: Some("Sauna".to_string()),
                temperature: Some(temperature),
                humidity: Some(50.0),
                battery: Some(80.0),
                rssi: -70,
                timestamp: Some(timestamp),
                client_id: client_id.to_string(),
                raw: None,
            },
            timestamp,
        )
        .unwrap()
    }

    fn state(capacity: usize) -> AggregationState {
        AggregationState::new(capacity, ValidationLimits::default())
    }

    #[test]
    fn test_record_creates_statuses() {
        let state = state(10);
        let now = OffsetDateTime::now_utc();
        state
            .record_at(reading_at("aabbccddeeff", "pi", 21.0, now), now)
            .unwrap();

        let devices = state.device_statuses();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].reading_count, 1);
        assert_eq!(devices[0].client_id, "pi");

        let clients = state.client_statuses();
        assert_eq!(clients.len(), 1);
        assert!(clients[0].active);
        assert_eq!(clients[0].device_count, 1);
        assert_eq!(clients[0].reading_count, 1);
        assert_eq!(clients[0].connected_since, now);
    }

    #[test]
    fn test_ring_keeps_most_recent_readings() {
        let state = state(5);
        let start = OffsetDateTime::now_utc();
        for i in 0..12 {
            let ts = start + time::Duration::seconds(i);
            state
                .record_at(reading_at("aabbccddeeff", "pi", i as f64, ts), ts)
                .unwrap();
        }

        let ring = state.recent_readings("aabbccddeeff").unwrap();
        let temperatures: Vec<f64> = ring.iter().map(|r| r.temperature).collect();
        assert_eq!(temperatures, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(state.device_statuses()[0].reading_count, 12);
    }

    #[test]
    fn test_device_count_is_incremental() {
        let state = state(1000);
        let now = OffsetDateTime::now_utc();
        for _ in 0..100 {
            state
                .record_at(reading_at("aabbccddeeff", "pi", 20.0, now), now)
                .unwrap();
        }
        let clients = state.client_statuses();
        assert_eq!(clients[0].device_count, 1);
        assert_eq!(clients[0].reading_count, 100);

        state
            .record_at(reading_at("112233445566", "pi", 20.0, now), now)
            .unwrap();
        assert_eq!(state.client_statuses()[0].device_count, 2);
    }

    #[test]
    fn test_rejected_reading_leaves_state_unchanged() {
        let state = state(10);
        let now = OffsetDateTime::now_utc();
        state
            .record_at(reading_at("aabbccddeeff", "pi", 20.0, now), now)
            .unwrap();
        let before = state.summary();
        let devices_before = state.device_statuses();
        let clients_before = state.client_statuses();

        let err = state
            .record_at(reading_at("aabbccddeeff", "pi", 150.0, now), now)
            .unwrap_err();
        assert!(matches!(err, ValidationError::TemperatureOutOfRange(_)));

        assert_eq!(state.summary(), before);
        assert_eq!(state.device_statuses(), devices_before);
        assert_eq!(state.client_statuses(), clients_before);
    }

    #[test]
    fn test_last_write_wins() {
        let state = state(10);
        let now = OffsetDateTime::now_utc();
        let first = reading_at("aabbccddeeff", "pi", 20.0, now);
        let second = reading_at(
            "aabbccddeeff",
            "pi",
            21.0,
            now + time::Duration::milliseconds(1),
        );
        state.record_at(first.clone(), now).unwrap();
        state.record_at(second.clone(), now).unwrap();

        let devices = state.device_statuses();
        assert_eq!(devices[0].latest, second);
        assert_eq!(
            state.recent_readings("aabbccddeeff").unwrap(),
            vec![first, second]
        );
        assert_eq!(state.client_statuses()[0].reading_count, 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let state = state(10);
        let now = OffsetDateTime::now_utc();
        state
            .record_at(reading_at("aabbccddeeff", "pi", 20.0, now), now)
            .unwrap();
        let snapshot = state.snapshot();

        state
            .record_at(reading_at("aabbccddeeff", "pi", 21.0, now), now)
            .unwrap();

        assert_eq!(snapshot.rings["aabbccddeeff"].len(), 1);
        assert_eq!(snapshot.devices["aabbccddeeff"].reading_count, 1);
        assert_eq!(state.recent_readings("aabbccddeeff").unwrap().len(), 2);
    }

    #[test]
    fn test_sweep_deactivates_then_removes_clients() {
        let state = state(10);
        let timeout = Duration::from_secs(60);
        let horizon = Duration::from_secs(30 * 86_400);
        let start = OffsetDateTime::now_utc();
        state
            .record_at(reading_at("aabbccddeeff", "pi", 20.0, start), start)
            .unwrap();

        let report = state.sweep_stale_at(start + time::Duration::seconds(30), timeout, horizon);
        assert_eq!(report, SweepReport::default());
        assert!(state.client_statuses()[0].active);

        let report = state.sweep_stale_at(start + time::Duration::seconds(61), timeout, horizon);
        assert_eq!(report.deactivated_clients, 1);
        assert!(!state.client_statuses()[0].active);

        // A new reading makes the client active again
        let later = start + time::Duration::seconds(120);
        state
            .record_at(reading_at("aabbccddeeff", "pi", 20.0, later), later)
            .unwrap();
        let client = &state.client_statuses()[0];
        assert!(client.active);
        assert_eq!(client.connected_since, later);

        let report = state.sweep_stale_at(later + time::Duration::seconds(601), timeout, horizon);
        assert_eq!(report.removed_clients, 1);
        assert!(state.client_statuses().is_empty());
        // The device outlives its client until its own horizon
        assert_eq!(state.device_statuses().len(), 1);
    }

    #[test]
    fn test_sweep_removes_idle_devices() {
        let state = state(10);
        let timeout = Duration::from_secs(3600);
        let horizon = Duration::from_secs(600);
        let start = OffsetDateTime::now_utc();
        state
            .record_at(reading_at("aabbccddeeff", "pi", 20.0, start), start)
            .unwrap();
        let later = start + time::Duration::seconds(700);
        state
            .record_at(reading_at("112233445566", "pi", 20.0, later), later)
            .unwrap();
        assert_eq!(state.client_statuses()[0].device_count, 2);

        let report = state.sweep_stale_at(later, timeout, horizon);
        assert_eq!(report.removed_devices, 1);
        assert!(state.recent_readings("aabbccddeeff").is_none());
        assert_eq!(state.device_statuses().len(), 1);
        assert_eq!(state.client_statuses()[0].device_count, 1);
    }

    #[test]
    fn test_sweep_with_unbounded_horizons_keeps_everything() {
        let state = state(10);
        let start = OffsetDateTime::now_utc();
        state
            .record_at(reading_at("aabbccddeeff", "pi", 20.0, start), start)
            .unwrap();

        let later = start + time::Duration::days(400);
        let report = state.sweep_stale_at(later, Duration::MAX, Duration::from_secs(u64::MAX / 2));
        assert_eq!(report, SweepReport::default());

        // The timeout itself is representable, its expiry multiple is not
        let huge = Duration::from_secs(1500 * 365 * 86_400);
        let report = state.sweep_stale_at(later, huge, huge);
        assert_eq!(report, SweepReport::default());
        assert!(state.client_statuses()[0].active);
        assert_eq!(state.device_statuses().len(), 1);
    }

    #[test]
    fn test_restore_rebuilds_device_counts() {
        let source = state(10);
        let now = OffsetDateTime::now_utc();
        source
            .record_at(reading_at("aabbccddeeff", "pi", 20.0, now), now)
            .unwrap();
        source
            .record_at(reading_at("112233445566", "pi", 21.0, now), now)
            .unwrap();
        let snapshot = source.snapshot();

        let readings = snapshot
            .rings
            .iter()
            .map(|(key, ring)| (key.clone(), ring.to_vec()))
            .collect();
        let restored = state(10);
        restored.restore(snapshot.devices.clone(), snapshot.clients.clone(), readings);

        assert_eq!(restored.summary(), source.summary());
        assert_eq!(restored.client_statuses()[0].device_count, 2);

        // A device seen again after restore does not bump the count
        restored
            .record_at(reading_at("aabbccddeeff", "pi", 20.0, now), now)
            .unwrap();
        assert_eq!(restored.client_statuses()[0].device_count, 2);
    }

    #[test]
    fn test_stats_over_ring() {
        let state = state(10);
        let now = OffsetDateTime::now_utc();
        for t in [18.0, 20.0, 22.0] {
            state
                .record_at(reading_at("aabbccddeeff", "pi", t, now), now)
                .unwrap();
        }
        let stats = state.stats("aabbccddeeff").unwrap();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.temperature.min, 18.0);
        assert_eq!(stats.temperature.max, 22.0);
        assert_eq!(stats.temperature.mean, 20.0);
        assert!(state.stats("112233445566").is_none());
    }
}
