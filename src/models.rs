use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One sensor sample as stored in partition files and held in the rings.
///
/// Derived fields are computed once when the reading is built from a
/// [`Measurement`] and never recomputed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_key: String,
    pub name: String,
    pub temperature: f64,
    pub temperature_f: f64,
    pub humidity: f64,
    pub absolute_humidity: f64,
    pub dew_point: f64,
    pub vapor_pressure_deficit: f64,
    pub battery: f64,
    pub rssi: i16,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub client_id: String,
}

/// Latest known state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_key: String,
    pub latest: Reading,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub client_id: String,
    pub reading_count: u64,
}

/// Liveness and activity record for one ingesting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub client_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub device_count: u64,
    pub reading_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_since: OffsetDateTime,
    pub active: bool,
}

/// Incoming sample before derived quantities are computed.
///
/// Either the physical fields are given directly, or `raw` carries a hex
/// encoded RuuviTag data format 5 payload which is decoded into them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Measurement {
    pub device_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub rssi: i16,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub client_id: String,
    #[serde(default)]
    pub raw: Option<String>,
}

/// min/max/mean of one metric across a device's recent readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStats {
    pub device_key: String,
    pub samples: usize,
    pub temperature: MetricStats,
    pub humidity: MetricStats,
    pub absolute_humidity: MetricStats,
    pub dew_point: MetricStats,
    pub vapor_pressure_deficit: MetricStats,
    pub battery: MetricStats,
    pub rssi: MetricStats,
}
