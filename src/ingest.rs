/// Ingestion path: authorization, reading construction and recording
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::auth::AuthConfig;
use crate::error::{IngestError, ValidationError};
use crate::models::{Measurement, Reading};
use crate::sensor::{decode_df5, decode_hex_payload};
use crate::state::AggregationState;
use crate::utils::{
    absolute_humidity, celsius_to_fahrenheit, dew_point, round_to, vapor_pressure_deficit,
};
use crate::validation::sanitize_device_key;

/// Build a reading from an incoming measurement, computing derived fields
///
/// The device key is canonicalised when possible; range and timestamp checks
/// are left to the aggregation state. A missing timestamp means "received at
/// `now`".
pub fn build_reading(
    measurement: Measurement,
    now: OffsetDateTime,
) -> Result<Reading, ValidationError> {
    let (temperature, humidity, battery) = match measurement.raw.as_deref() {
        Some(raw) => {
            let bytes = decode_hex_payload(raw)
                .ok_or_else(|| ValidationError::InvalidPayload("not a hex string".to_string()))?;
            let fields = decode_df5(&bytes).ok_or_else(|| {
                ValidationError::InvalidPayload("not a data format 5 payload".to_string())
            })?;
            (fields.temperature, fields.humidity, fields.battery)
        }
        None => (
            measurement
                .temperature
                .ok_or(ValidationError::MissingField("temperature"))?,
            measurement
                .humidity
                .ok_or(ValidationError::MissingField("humidity"))?,
            measurement
                .battery
                .ok_or(ValidationError::MissingField("battery"))?,
        ),
    };

    let device_key = sanitize_device_key(&measurement.device_key).unwrap_or(measurement.device_key);

    Ok(Reading {
        device_key,
        name: measurement.name.unwrap_or_default(),
        temperature,
        temperature_f: round_to(celsius_to_fahrenheit(temperature), 2),
        humidity,
        absolute_humidity: round_to(absolute_humidity(temperature, humidity), 2),
        dew_point: round_to(dew_point(temperature, humidity), 2),
        vapor_pressure_deficit: round_to(vapor_pressure_deficit(temperature, humidity), 3),
        battery,
        rssi: measurement.rssi,
        timestamp: measurement.timestamp.unwrap_or(now),
        client_id: measurement.client_id,
    })
}

/// Entry point for readings submitted by clients
pub struct Ingestor {
    state: Arc<AggregationState>,
    auth: Arc<RwLock<AuthConfig>>,
    device_names: HashMap<String, String>,
}

impl Ingestor {
    pub fn new(
        state: Arc<AggregationState>,
        auth: Arc<RwLock<AuthConfig>>,
        device_names: HashMap<String, String>,
    ) -> Self {
        Self {
            state,
            auth,
            device_names,
        }
    }

    /// Authorize, build and record one measurement
    ///
    /// Readings without a display name get the configured alias for their
    /// device, if any.
    pub fn submit(
        &self,
        api_key: Option<&str>,
        measurement: Measurement,
    ) -> Result<Reading, IngestError> {
        self.auth.read().authorize(api_key, &measurement.client_id)?;

        let mut reading = build_reading(measurement, OffsetDateTime::now_utc())?;
        if reading.name.is_empty() {
            if let Some(alias) = self.device_names.get(&reading.device_key) {
                reading.name = alias.clone();
            }
        }

        self.state.record(reading.clone())?;
        debug!(
            "Recorded reading from {} for {}: temp={:.2}°C, humidity={:.2}%",
            reading.client_id, reading.device_key, reading.temperature, reading.humidity
        );
        Ok(reading)
    }
}
