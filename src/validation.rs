/// Ingestion-time validation of readings
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::ValidationError;
use crate::models::Reading;
use crate::utils::{checked_after, checked_before};

/// Length of a canonical device key: six MAC octets as lowercase hex
pub const DEVICE_KEY_LEN: usize = 12;
pub const MAX_NAME_LEN: usize = 64;
pub const MAX_CLIENT_ID_LEN: usize = 64;

/// Bounds applied to every reading before it reaches the aggregation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationLimits {
    /// Readings older than this relative to now are rejected
    pub max_age: Duration,
    /// Readings dated further than this into the future are rejected
    pub max_future_skew: Duration,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            max_future_skew: Duration::from_secs(300),
        }
    }
}

/// Normalize a device key to its canonical form.
///
/// Colons are stripped and hex digits lowercased. Anything that is not then
/// exactly twelve hex digits is rejected, since the result becomes part of a
/// file name.
pub fn sanitize_device_key(raw: &str) -> Option<String> {
    let key: String = raw
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if key.len() == DEVICE_KEY_LEN && key.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(key)
    } else {
        None
    }
}

/// True when the key is already in canonical form
pub fn is_canonical_device_key(key: &str) -> bool {
    sanitize_device_key(key).as_deref() == Some(key)
}

/// Check a reading against the physical ranges, string limits and the
/// accepted timestamp window around `now`.
pub fn validate_reading(
    reading: &Reading,
    now: OffsetDateTime,
    limits: &ValidationLimits,
) -> Result<(), ValidationError> {
    if !is_canonical_device_key(&reading.device_key) {
        return Err(ValidationError::InvalidDeviceKey(reading.device_key.clone()));
    }
    if reading.client_id.is_empty() {
        return Err(ValidationError::MissingField("client_id"));
    }
    if reading.client_id.chars().count() > MAX_CLIENT_ID_LEN {
        return Err(ValidationError::FieldTooLong {
            field: "client_id",
            max: MAX_CLIENT_ID_LEN,
        });
    }
    if reading.name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::FieldTooLong {
            field: "name",
            max: MAX_NAME_LEN,
        });
    }

    // NaN fails every range check below
    if !(-50.0..=100.0).contains(&reading.temperature) {
        return Err(ValidationError::TemperatureOutOfRange(reading.temperature));
    }
    if !(0.0..=100.0).contains(&reading.humidity) {
        return Err(ValidationError::HumidityOutOfRange(reading.humidity));
    }
    if !(0.0..=100.0).contains(&reading.battery) {
        return Err(ValidationError::BatteryOutOfRange(reading.battery));
    }

    // A bound beyond the representable range never rejects anything
    if let Some(oldest) = checked_before(now, limits.max_age) {
        if reading.timestamp < oldest {
            return Err(ValidationError::StaleTimestamp(reading.timestamp.to_string()));
        }
    }
    if let Some(latest) = checked_after(now, limits.max_future_skew) {
        if reading.timestamp > latest {
            return Err(ValidationError::FutureTimestamp(reading.timestamp.to_string()));
        }
    }

    Ok(())
}
