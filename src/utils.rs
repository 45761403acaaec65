/// Utility functions for derived quantities, statistics and formatting
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::models::{DeviceStats, MetricStats, Reading};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    dt.format(format_description!(
        "[day].[month].[year] - [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| dt.to_string())
}

/// `at - offset`, or None when that lies outside the representable range
pub fn checked_before(at: OffsetDateTime, offset: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(offset)
        .ok()
        .and_then(|offset| at.checked_sub(offset))
}

/// `at + offset`, or None when that lies outside the representable range
pub fn checked_after(at: OffsetDateTime, offset: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(offset)
        .ok()
        .and_then(|offset| at.checked_add(offset))
}

/// Round to a fixed number of decimal places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Saturation vapour pressure over water in hPa (Magnus formula)
fn saturation_vapor_pressure(celsius: f64) -> f64 {
    6.112 * (17.62 * celsius / (243.12 + celsius)).exp()
}

/// Absolute humidity in g/m³
pub fn absolute_humidity(celsius: f64, relative_humidity: f64) -> f64 {
    let vapor_pressure = saturation_vapor_pressure(celsius) * relative_humidity / 100.0;
    216.7 * vapor_pressure / (273.15 + celsius)
}

/// Dew point in °C
///
/// Humidity is floored at 0.01% because the Magnus inversion diverges at 0%.
pub fn dew_point(celsius: f64, relative_humidity: f64) -> f64 {
    let rh = relative_humidity.max(0.01);
    let gamma = (rh / 100.0).ln() + 17.62 * celsius / (243.12 + celsius);
    243.12 * gamma / (17.62 - gamma)
}

/// Vapour pressure deficit in kPa
pub fn vapor_pressure_deficit(celsius: f64, relative_humidity: f64) -> f64 {
    let saturation = saturation_vapor_pressure(celsius);
    (saturation - saturation * relative_humidity / 100.0) / 10.0
}

fn metric_stats(values: impl Iterator<Item = f64>) -> Option<MetricStats> {
    let mut count = 0usize;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;

    for value in values {
        count += 1;
        min = min.min(value);
        max = max.max(value);
        sum += value;
    }

    if count == 0 {
        return None;
    }

    Some(MetricStats {
        min,
        max,
        mean: round_to(sum / count as f64, 2),
    })
}

/// Calculate min/max/mean statistics over a device's recent readings
///
/// Returns None when there are no readings to summarise.
pub fn calculate_stats<'a, I>(device_key: &str, readings: I) -> Option<DeviceStats>
where
    I: IntoIterator<Item = &'a Reading>,
    I::IntoIter: Clone,
{
    let readings = readings.into_iter();
    let samples = readings.clone().count();
    if samples == 0 {
        return None;
    }

    let stats = |f: fn(&Reading) -> f64| metric_stats(readings.clone().map(f));

    Some(DeviceStats {
        device_key: device_key.to_string(),
        samples,
        temperature: stats(|r| r.temperature)?,
        humidity: stats(|r| r.humidity)?,
        absolute_humidity: stats(|r| r.absolute_humidity)?,
        dew_point: stats(|r| r.dew_point)?,
        vapor_pressure_deficit: stats(|r| r.vapor_pressure_deficit)?,
        battery: stats(|r| r.battery)?,
        rssi: stats(|r| f64::from(r.rssi))?,
    })
}
