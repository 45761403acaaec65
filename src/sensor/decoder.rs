/// RuuviTag manufacturer data decoding
use log::warn;

// RuuviTag protocol constants
const DATA_FORMAT: u8 = 5; // RuuviTag data format version 5
const PAYLOAD_LEN: usize = 24;
const BATTERY_EMPTY_MV: f64 = 2000.0;
const BATTERY_FULL_MV: f64 = 3000.0;

/// Physical quantities carried in one advertisement
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFields {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub battery_mv: u16,
    pub battery: f64,
    pub tx_power: i8,
    pub movement_counter: u8,
    pub sequence: u16,
}

/// Decode RuuviTag manufacturer data format 5 into structured data
///
/// RuuviTag data format 5 uses a 24-byte payload with the following structure:
/// - Byte 0: Data format (5)
/// - Bytes 1-2: Temperature (signed 16-bit, 0.005°C resolution)
/// - Bytes 3-4: Humidity (unsigned 16-bit, 0.0025% resolution)
/// - Bytes 5-6: Pressure (unsigned 16-bit, +50000 Pa offset, 1 Pa resolution)
/// - Bytes 7-12: Acceleration X/Y/Z (not used here)
/// - Bytes 13-14: Battery voltage (11 bits, +1600 mV) + TX power (5 bits, 2 dBm steps from -40)
/// - Byte 15: Movement counter
/// - Bytes 16-17: Measurement sequence number
/// - Bytes 18-23: MAC address (not used here, the device key comes with the reading)
///
/// Battery voltage is mapped linearly onto 0-100% between 2.0 V and 3.0 V.
///
/// # Returns
/// Some(SensorFields) if decoding succeeds, None if data is invalid
pub fn decode_df5(data: &[u8]) -> Option<SensorFields> {
    if data.len() != PAYLOAD_LEN || data[0] != DATA_FORMAT {
        if let Some(format) = data.first() {
            warn!(
                "Invalid RuuviTag data: len={}, format={}",
                data.len(),
                format
            );
        }
        return None;
    }

    // Decode temperature: signed 16-bit integer * 0.005°C
    let temperature = f64::from(i16::from_be_bytes([data[1], data[2]])) * 0.005;

    // Decode humidity: unsigned 16-bit integer * 0.0025%, capped at 100%
    let humidity = (f64::from(u16::from_be_bytes([data[3], data[4]])) * 0.0025).min(100.0);

    // Decode pressure: unsigned 16-bit integer + 50000 Pa, convert to hPa
    let pressure = (f64::from(u16::from_be_bytes([data[5], data[6]])) + 50000.0) / 100.0;

    let power_info = u16::from_be_bytes([data[13], data[14]]);
    let battery_mv = (power_info >> 5) + 1600;
    let tx_power = (power_info & 0x1f) as i8 * 2 - 40;
    let battery = ((f64::from(battery_mv) - BATTERY_EMPTY_MV)
        / (BATTERY_FULL_MV - BATTERY_EMPTY_MV)
        * 100.0)
        .clamp(0.0, 100.0);

    Some(SensorFields {
        temperature: (temperature * 100.0).round() / 100.0,
        humidity: (humidity * 100.0).round() / 100.0,
        pressure: (pressure * 100.0).round() / 100.0,
        battery_mv,
        battery: battery.round(),
        tx_power,
        movement_counter: data[15],
        sequence: u16::from_be_bytes([data[16], data[17]]),
    })
}

/// Decode a hex encoded payload (as relayed by gateways) into bytes
pub fn decode_hex_payload(hex: &str) -> Option<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Official format 5 test vector from the Ruuvi sensor protocol docs
    const VALID_VECTOR: &str = "0512FC5394C37C0004FFFC040CAC364200CDCBB8334C884F";

    #[test]
    fn test_decode_valid_vector() {
        let bytes = decode_hex_payload(VALID_VECTOR).unwrap();
        let fields = decode_df5(&bytes).unwrap();

        assert_eq!(fields.temperature, 24.3);
        assert_eq!(fields.humidity, 53.49);
        assert_eq!(fields.pressure, 1000.44);
        assert_eq!(fields.battery_mv, 2977);
        assert_eq!(fields.tx_power, 4);
        assert_eq!(fields.movement_counter, 66);
        assert_eq!(fields.sequence, 205);
        assert_eq!(fields.battery, 98.0);
    }

    #[test]
    fn test_decode_rejects_wrong_format_and_length() {
        let mut bytes = decode_hex_payload(VALID_VECTOR).unwrap();
        bytes[0] = 3;
        assert!(decode_df5(&bytes).is_none());
        assert!(decode_df5(&bytes[..10]).is_none());
        assert!(decode_df5(&[]).is_none());
    }

    #[test]
    fn test_decode_hex_payload() {
        assert_eq!(decode_hex_payload("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert!(decode_hex_payload("abc").is_none());
        assert!(decode_hex_payload("zz").is_none());
    }
}
