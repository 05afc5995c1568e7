//! Sensor telemetry types.
//!
//! A `SensorReading` is produced by a field device (or the simulator) and is
//! never patched after construction. Consumers replace the whole reading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Well-known measurement keys used for query enrichment
pub const SOIL_MOISTURE: &str = "soil_moisture";
pub const SOIL_TEMPERATURE: &str = "soil_temperature";

/// One telemetry sample from a field device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(default)]
    pub id: String,
    pub device_id: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    #[serde(default)]
    pub measurements: HashMap<String, Measurement>,
    #[serde(default)]
    pub device_status: DeviceStatus,
}

impl SensorReading {
    /// Field the reading belongs to
    pub fn field_id(&self) -> &str {
        &self.location.field_id
    }

    /// Look up a measurement by its free-form key
    pub fn measurement(&self, key: &str) -> Option<&Measurement> {
        self.measurements.get(key)
    }

    /// Device class derived from the device id prefix (`soil_01` -> `soil`)
    pub fn device_type(&self) -> &str {
        self.device_id
            .split(['_', '-'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    pub field_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: MeasurementValue,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

/// Measurement payloads are either scalar or free text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementValue::Flag(b) => write!(f, "{}", b),
            MeasurementValue::Number(n) => write!(f, "{}", n),
            MeasurementValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for MeasurementValue {
    fn from(value: f64) -> Self {
        MeasurementValue::Number(value)
    }
}

impl From<&str> for MeasurementValue {
    fn from(value: &str) -> Self {
        MeasurementValue::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(default)]
    pub battery_level: i32,
    #[serde(default)]
    pub signal_strength: i32,
    #[serde(default, rename = "last_calibration")]
    pub last_calibration_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_device_payload() {
        let raw = r#"{
            "id": "reading_001",
            "device_id": "soil_07",
            "timestamp": "2025-06-01T08:00:00Z",
            "location": {"latitude": 40.71, "longitude": -74.0, "field_id": "field_001", "crop_type": "potato"},
            "measurements": {
                "soil_moisture": {"value": 45.5, "unit": "%", "quality": "good"},
                "status": {"value": "ok", "unit": ""}
            },
            "device_status": {"battery_level": 85, "signal_strength": -65, "last_calibration": "2025-05-31T08:00:00Z"}
        }"#;

        let reading: SensorReading = serde_json::from_str(raw).unwrap();
        assert_eq!(reading.field_id(), "field_001");
        assert_eq!(reading.device_type(), "soil");
        assert_eq!(reading.location.crop_type.as_deref(), Some("potato"));
        assert_eq!(
            reading.measurement(SOIL_MOISTURE).unwrap().value,
            MeasurementValue::Number(45.5)
        );
        assert_eq!(
            reading.measurement("status").unwrap().value,
            MeasurementValue::Text("ok".to_string())
        );
        assert_eq!(reading.device_status.signal_strength, -65);
    }

    #[test]
    fn test_minimal_payload_uses_defaults() {
        let raw = r#"{"device_id": "device_test", "location": {"field_id": "field_001"}}"#;
        let reading: SensorReading = serde_json::from_str(raw).unwrap();
        assert!(reading.measurements.is_empty());
        assert_eq!(reading.device_status.battery_level, 0);
        assert!(reading.location.crop_type.is_none());
    }

    #[test]
    fn test_missing_location_is_rejected() {
        let raw = r#"{"device_id": "device_test"}"#;
        assert!(serde_json::from_str::<SensorReading>(raw).is_err());
    }

    #[test]
    fn test_measurement_value_display() {
        assert_eq!(MeasurementValue::Number(20.0).to_string(), "20");
        assert_eq!(MeasurementValue::Number(22.3).to_string(), "22.3");
        assert_eq!(MeasurementValue::Text("dry".into()).to_string(), "dry");
        assert_eq!(MeasurementValue::Flag(true).to_string(), "true");
    }
}
