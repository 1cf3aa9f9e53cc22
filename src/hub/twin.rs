use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sensor::Reading;
use crate::util::types::DeviceId;

/// Patch pushed to the reported section of a device twin, also used as
/// the telemetry event payload.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportedPatch {
    pub current_temperature_c: f64,
    pub current_temperature_f: f64,
    pub connectivity: Connectivity,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    #[serde(rename = "WiFi")]
    WiFi,
}

impl From<&Reading> for ReportedPatch {
    fn from(reading: &Reading) -> Self {
        Self {
            current_temperature_c: reading.celsius,
            current_temperature_f: reading.fahrenheit,
            connectivity: Connectivity::default(),
        }
    }
}

/// A twin record as returned by the registry.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TwinRecord {
    pub device_id: DeviceId,

    #[serde(default)]
    pub tags: Value,

    #[serde(default)]
    pub properties: TwinProperties,

    /// Concurrency token for conditional updates.
    pub etag: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: Value,

    #[serde(default)]
    pub reported: Value,
}

/// A service-side twin update: tags plus desired properties.
#[derive(Serialize, Debug, Clone)]
pub struct TwinPatch {
    pub tags: Value,
    pub properties: TwinDesired,
}

#[derive(Serialize, Debug, Clone)]
pub struct TwinDesired {
    pub desired: Value,
}

impl TwinPatch {
    pub fn new(tags: Value, desired: Value) -> Self {
        Self {
            tags,
            properties: TwinDesired { desired },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reported_patch_wire_format() {
        let patch = ReportedPatch::from(&Reading {
            celsius: 23.625,
            fahrenheit: 74.525,
        });

        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            value,
            json!({
                "currentTemperatureC": 23.625,
                "currentTemperatureF": 74.525,
                "connectivity": "WiFi",
            })
        );
    }

    #[test]
    fn test_twin_record_decodes_registry_payload() {
        let twin: TwinRecord = serde_json::from_value(json!({
            "deviceId": "temp-sensor-1",
            "tags": {"location": {"plant": "Sofia"}},
            "properties": {
                "desired": {"maxTemperature": 30},
                "reported": {"connectivity": "WiFi"},
            },
            "etag": "AAAAAAAAAAE=",
        }))
        .unwrap();

        assert_eq!(*twin.device_id, "temp-sensor-1");
        assert_eq!(twin.etag, "AAAAAAAAAAE=");
        assert_eq!(twin.properties.desired["maxTemperature"], 30);
    }

    #[test]
    fn test_twin_patch_wire_format() {
        let patch = TwinPatch::new(
            json!({"location": {"region": "BG", "plant": "Sofia"}}),
            json!({"maxTemperature": 30}),
        );

        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            value,
            json!({
                "tags": {"location": {"region": "BG", "plant": "Sofia"}},
                "properties": {"desired": {"maxTemperature": 30}},
            })
        );
    }
}
