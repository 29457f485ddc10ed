// Device domain model
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    On,
    Off,
}

impl DeviceStatus {
    /// Derives the status from the latest reading. Power above `threshold_watts` means ON.
    pub fn from_power(power_watts: f64, threshold_watts: f64) -> Self {
        if power_watts > threshold_watts {
            DeviceStatus::On
        } else {
            DeviceStatus::Off
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub status: DeviceStatus,
}

impl Device {
    pub fn new(device_id: String) -> Self {
        Self {
            device_id,
            status: DeviceStatus::Off,
        }
    }
}
