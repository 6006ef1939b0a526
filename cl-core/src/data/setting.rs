//! Channel settings
//!
//! `SettingRequest` is what a UI hands over (raw, unvalidated numbers);
//! `Setting` is what a channel controller actually runs.

use serde::{Deserialize, Serialize};

use crate::data::DeviceId;
use crate::engine::DutyProfile;

/// Where a profile reads its temperature from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempSourceRef {
    pub device_id: DeviceId,
    /// Temperature name as it appears in the device's status samples
    pub sensor: String,
}

impl TempSourceRef {
    pub fn new(device_id: DeviceId, sensor: impl Into<String>) -> Self {
        Self {
            device_id,
            sensor: sensor.into(),
        }
    }
}

/// The active policy of one channel
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Setting {
    #[default]
    None,
    Fixed {
        duty: u8,
    },
    Profile {
        profile: DutyProfile,
        temp_source: TempSourceRef,
    },
}

impl Setting {
    pub fn is_none(&self) -> bool {
        matches!(self, Setting::None)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Setting::None => "none",
            Setting::Fixed { .. } => "fixed",
            Setting::Profile { .. } => "profile",
        }
    }
}

/// Unvalidated speed setting as submitted by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettingRequest {
    /// Remove any setting (devices that support it return to firmware control)
    None,
    Fixed {
        duty: i32,
    },
    Profile {
        temps: Vec<f64>,
        duties: Vec<i32>,
        temp_source: TempSourceRef,
    },
}

/// RGB lighting setting for a lighting channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightingSetting {
    pub mode: String,
    #[serde(default)]
    pub speed: Option<String>,
    #[serde(default)]
    pub backwards: bool,
    #[serde(default)]
    pub colors: Vec<[u8; 3]>,
}

/// What a dispatcher writes to a channel
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchValue {
    /// Fixed duty in percent
    Duty(u8),
    /// Curve evaluated by the device firmware itself
    Profile {
        points: Vec<(f64, u8)>,
        temp_sensor: String,
    },
    Lighting(LightingSetting),
    /// Hand the channel back to firmware/automatic control
    Default,
}

impl DispatchValue {
    pub fn describe(&self) -> String {
        match self {
            DispatchValue::Duty(d) => format!("{}%", d),
            DispatchValue::Profile { points, .. } => format!("profile ({} points)", points.len()),
            DispatchValue::Lighting(l) => format!("lighting mode {}", l.mode),
            DispatchValue::Default => "default".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_json_shape() {
        let fixed = Setting::Fixed { duty: 60 };
        let json = serde_json::to_string(&fixed).unwrap();
        assert_eq!(json, r#"{"type":"fixed","duty":60}"#);

        let profile = Setting::Profile {
            profile: DutyProfile::build(&[30.0, 60.0], &[20, 80], 9).unwrap(),
            temp_source: TempSourceRef::new(DeviceId(2), "liquid"),
        };
        let back: Setting = serde_json::from_str(&serde_json::to_string(&profile).unwrap()).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_setting_request_from_json() {
        let req: SettingRequest = serde_json::from_str(
            r#"{"type":"profile","temps":[30.0,50.0],"duties":[20,60],"temp_source":{"device_id":1,"sensor":"CPU"}}"#,
        )
        .unwrap();
        assert!(matches!(req, SettingRequest::Profile { ref temps, .. } if temps.len() == 2));
    }

    #[test]
    fn test_dispatch_value_describe() {
        assert_eq!(DispatchValue::Duty(42).describe(), "42%");
        assert_eq!(DispatchValue::Default.describe(), "default");
    }
}
