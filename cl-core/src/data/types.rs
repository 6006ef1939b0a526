//! Core data types for Coolant
//!
//! Devices, their channels and capability descriptors, and the status samples
//! produced on every poll tick.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cl_error::ValidationError;

use crate::constants::{duty, profile};

/// Stable identity of a device, assigned by the device repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Device family
///
/// Family specific behaviour hangs off these methods so callers never have to
/// inspect driver types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Driver library devices (liquid coolers, fan hubs)
    DriverManaged,
    /// Kernel hwmon chips
    Hwmon,
    /// Virtual device aggregating readings of other devices
    VirtualAggregate,
}

impl DeviceKind {
    /// Clearing a setting hands the channel back to firmware control
    pub fn resets_to_default(&self) -> bool {
        matches!(self, DeviceKind::Hwmon)
    }

    /// Device can be reinitialized by its driver
    pub fn supports_reinitialize(&self) -> bool {
        matches!(self, DeviceKind::DriverManaged)
    }

    /// Device only exists in software
    pub fn is_virtual(&self) -> bool {
        matches!(self, DeviceKind::VirtualAggregate)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::DriverManaged => "driver",
            DeviceKind::Hwmon => "hwmon",
            DeviceKind::VirtualAggregate => "composite",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Speed capabilities of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedOptions {
    pub min_duty: u8,
    pub max_duty: u8,
    /// Fixed duty supported
    pub fixed_enabled: bool,
    /// Duty profiles supported
    pub profiles_enabled: bool,
    /// The device cannot evaluate profiles itself; we have to
    pub manual_profiles_enabled: bool,
    /// A temperature from another device may drive this channel
    pub external_temp_enabled: bool,
}

impl Default for SpeedOptions {
    fn default() -> Self {
        Self {
            min_duty: duty::MIN_PERCENT,
            max_duty: duty::MAX_PERCENT,
            fixed_enabled: true,
            profiles_enabled: true,
            manual_profiles_enabled: false,
            external_temp_enabled: false,
        }
    }
}

impl SpeedOptions {
    /// Whether a duty lies within [min_duty, max_duty]
    pub fn contains(&self, duty: i32) -> bool {
        duty >= self.min_duty as i32 && duty <= self.max_duty as i32
    }
}

/// A lighting mode a channel accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightingMode {
    pub name: String,
    pub frontend_name: String,
    pub min_colors: u8,
    pub max_colors: u8,
    pub speed_enabled: bool,
    pub backward_enabled: bool,
}

/// Channel capability descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub speed_options: Option<SpeedOptions>,
    #[serde(default)]
    pub lighting_modes: Vec<LightingMode>,
}

impl ChannelInfo {
    pub fn speed(options: SpeedOptions) -> Self {
        Self {
            speed_options: Some(options),
            lighting_modes: Vec::new(),
        }
    }

    pub fn lighting(modes: Vec<LightingMode>) -> Self {
        Self {
            speed_options: None,
            lighting_modes: modes,
        }
    }
}

/// Capabilities established at discovery time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub channels: BTreeMap<String, ChannelInfo>,
    #[serde(default)]
    pub lighting_speeds: Vec<String>,
    /// Lowest profile temperature the device accepts
    #[serde(default)]
    pub temp_min: Option<f64>,
    /// Highest profile temperature the device accepts
    #[serde(default)]
    pub temp_max: Option<f64>,
    #[serde(default = "default_profile_max_length")]
    pub profile_max_length: usize,
    /// Device temperatures may drive channels on other devices
    #[serde(default)]
    pub temp_ext_available: bool,
    /// Readings fluctuate enough that profiles and graphs smooth them
    ///
    /// Off for hwmon chips and driver devices, which report settled values.
    #[serde(default)]
    pub smoothed: bool,
}

fn default_profile_max_length() -> usize {
    profile::DEFAULT_MAX_LENGTH
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
            lighting_speeds: Vec::new(),
            temp_min: None,
            temp_max: None,
            profile_max_length: profile::DEFAULT_MAX_LENGTH,
            temp_ext_available: false,
            smoothed: false,
        }
    }
}

/// A controllable (or purely monitored) device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub name: String,
    pub info: DeviceInfo,
}

impl Device {
    pub fn new(id: DeviceId, kind: DeviceKind, name: impl Into<String>, info: DeviceInfo) -> Self {
        Self {
            id,
            kind,
            name: name.into(),
            info,
        }
    }

    pub fn channel(&self, name: &str) -> Result<&ChannelInfo, ValidationError> {
        self.info
            .channels
            .get(name)
            .ok_or_else(|| ValidationError::UnknownChannel {
                device: self.id.to_string(),
                channel: name.to_string(),
            })
    }

    /// Speed options of a channel, rejecting lighting-only channels
    pub fn speed_options(&self, channel: &str) -> Result<&SpeedOptions, ValidationError> {
        self.channel(channel)?
            .speed_options
            .as_ref()
            .ok_or_else(|| ValidationError::Unsupported {
                channel: channel.to_string(),
                what: "speed control".to_string(),
            })
    }

    /// Effective profile length limit, never above the hard cap
    pub fn profile_max_length(&self) -> usize {
        self.info.profile_max_length.clamp(1, profile::HARD_MAX_LENGTH)
    }
}

/// One temperature reading of a status sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempReading {
    pub name: String,
    pub value: f64,
}

/// One channel reading of a status sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReading {
    pub name: String,
    pub rpm: Option<u32>,
    pub duty: Option<f64>,
}

/// Status of a device at one poll tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub temps: Vec<TempReading>,
    pub channels: Vec<ChannelReading>,
}

impl Status {
    pub fn new(device_id: DeviceId, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id,
            timestamp,
            temps: Vec::new(),
            channels: Vec::new(),
        }
    }

    pub fn with_temp(mut self, name: impl Into<String>, value: f64) -> Self {
        self.temps.push(TempReading {
            name: name.into(),
            value,
        });
        self
    }

    pub fn with_channel(mut self, name: impl Into<String>, rpm: Option<u32>, duty: Option<f64>) -> Self {
        self.channels.push(ChannelReading {
            name: name.into(),
            rpm,
            duty,
        });
        self
    }

    /// Temperature by sensor name
    pub fn temp(&self, name: &str) -> Option<f64> {
        self.temps.iter().find(|t| t.name == name).map(|t| t.value)
    }

    /// Duty by channel name
    pub fn duty(&self, channel: &str) -> Option<f64> {
        self.channels
            .iter()
            .find(|c| c.name == channel)
            .and_then(|c| c.duty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Device {
        let mut info = DeviceInfo::default();
        info.channels.insert(
            "pump".to_string(),
            ChannelInfo::speed(SpeedOptions {
                min_duty: 20,
                max_duty: 100,
                ..SpeedOptions::default()
            }),
        );
        info.channels.insert("ring".to_string(), ChannelInfo::lighting(Vec::new()));
        Device::new(DeviceId(1), DeviceKind::DriverManaged, "Kraken X63 (experimental)", info)
    }

    #[test]
    fn test_speed_options_bounds() {
        let device = test_device();
        let opts = device.speed_options("pump").unwrap();
        assert!(opts.contains(20));
        assert!(!opts.contains(19));
    }

    #[test]
    fn test_lighting_channel_has_no_speed() {
        let device = test_device();
        assert!(matches!(
            device.speed_options("ring"),
            Err(ValidationError::Unsupported { .. })
        ));
        assert!(matches!(
            device.speed_options("fan"),
            Err(ValidationError::UnknownChannel { .. })
        ));
    }

    #[test]
    fn test_status_lookup() {
        let status = Status::new(DeviceId(1), Utc::now())
            .with_temp("liquid", 31.5)
            .with_channel("pump", Some(2100), Some(60.0))
            .with_channel("fan", Some(900), None);
        assert_eq!(status.temp("liquid"), Some(31.5));
        assert_eq!(status.temp("cpu"), None);
        assert_eq!(status.duty("pump"), Some(60.0));
        assert_eq!(status.duty("fan"), None);
    }

    #[test]
    fn test_kind_behaviour() {
        assert!(!DeviceInfo::default().smoothed);
        assert!(DeviceKind::Hwmon.resets_to_default());
        assert!(DeviceKind::VirtualAggregate.is_virtual());
    }
}
