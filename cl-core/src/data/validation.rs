//! Validation of user supplied settings against device capabilities
//!
//! Everything here runs synchronously before a controller is touched, so a
//! rejected request leaves the active setting exactly as it was.

use cl_error::ValidationError;

use crate::constants::hysteresis;
use crate::data::{Device, LightingSetting, Setting, SettingRequest, SpeedOptions};
use crate::engine::DutyProfile;

/// Validate a fixed duty against channel bounds
pub fn validate_fixed_duty(duty: i32, options: &SpeedOptions) -> Result<u8, ValidationError> {
    if !options.contains(duty) {
        return Err(ValidationError::DutyOutOfRange {
            duty,
            min: options.min_duty,
            max: options.max_duty,
        });
    }
    Ok(duty as u8)
}

/// Validate a hysteresis threshold in percent
pub fn validate_hysteresis(pct: u8) -> Result<u8, ValidationError> {
    if pct > hysteresis::MAX_THRESHOLD_PCT {
        return Err(ValidationError::Unsupported {
            channel: "*".to_string(),
            what: format!("hysteresis above {}%", hysteresis::MAX_THRESHOLD_PCT),
        });
    }
    Ok(pct)
}

/// Turn a raw request into a validated `Setting` for `device`/`channel`
///
/// Checks channel existence and capabilities, fixed duty bounds, curve shape,
/// the device's profile length limit and its accepted temperature range.
/// Whether an external temperature source is acceptable is decided by the
/// caller, which knows the source device.
pub fn validate_setting_request(
    request: &SettingRequest,
    device: &Device,
    channel: &str,
) -> Result<Setting, ValidationError> {
    let options = device.speed_options(channel)?;
    match request {
        SettingRequest::None => Ok(Setting::None),
        SettingRequest::Fixed { duty } => {
            if !options.fixed_enabled {
                return Err(ValidationError::Unsupported {
                    channel: channel.to_string(),
                    what: "fixed duty".to_string(),
                });
            }
            let duty = validate_fixed_duty(*duty, options)?;
            Ok(Setting::Fixed { duty })
        }
        SettingRequest::Profile {
            temps,
            duties,
            temp_source,
        } => {
            if !options.profiles_enabled {
                return Err(ValidationError::Unsupported {
                    channel: channel.to_string(),
                    what: "duty profiles".to_string(),
                });
            }
            let profile = DutyProfile::build(temps, duties, device.profile_max_length())?;
            // Device limits only apply to curves the device evaluates on its own sensor
            if temp_source.device_id == device.id {
                profile.check_temp_range(device.info.temp_min, device.info.temp_max)?;
            }
            Ok(Setting::Profile {
                profile,
                temp_source: temp_source.clone(),
            })
        }
    }
}

/// Validate a lighting setting against the channel's modes
pub fn validate_lighting(
    setting: &LightingSetting,
    device: &Device,
    channel: &str,
) -> Result<(), ValidationError> {
    let info = device.channel(channel)?;
    let mode = info
        .lighting_modes
        .iter()
        .find(|m| m.name == setting.mode)
        .ok_or_else(|| {
            ValidationError::InvalidLighting(format!(
                "mode '{}' not available on {}",
                setting.mode, channel
            ))
        })?;

    let colors = setting.colors.len();
    if colors < mode.min_colors as usize || colors > mode.max_colors as usize {
        return Err(ValidationError::InvalidLighting(format!(
            "mode '{}' takes {}-{} colors, got {}",
            mode.name, mode.min_colors, mode.max_colors, colors
        )));
    }
    if let Some(speed) = &setting.speed {
        if !mode.speed_enabled {
            return Err(ValidationError::InvalidLighting(format!(
                "mode '{}' has no speed setting",
                mode.name
            )));
        }
        if !device.info.lighting_speeds.iter().any(|s| s == speed) {
            return Err(ValidationError::InvalidLighting(format!(
                "unknown lighting speed '{}'",
                speed
            )));
        }
    }
    if setting.backwards && !mode.backward_enabled {
        return Err(ValidationError::InvalidLighting(format!(
            "mode '{}' cannot run backwards",
            mode.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ChannelInfo, DeviceId, DeviceInfo, DeviceKind, LightingMode, TempSourceRef};

    fn kraken() -> Device {
        let mut info = DeviceInfo {
            temp_min: Some(20.0),
            temp_max: Some(60.0),
            profile_max_length: 9,
            temp_ext_available: true,
            lighting_speeds: vec!["slow".into(), "normal".into()],
            ..DeviceInfo::default()
        };
        info.channels.insert(
            "pump".into(),
            ChannelInfo::speed(SpeedOptions {
                min_duty: 20,
                max_duty: 100,
                ..SpeedOptions::default()
            }),
        );
        info.channels.insert(
            "ring".into(),
            ChannelInfo::lighting(vec![LightingMode {
                name: "fading".into(),
                frontend_name: "Fading".into(),
                min_colors: 2,
                max_colors: 8,
                speed_enabled: true,
                backward_enabled: false,
            }]),
        );
        Device::new(DeviceId(1), DeviceKind::DriverManaged, "Kraken", info)
    }

    #[test]
    fn test_fixed_duty_bounds() {
        let device = kraken();
        let ok = validate_setting_request(&SettingRequest::Fixed { duty: 60 }, &device, "pump");
        assert_eq!(ok, Ok(Setting::Fixed { duty: 60 }));

        let low = validate_setting_request(&SettingRequest::Fixed { duty: 10 }, &device, "pump");
        assert_eq!(
            low,
            Err(ValidationError::DutyOutOfRange { duty: 10, min: 20, max: 100 })
        );
    }

    #[test]
    fn test_profile_respects_device_temp_range() {
        let device = kraken();
        let own = SettingRequest::Profile {
            temps: vec![20.0, 70.0],
            duties: vec![30, 100],
            temp_source: TempSourceRef::new(DeviceId(1), "liquid"),
        };
        assert!(matches!(
            validate_setting_request(&own, &device, "pump"),
            Err(ValidationError::TemperatureOutOfRange { .. })
        ));

        let external = SettingRequest::Profile {
            temps: vec![20.0, 70.0],
            duties: vec![30, 100],
            temp_source: TempSourceRef::new(DeviceId(9), "CPU"),
        };
        assert!(validate_setting_request(&external, &device, "pump").is_ok());
    }

    #[test]
    fn test_request_on_lighting_channel_is_rejected() {
        let device = kraken();
        let result = validate_setting_request(&SettingRequest::Fixed { duty: 50 }, &device, "ring");
        assert!(matches!(result, Err(ValidationError::Unsupported { .. })));
    }

    #[test]
    fn test_lighting_validation() {
        let device = kraken();
        let mut setting = LightingSetting {
            mode: "fading".into(),
            speed: Some("slow".into()),
            backwards: false,
            colors: vec![[255, 0, 0], [0, 0, 255]],
        };
        assert!(validate_lighting(&setting, &device, "ring").is_ok());

        setting.colors.truncate(1);
        assert!(validate_lighting(&setting, &device, "ring").is_err());

        setting.colors.push([0, 255, 0]);
        setting.backwards = true;
        assert!(validate_lighting(&setting, &device, "ring").is_err());

        setting.backwards = false;
        setting.speed = Some("ludicrous".into());
        assert!(validate_lighting(&setting, &device, "ring").is_err());

        setting.mode = "spectrum-wave".into();
        assert!(validate_lighting(&setting, &device, "ring").is_err());
    }

    #[test]
    fn test_hysteresis_limit() {
        assert_eq!(validate_hysteresis(3), Ok(3));
        assert!(validate_hysteresis(51).is_err());
    }
}
