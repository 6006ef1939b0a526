//! Application Settings
//!
//! Persistent settings stored as JSON in ~/.config/coolant/settings.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use cl_error::{CoolantError, Result};

use crate::constants::{hysteresis, paths, smoothing, timing};
use crate::data::{DeviceId, Setting};
use crate::history::HistoryConfig;

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    /// General settings
    #[serde(default)]
    pub general: GeneralSettings,

    /// Settings applied to channels, restored on startup
    #[serde(default)]
    pub applied: Vec<AppliedSetting>,
}

/// General daemon settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Status polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Smooth fluctuating sensor families
    #[serde(default = "default_true")]
    pub smoothing_enabled: bool,

    /// Moving average window (samples)
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,

    /// How long status samples are kept
    #[serde(default = "default_history_retention")]
    pub history_retention_secs: u64,

    /// Live window of the recent history
    #[serde(default = "default_recent_window")]
    pub recent_window_secs: u64,

    /// Minimum duty change before a profile tick writes again
    #[serde(default = "default_hysteresis")]
    pub default_hysteresis_pct: u8,
}

fn default_poll_interval() -> u64 { timing::POLL_INTERVAL_MS }
fn default_true() -> bool { true }
fn default_smoothing_window() -> usize { smoothing::DEFAULT_WINDOW }
fn default_history_retention() -> u64 { timing::HISTORY_RETENTION.as_secs() }
fn default_recent_window() -> u64 { timing::RECENT_WINDOW.as_secs() }
fn default_hysteresis() -> u8 { hysteresis::DEFAULT_THRESHOLD_PCT }

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            smoothing_enabled: true,
            smoothing_window: default_smoothing_window(),
            history_retention_secs: default_history_retention(),
            recent_window_secs: default_recent_window(),
            default_hysteresis_pct: default_hysteresis(),
        }
    }
}

impl GeneralSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            retention: Duration::from_secs(self.history_retention_secs),
            recent_window: Duration::from_secs(self.recent_window_secs),
            smoothing_enabled: self.smoothing_enabled,
            smoothing_window: self.smoothing_window,
        }
    }
}

/// A channel setting as it was last applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedSetting {
    pub device_id: DeviceId,
    pub channel: String,
    pub setting: Setting,
}

impl AppSettings {
    /// Record `setting` for a channel, replacing what was there
    ///
    /// `Setting::None` removes the entry.
    pub fn record_applied(&mut self, device_id: DeviceId, channel: &str, setting: &Setting) {
        self.applied
            .retain(|a| !(a.device_id == device_id && a.channel == channel));
        if !setting.is_none() {
            self.applied.push(AppliedSetting {
                device_id,
                channel: channel.to_string(),
                setting: setting.clone(),
            });
        }
    }

    pub fn applied_for(&self, device_id: DeviceId, channel: &str) -> Option<&Setting> {
        self.applied
            .iter()
            .find(|a| a.device_id == device_id && a.channel == channel)
            .map(|a| &a.setting)
    }
}

/// Bounds check loaded settings
pub fn validate_settings(settings: &AppSettings) -> Result<()> {
    let general = &settings.general;
    if general.poll_interval_ms < timing::MIN_POLL_INTERVAL_MS
        || general.poll_interval_ms > timing::MAX_POLL_INTERVAL_MS
    {
        return Err(CoolantError::invalid_config(
            "poll_interval_ms",
            format!(
                "must be {}-{}",
                timing::MIN_POLL_INTERVAL_MS,
                timing::MAX_POLL_INTERVAL_MS
            ),
        ));
    }
    if general.smoothing_window > smoothing::MAX_WINDOW {
        return Err(CoolantError::invalid_config(
            "smoothing_window",
            format!("must be at most {}", smoothing::MAX_WINDOW),
        ));
    }
    if general.recent_window_secs == 0 || general.recent_window_secs > general.history_retention_secs {
        return Err(CoolantError::invalid_config(
            "recent_window_secs",
            "must be non-zero and not exceed history_retention_secs",
        ));
    }
    if general.default_hysteresis_pct > hysteresis::MAX_THRESHOLD_PCT {
        return Err(CoolantError::invalid_config(
            "default_hysteresis_pct",
            format!("must be at most {}", hysteresis::MAX_THRESHOLD_PCT),
        ));
    }
    Ok(())
}

/// Get the settings file path
/// Linux/BSD: ~/.config/coolant/settings.json, or $COOLANT_CONFIG_DIR/settings.json
pub fn get_settings_path() -> Result<PathBuf> {
    let dir = paths::config_dir()
        .ok_or_else(|| CoolantError::config("Could not determine config directory"))?;
    Ok(dir.join(paths::SETTINGS_FILE))
}

/// Load settings from the default location
pub fn load_settings() -> Result<AppSettings> {
    load_settings_from(&get_settings_path()?)
}

/// Save settings to the default location
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    save_settings_to(&get_settings_path()?, settings)
}

/// Load settings from a JSON file
///
/// A missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<AppSettings> {
    if !path.exists() {
        info!("No settings at {}, using defaults", path.display());
        return Ok(AppSettings::default());
    }

    let content = fs::read_to_string(path).map_err(|e| CoolantError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let settings: AppSettings = serde_json::from_str(&content)
        .map_err(|e| CoolantError::config(format!("Failed to parse settings JSON: {}", e)))?;

    validate_settings(&settings)?;
    Ok(settings)
}

/// Save settings to a JSON file
/// Uses atomic write (temp file + rename) so a crash never leaves half a file
pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                CoolantError::config(format!("Failed to create config directory: {}", e))
            })?;
        }
    }

    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| CoolantError::config(format!("Failed to serialize settings: {}", e)))?;

    let temp_path = path.with_extension("json.tmp");
    let write_err = |e: std::io::Error| CoolantError::FileWrite {
        path: temp_path.clone(),
        source: e,
    };

    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    file.write_all(json.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o644)).map_err(write_err)?;
    }

    fs::rename(&temp_path, path).map_err(|e| CoolantError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!("Saved settings to {}", path.display());
    Ok(())
}

/// Load, modify and save settings at `path`
pub fn update_settings_at<F>(path: &Path, updater: F) -> Result<AppSettings>
where
    F: FnOnce(&mut AppSettings),
{
    let mut settings = load_settings_from(path)?;
    updater(&mut settings);
    save_settings_to(path, &settings)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.general.poll_interval_ms, 1000);
        assert_eq!(settings.general.smoothing_window, 2);
        assert_eq!(settings.general.history_retention_secs, 86_400);
        assert!(settings.applied.is_empty());
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: AppSettings =
            serde_json::from_str(r#"{"general":{"poll_interval_ms":500}}"#).unwrap();
        assert_eq!(parsed.general.poll_interval_ms, 500);
        assert!(parsed.general.smoothing_enabled);
        assert_eq!(parsed.general.recent_window_secs, 60);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut settings = AppSettings::default();
        settings.general.poll_interval_ms = 10;
        assert!(validate_settings(&settings).is_err());

        let mut settings = AppSettings::default();
        settings.general.smoothing_window = 11;
        assert!(validate_settings(&settings).is_err());

        let mut settings = AppSettings::default();
        settings.general.default_hysteresis_pct = 60;
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = AppSettings::default();
        settings.general.poll_interval_ms = 2000;
        settings.record_applied(DeviceId(3), "fan1", &Setting::Fixed { duty: 45 });
        save_settings_to(&path, &settings).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded, settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_record_applied_replaces_and_removes() {
        let mut settings = AppSettings::default();
        settings.record_applied(DeviceId(1), "pump", &Setting::Fixed { duty: 50 });
        settings.record_applied(DeviceId(1), "pump", &Setting::Fixed { duty: 70 });
        settings.record_applied(DeviceId(2), "pump", &Setting::Fixed { duty: 30 });
        assert_eq!(settings.applied.len(), 2);
        assert_eq!(
            settings.applied_for(DeviceId(1), "pump"),
            Some(&Setting::Fixed { duty: 70 })
        );

        settings.record_applied(DeviceId(1), "pump", &Setting::None);
        assert_eq!(settings.applied_for(DeviceId(1), "pump"), None);
    }

    #[test]
    fn test_update_settings_at() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        update_settings_at(&path, |s| s.general.smoothing_enabled = false).unwrap();
        assert!(!load_settings_from(&path).unwrap().general.smoothing_enabled);
    }

    #[test]
    #[serial]
    fn test_settings_path_honours_env_override() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(paths::CONFIG_DIR_ENV, dir.path());
        let path = get_settings_path().unwrap();
        std::env::remove_var(paths::CONFIG_DIR_ENV);
        assert_eq!(path, dir.path().join("settings.json"));
    }
}
