//! Constants and configuration values for Coolant
//!
//! Centralizes the magic numbers shared by the scheduler, the history buffers
//! and the settings layer.

use std::time::Duration;

/// Configuration paths
pub mod paths {
    use std::path::PathBuf;

    /// Environment variable overriding the configuration directory
    pub const CONFIG_DIR_ENV: &str = "COOLANT_CONFIG_DIR";

    /// Directory name below the user's config dir
    pub const APP_DIR: &str = "coolant";

    /// Settings file name
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Resolve the configuration directory
    ///
    /// `COOLANT_CONFIG_DIR` wins, then `$XDG_CONFIG_HOME/coolant`, then the
    /// platform config dir reported by `dirs`.
    pub fn config_dir() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if !dir.is_empty() {
                return Some(PathBuf::from(dir));
            }
        }
        dirs::config_dir().map(|p| p.join(APP_DIR))
    }
}

/// Duty (percent) constants
pub mod duty {
    /// Lowest duty any channel accepts
    pub const MIN_PERCENT: u8 = 0;

    /// Highest duty any channel accepts
    pub const MAX_PERCENT: u8 = 100;

    /// Raw hwmon PWM full scale
    pub const PWM_MAX: f64 = 255.0;

    /// Convert percentage (0-100) to hwmon PWM value (0-255)
    #[inline]
    pub fn to_pwm(percent: u8) -> u8 {
        ((percent.min(MAX_PERCENT) as f64 / 100.0) * PWM_MAX).round() as u8
    }

    /// Convert a hwmon PWM value to percentage (0-100)
    ///
    /// `full_scale` is the channel's `pwmN_max`, 255 on most chips.
    #[inline]
    pub fn from_pwm(value: u64, full_scale: u64) -> f64 {
        let full_scale = full_scale.max(1);
        (value.min(full_scale) as f64 / full_scale as f64) * 100.0
    }
}

/// Duty profile limits
pub mod profile {
    /// Breakpoint limit most devices advertise
    pub const DEFAULT_MAX_LENGTH: usize = 9;

    /// Hard cap regardless of device
    pub const HARD_MAX_LENGTH: usize = 16;

    /// Temperatures are compared with this tolerance when matching breakpoints
    pub const FLOAT_EPSILON: f64 = 1e-9;
}

/// Hysteresis policy
pub mod hysteresis {
    /// Default minimum duty delta before a write (dispatch on any change)
    pub const DEFAULT_THRESHOLD_PCT: u8 = 1;

    /// Largest threshold a device or user may configure
    pub const MAX_THRESHOLD_PCT: u8 = 50;
}

/// Smoothing (moving average) parameters
pub mod smoothing {
    /// Default moving average window
    pub const DEFAULT_WINDOW: usize = 2;

    /// Largest accepted window
    pub const MAX_WINDOW: usize = 10;
}

/// Timing constants for polling and history
pub mod timing {
    use super::*;

    /// Default poll tick
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);

    /// Poll interval default in milliseconds (settings file)
    pub const POLL_INTERVAL_MS: u64 = 1000;

    /// Lowest accepted poll interval in milliseconds
    pub const MIN_POLL_INTERVAL_MS: u64 = 50;

    /// Highest accepted poll interval in milliseconds
    pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

    /// Long status history retention
    pub const HISTORY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

    /// Recent window feeding smoothing and live display
    pub const RECENT_WINDOW: Duration = Duration::from_secs(60);
}

/// Error handling thresholds
pub mod errors {
    /// Log repeated failures only on the first and every Nth occurrence
    pub const MAX_CONSECUTIVE_ERRORS: u32 = 10;
}

/// Virtual aggregate device
pub mod composite {
    /// Name of the averaged temperature on the composite device
    pub const AVERAGE_ALL: &str = "Average All";

    /// Name of the composite device
    pub const DEVICE_NAME: &str = "Composite";
}
