//! Unified error handling for Coolant
//!
//! This crate provides the error types shared by every Coolant component.
//! `ValidationError` and `DispatchError` are kept as their own enums because
//! callers branch on them (a rejected setting vs. a failed hardware write);
//! both convert into `CoolantError` for everything else.

use std::io;
use std::path::PathBuf;

/// Result type alias using CoolantError
pub type Result<T> = std::result::Result<T, CoolantError>;

/// A setting or curve was rejected before any scheduling change happened.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Curve validation failed: {0}")]
    InvalidCurve(String),

    #[error("Duty {duty} out of range (must be {min}-{max})")]
    DutyOutOfRange {
        duty: i32,
        min: u8,
        max: u8,
    },

    #[error("Too many curve points: {count} (max {max})")]
    TooManyPoints {
        count: usize,
        max: usize,
    },

    #[error("Temperature {temp}°C outside device range {min}-{max}°C")]
    TemperatureOutOfRange {
        temp: f64,
        min: f64,
        max: f64,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown channel {channel} on device {device}")]
    UnknownChannel {
        device: String,
        channel: String,
    },

    #[error("Channel {channel} does not support {what}")]
    Unsupported {
        channel: String,
        what: String,
    },

    #[error("Invalid lighting setting: {0}")]
    InvalidLighting(String),
}

/// A hardware write (or the check preceding it) failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Device is read-only: {0}")]
    ReadOnlyBlocked(String),

    #[error("Write to {device}/{channel} failed: {reason}")]
    WriteFailed {
        device: String,
        channel: String,
        reason: String,
    },

    #[error("Dispatch task aborted: {0}")]
    Aborted(String),
}

impl DispatchError {
    /// Create a write failure for a device channel
    pub fn write_failed(
        device: impl Into<String>,
        channel: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::WriteFailed {
            device: device.into(),
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Whether the condition should skip the tick rather than count as a failed write
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::DeviceUnreachable(_) | Self::ReadOnlyBlocked(_))
    }
}

/// Unified error type for all Coolant operations
#[derive(thiserror::Error, Debug)]
pub enum CoolantError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Configuration and Settings Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error(transparent)]
    Validation(#[from] ValidationError),

    // ============================================================================
    // Device Access Errors
    // ============================================================================
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Failed to read temperature {sensor} on {device}: {reason}")]
    TemperatureRead {
        device: String,
        sensor: String,
        reason: String,
    },

    #[error("Status sample rejected: {0}")]
    InvalidSample(String),

    // ============================================================================
    // Scheduler Errors
    // ============================================================================
    #[error("Scheduler is not running")]
    SchedulerStopped,

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl CoolantError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a temperature read error
    pub fn temperature_read(
        device: impl Into<String>,
        sensor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TemperatureRead {
            device: device.into(),
            sensor: sensor.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a rejected setting
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

// Allow converting from String to CoolantError
impl From<String> for CoolantError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to CoolantError
impl From<&str> for CoolantError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
