//! Coolant Core Library
//!
//! Domain model for the Coolant cooling device controller.
//!
//! # Module Structure
//!
//! - `data/` - Devices, channel capabilities, settings, status samples, validation
//! - `engine/` - Duty profiles and the smoothing filter
//! - `history` - Age-evicted status history per device
//! - `settings` - Persistent JSON configuration
//!
//! # Example
//!
//! ```
//! use cl_core::DutyProfile;
//!
//! let profile = DutyProfile::build(&[30.0, 50.0, 70.0], &[20, 50, 100], 9).unwrap();
//! assert_eq!(profile.evaluate(40.0, 0, 100), 35);
//! ```

// Grouped modules
pub mod data;
pub mod engine;

// Standalone modules
pub mod constants;
pub mod history;
pub mod settings;

pub use data::{
    ChannelInfo, ChannelReading, Device, DeviceId, DeviceInfo, DeviceKind, DispatchValue,
    LightingMode, LightingSetting, Setting, SettingRequest, SpeedOptions, Status, TempReading,
    TempSourceRef,
};

pub use data::{validate_fixed_duty, validate_lighting, validate_setting_request};

pub use engine::{DutyProfile, ProfilePoint, Smoother};

pub use history::{DeviceHistory, HistoryBuffer, HistoryConfig, HistoryRegistry};

pub use settings::{AppSettings, AppliedSetting, GeneralSettings};

// Re-export error types
pub use cl_error::{CoolantError, DispatchError, Result, ValidationError};
