//! Data types, settings and validation modules

mod setting;
mod types;
mod validation;

pub use setting::{DispatchValue, LightingSetting, Setting, SettingRequest, TempSourceRef};
pub use types::{
    ChannelInfo, ChannelReading, Device, DeviceId, DeviceInfo, DeviceKind, LightingMode,
    SpeedOptions, Status, TempReading,
};
pub use validation::{
    validate_fixed_duty, validate_hysteresis, validate_lighting, validate_setting_request,
};
