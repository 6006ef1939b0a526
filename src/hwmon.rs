/*
 * This file is part of Coolant.
 *
 * Copyright (C) 2025 Coolant contributors
 *
 * Coolant is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Coolant is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Coolant. If not, see <https://www.gnu.org/licenses/>.
 */

//! Kernel hwmon adapter
//!
//! Discovers `hwmonN` chips that expose `pwmN` controls, polls their
//! temperatures, fan speeds and duties, and writes duties back.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use cl_core::constants::duty;
use cl_core::{ChannelInfo, Device, DeviceId, DeviceInfo, DeviceKind, DispatchValue, SpeedOptions, Status};
use cl_error::DispatchError;

use crate::dispatch::DeviceDispatcher;
use crate::logger;
use crate::poller::StatusPoller;

pub const HWMON_ROOT: &str = "/sys/class/hwmon";

/// `pwmN_enable` value for manual control
const ENABLE_MANUAL: &str = "1";

/// `pwmN_enable` values handing control back to the chip, in order of preference
const ENABLE_AUTOMATIC: [&str; 2] = ["2", "5"];

#[derive(Error, Debug)]
pub enum HwmonError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Permission denied - need root")]
    PermissionDenied,
}

/// A discovered hwmon chip with at least one PWM control
#[derive(Debug, Clone)]
pub struct HwmonChip {
    pub id: DeviceId,
    pub dir: PathBuf,
    /// Driver name from the `name` file
    pub name: String,
    /// Indices of the chip's `pwmN` files
    pub pwms: Vec<usize>,
    /// PWM files exist but cannot be opened for writing
    pub read_only: bool,
}

impl HwmonChip {
    pub fn channel_name(idx: usize) -> String {
        format!("pwm{}", idx)
    }

    fn pwm_index(channel: &str) -> Option<usize> {
        extract_index(channel, "pwm", "")
    }

    /// Device descriptor: every PWM is a manually evaluated speed channel
    pub fn to_device(&self) -> Device {
        let mut info = DeviceInfo {
            temp_ext_available: true,
            ..DeviceInfo::default()
        };
        for idx in &self.pwms {
            info.channels.insert(
                Self::channel_name(*idx),
                ChannelInfo::speed(SpeedOptions {
                    manual_profiles_enabled: true,
                    external_temp_enabled: true,
                    ..SpeedOptions::default()
                }),
            );
        }
        let tag = self.dir.file_name().and_then(|s| s.to_str()).unwrap_or("hwmon?");
        Device::new(self.id, DeviceKind::Hwmon, format!("{} ({})", self.name, tag), info)
    }

    /// Read one status sample
    pub fn read_status(&self) -> Result<Status, HwmonError> {
        let mut status = Status::new(self.id, Utc::now());
        let mut files: Vec<String> = fs::read_dir(&self.dir)?
            .flatten()
            .map(|f| f.file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();

        for fname in &files {
            if let Some(idx) = extract_index(fname, "temp", "_input") {
                let label = read_trimmed(self.dir.join(format!("temp{}_label", idx)))
                    .unwrap_or_else(|_| format!("temp{}", idx));
                if let Ok(raw) = read_trimmed(self.dir.join(fname)) {
                    if let Ok(mc) = raw.parse::<i64>() {
                        // millidegree C
                        status = status.with_temp(label, mc as f64 / 1000.0);
                    }
                }
            }
        }

        for idx in &self.pwms {
            let rpm = read_trimmed(self.dir.join(format!("fan{}_input", idx)))
                .ok()
                .and_then(|raw| raw.parse::<u32>().ok());
            let duty = self.read_pwm_percent(*idx).ok();
            status = status.with_channel(Self::channel_name(*idx), rpm, duty);
        }
        Ok(status)
    }

    fn read_pwm_percent(&self, idx: usize) -> Result<f64, HwmonError> {
        let raw = read_trimmed(self.dir.join(format!("pwm{}", idx)))?;
        let value: u64 = raw
            .parse()
            .map_err(|_| HwmonError::Parse(format!("pwm{}: {:?}", idx, raw)))?;
        let max = self.pwm_max(idx).unwrap_or(duty::PWM_MAX as u64);
        Ok(duty::from_pwm(value, max))
    }

    fn pwm_max(&self, idx: usize) -> Option<u64> {
        read_trimmed(self.dir.join(format!("pwm{}_max", idx)))
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|v| *v > 0)
    }

    /// Write a duty in percent, switching the channel to manual mode first
    pub fn write_duty(&self, idx: usize, percent: u8) -> Result<(), HwmonError> {
        let pwm_path = self.dir.join(format!("pwm{}", idx));
        let enable_path = self.dir.join(format!("pwm{}_enable", idx));
        if !pwm_path.exists() {
            return Err(HwmonError::InvalidData(format!("{} has no pwm{}", self.name, idx)));
        }

        let mut manual_forced = false;
        if enable_path.exists() && read_trimmed(&enable_path).ok().as_deref() != Some(ENABLE_MANUAL) {
            write_sysfs(&enable_path, ENABLE_MANUAL)?;
            manual_forced = true;
        }

        let raw = duty::to_pwm(percent) as u64;
        let written = match self.pwm_max(idx) {
            Some(max) => raw * max / duty::PWM_MAX as u64,
            None => raw,
        };
        write_sysfs(&pwm_path, &written.to_string())?;

        logger::log_event(
            "pwm_write",
            json!({
                "chip": self.name,
                "idx": idx,
                "percent": percent,
                "written": written,
                "manual_forced": manual_forced,
            }),
        );
        Ok(())
    }

    /// Hand the channel back to the chip's automatic mode
    pub fn reset_to_default(&self, idx: usize) -> Result<(), HwmonError> {
        let enable_path = self.dir.join(format!("pwm{}_enable", idx));
        if !enable_path.exists() {
            return Err(HwmonError::InvalidData(format!("pwm{} has no enable control", idx)));
        }
        let mut last_err = None;
        for mode in ENABLE_AUTOMATIC {
            match write_sysfs(&enable_path, mode) {
                Ok(()) => {
                    logger::log_event("pwm_reset", json!({"chip": self.name, "idx": idx, "mode": mode}));
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| HwmonError::InvalidData("no automatic mode".into())))
    }
}

fn write_sysfs(path: &Path, value: &str) -> Result<(), HwmonError> {
    fs::write(path, value).map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => HwmonError::PermissionDenied,
        _ => HwmonError::Io(e),
    })
}

fn read_trimmed<P: AsRef<Path>>(p: P) -> io::Result<String> {
    let mut s = String::new();
    fs::File::open(p)?.read_to_string(&mut s)?;
    Ok(s.trim().to_string())
}

pub fn extract_index(fname: &str, prefix: &str, suffix: &str) -> Option<usize> {
    if fname.len() > prefix.len() + suffix.len() && fname.starts_with(prefix) && fname.ends_with(suffix) {
        let mid = &fname[prefix.len()..fname.len() - suffix.len()];
        mid.parse().ok()
    } else {
        None
    }
}

fn is_writable(path: &Path) -> bool {
    fs::OpenOptions::new().write(true).open(path).is_ok()
}

/// Discover chips below `root` that expose PWM controls
///
/// Ids are assigned from `first_id` in directory order.
pub fn discover(root: &Path, first_id: u32) -> Result<Vec<HwmonChip>, HwmonError> {
    let entries = match fs::read_dir(root) {
        Ok(it) => it,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .map(|p| fs::canonicalize(&p).unwrap_or(p))
        .collect();
    dirs.sort();

    let mut chips = Vec::new();
    for dir in dirs {
        let Ok(dir_iter) = fs::read_dir(&dir) else { continue };
        let mut pwms: Vec<usize> = dir_iter
            .flatten()
            .filter_map(|f| extract_index(&f.file_name().to_string_lossy(), "pwm", ""))
            .collect();
        if pwms.is_empty() {
            continue;
        }
        pwms.sort_unstable();

        let name = read_trimmed(dir.join("name")).unwrap_or_else(|_| "unknown".into());
        let read_only = !pwms
            .iter()
            .all(|idx| is_writable(&dir.join(format!("pwm{}", idx))));
        let id = DeviceId(first_id + chips.len() as u32);
        if read_only {
            warn!(device = %id, "hwmon chip {} is read-only", name);
        }
        debug!(device = %id, "Found hwmon chip {} with {} PWM controls", name, pwms.len());
        chips.push(HwmonChip {
            id,
            dir,
            name,
            pwms,
            read_only,
        });
    }
    info!("Discovered {} hwmon chips with PWM control", chips.len());
    Ok(chips)
}

/// Writes to hwmon chips
#[derive(Debug, Default)]
pub struct HwmonDispatcher {
    chips: HashMap<DeviceId, HwmonChip>,
}

impl HwmonDispatcher {
    pub fn new(chips: &[HwmonChip]) -> Self {
        Self {
            chips: chips.iter().map(|c| (c.id, c.clone())).collect(),
        }
    }

    fn chip(&self, device_id: DeviceId) -> Result<&HwmonChip, DispatchError> {
        self.chips
            .get(&device_id)
            .ok_or_else(|| DispatchError::DeviceUnreachable(format!("unknown hwmon device {}", device_id)))
    }
}

impl DeviceDispatcher for HwmonDispatcher {
    fn write(&self, device_id: DeviceId, channel: &str, value: &DispatchValue) -> Result<(), DispatchError> {
        let chip = self.chip(device_id)?;
        let idx = HwmonChip::pwm_index(channel)
            .ok_or_else(|| DispatchError::write_failed(device_id.to_string(), channel, "not a pwm channel"))?;
        let result = match value {
            DispatchValue::Duty(percent) => chip.write_duty(idx, *percent),
            DispatchValue::Default => chip.reset_to_default(idx),
            other => {
                return Err(DispatchError::write_failed(
                    device_id.to_string(),
                    channel,
                    format!("hwmon cannot apply {}", other.describe()),
                ))
            }
        };
        result.map_err(|e| match e {
            HwmonError::PermissionDenied => DispatchError::ReadOnlyBlocked(chip.name.clone()),
            e => DispatchError::write_failed(device_id.to_string(), channel, e.to_string()),
        })
    }

    fn check_writable(&self, device_id: DeviceId) -> Result<(), DispatchError> {
        let chip = self.chip(device_id)?;
        if !chip.dir.exists() {
            return Err(DispatchError::DeviceUnreachable(format!("{} disappeared", chip.name)));
        }
        if chip.read_only {
            return Err(DispatchError::ReadOnlyBlocked(chip.name.clone()));
        }
        Ok(())
    }

    fn is_read_only(&self, device_id: DeviceId) -> bool {
        self.chips.get(&device_id).is_some_and(|chip| chip.read_only)
    }

    fn reinitialize(&self, _device_id: DeviceId) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Polls one hwmon chip
#[derive(Debug, Clone)]
pub struct HwmonPoller {
    chip: Arc<HwmonChip>,
}

impl HwmonPoller {
    pub fn new(chip: HwmonChip) -> Self {
        Self { chip: Arc::new(chip) }
    }
}

impl StatusPoller for HwmonPoller {
    fn device_id(&self) -> DeviceId {
        self.chip.id
    }

    fn poll(&self) -> cl_error::Result<Status> {
        self.chip
            .read_status()
            .map_err(|e| cl_error::CoolantError::generic(format!("{}: {}", self.chip.name, e)))
    }
}
