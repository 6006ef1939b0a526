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

//! Per-channel controller
//!
//! A [`ChannelController`] owns the active [`Setting`] of one (device, channel)
//! and turns it into jobs on the shared [`JobScheduler`]:
//!
//! - `Fixed`: one write, then `FixedApplied`
//! - `Profile` the device evaluates itself: one curve upload, then `Delegated`
//! - `Profile` we evaluate (manual channel or temperature from another
//!   device): a recurring tick at the poll interval, `ProfileScheduled`
//! - `None`: job cancelled; hwmon channels also get handed back to
//!   automatic control
//!
//! Every setting change bumps a generation counter. Jobs carry the generation
//! they were created for and only record a successful write while it is
//! still current, so a write finishing after a newer setting was applied
//! never clobbers the newer state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use cl_core::constants::{errors::MAX_CONSECUTIVE_ERRORS, hysteresis, smoothing, timing};
use cl_core::data::validate_hysteresis;
use cl_core::{
    Device, DeviceId, DispatchValue, DutyProfile, GeneralSettings, Setting, Smoother,
    SpeedOptions, TempSourceRef,
};
use cl_error::{CoolantError, DispatchError, Result, ValidationError};

use crate::dispatch::{dispatch_blocking, ApplyOutcome, DeviceDispatcher, Notifier};
use crate::scheduler::{task, JobKey, JobScheduler, Trigger};
use crate::sources::TemperatureSource;

/// Devices known to the daemon, immutable after discovery
pub type DeviceMap = HashMap<DeviceId, Arc<Device>>;

/// Where a channel is in its setting lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    /// No setting
    Idle,
    /// Fixed duty written
    FixedApplied,
    /// Profile evaluated by a recurring tick
    ProfileScheduled,
    /// One-shot write pending
    AwaitingDispatch,
    /// Profile uploaded to the device, which evaluates it
    Delegated,
}

/// Controller tuning shared by every channel
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub poll_interval: Duration,
    pub hysteresis_pct: u8,
    pub smoothing_enabled: bool,
    pub smoothing_window: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: timing::POLL_INTERVAL,
            hysteresis_pct: hysteresis::DEFAULT_THRESHOLD_PCT,
            smoothing_enabled: true,
            smoothing_window: smoothing::DEFAULT_WINDOW,
        }
    }
}

impl From<&GeneralSettings> for ControllerConfig {
    fn from(general: &GeneralSettings) -> Self {
        Self {
            poll_interval: general.poll_interval(),
            hysteresis_pct: general.default_hysteresis_pct,
            smoothing_enabled: general.smoothing_enabled,
            smoothing_window: general.smoothing_window,
        }
    }
}

/// Collaborators of every controller
#[derive(Clone)]
pub struct ControllerContext {
    pub scheduler: Arc<JobScheduler>,
    pub dispatcher: Arc<dyn DeviceDispatcher>,
    pub temperatures: Arc<dyn TemperatureSource>,
    pub notifier: Arc<dyn Notifier>,
    pub devices: Arc<DeviceMap>,
    pub config: ControllerConfig,
}

/// Whether a newly computed duty differs enough from the last write
///
/// Always true when nothing was written yet. A threshold of 0 behaves like 1,
/// so an unchanged duty is never rewritten.
pub fn should_dispatch(last_applied: Option<u8>, duty: u8, threshold: u8) -> bool {
    match last_applied {
        None => true,
        Some(last) => duty.abs_diff(last) >= threshold.max(1),
    }
}

/// How a validated setting will be carried out
enum Plan {
    /// Cancel the job, nothing to write
    Remove,
    /// Cancel and hand the channel back to automatic control
    ResetToDefault,
    Fixed(u8),
    /// Recurring evaluation on our side
    Manual {
        profile: DutyProfile,
        source: TempSourceRef,
        smoother: Smoother,
    },
    /// Curve upload, the device evaluates
    Native {
        points: Vec<(f64, u8)>,
        sensor: String,
    },
}

/// Generation-guarded bookkeeping
#[derive(Debug, Clone)]
struct Applied {
    generation: u64,
    last_duty: Option<u8>,
    state: ControlState,
}

struct Shared {
    key: JobKey,
    options: SpeedOptions,
    ctx: ControllerContext,
    applied: Mutex<Applied>,
    smoother: Mutex<Smoother>,
    hysteresis: AtomicU8,
    failures: AtomicU32,
}

impl Shared {
    fn device_id(&self) -> DeviceId {
        self.key.device_id
    }

    fn channel(&self) -> &str {
        &self.key.channel
    }

    /// Start a new generation; the last applied duty is forgotten
    fn begin(&self, state: ControlState) -> u64 {
        let mut applied = self.applied.lock();
        applied.generation += 1;
        applied.last_duty = None;
        applied.state = state;
        self.failures.store(0, Ordering::SeqCst);
        applied.generation
    }

    /// Bookkeeping to return to when a new setting can't be scheduled
    fn snapshot(&self) -> (Applied, Smoother, u32) {
        (
            self.applied.lock().clone(),
            self.smoother.lock().clone(),
            self.failures.load(Ordering::SeqCst),
        )
    }

    fn restore(&self, (applied, smoother, failures): (Applied, Smoother, u32)) {
        *self.applied.lock() = applied;
        *self.smoother.lock() = smoother;
        self.failures.store(failures, Ordering::SeqCst);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.applied.lock().generation == generation
    }

    /// Last applied duty, or `None` when `generation` is stale
    fn last_duty(&self, generation: u64) -> Option<Option<u8>> {
        let applied = self.applied.lock();
        (applied.generation == generation).then_some(applied.last_duty)
    }

    /// Record a successful write if `generation` is still current
    fn complete(&self, generation: u64, duty: Option<u8>, state: ControlState) -> bool {
        let mut applied = self.applied.lock();
        if applied.generation != generation {
            return false;
        }
        if duty.is_some() {
            applied.last_duty = duty;
        }
        applied.state = state;
        true
    }

    fn notify(&self, outcome: ApplyOutcome) {
        self.ctx
            .notifier
            .settings_applied(self.device_id(), self.channel(), &outcome);
    }

    /// Count a failure; true on the first and every Nth consecutive one
    fn record_failure(&self) -> (u32, bool) {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        (count, count == 1 || count % MAX_CONSECUTIVE_ERRORS == 0)
    }

    fn record_success(&self) {
        let previous = self.failures.swap(0, Ordering::SeqCst);
        if previous > 0 {
            debug!(job = %self.key, "Recovered after {} failures", previous);
        }
    }

    async fn write(&self, value: DispatchValue) -> std::result::Result<(), DispatchError> {
        dispatch_blocking(
            Arc::clone(&self.ctx.dispatcher),
            self.device_id(),
            self.channel().to_string(),
            value,
        )
        .await
    }

    fn report_dispatch_error(&self, err: &DispatchError) {
        let (count, report) = self.record_failure();
        if !report {
            return;
        }
        if err.is_skip() {
            warn!(job = %self.key, "Skipping write (count: {}): {}", count, err);
            self.notify(ApplyOutcome::Skipped(err.to_string()));
        } else {
            error!(job = %self.key, "Write failed (count: {}): {}", count, err);
            self.notify(ApplyOutcome::Failed(err.to_string()));
        }
    }
}

/// One-shot write job
async fn dispatch_once(shared: Arc<Shared>, generation: u64, value: DispatchValue, duty: Option<u8>, done: ControlState) {
    if !shared.is_current(generation) {
        return;
    }
    let description = value.describe();
    match shared.write(value).await {
        Ok(()) => {
            shared.record_success();
            if shared.complete(generation, duty, done) {
                shared.notify(ApplyOutcome::Applied(description));
            }
        }
        Err(e) => shared.report_dispatch_error(&e),
    }
}

/// One evaluation tick of a profile
async fn profile_tick(shared: Arc<Shared>, generation: u64, profile: Arc<DutyProfile>, source: TempSourceRef) {
    let temp = match shared.ctx.temperatures.read(&source) {
        Ok(t) if t.is_finite() => t,
        Ok(t) => {
            debug!(job = %shared.key, "Ignoring non-finite temperature {}", t);
            return;
        }
        Err(e) => {
            let (count, report) = shared.record_failure();
            if report {
                warn!(job = %shared.key, "Temperature read failed (count: {}): {}", count, e);
            }
            return;
        }
    };

    let smoothed = shared.smoother.lock().smooth(&source.sensor, temp);
    let duty = profile.evaluate(smoothed, shared.options.min_duty, shared.options.max_duty);

    let last = match shared.last_duty(generation) {
        Some(last) => last,
        None => return,
    };
    let threshold = shared.hysteresis.load(Ordering::SeqCst);
    if !should_dispatch(last, duty, threshold) {
        return;
    }

    debug!(job = %shared.key, "{:.1}°C -> {}% (last {:?})", smoothed, duty, last);
    match shared.write(DispatchValue::Duty(duty)).await {
        Ok(()) => {
            shared.record_success();
            if shared.complete(generation, Some(duty), ControlState::ProfileScheduled) {
                shared.notify(ApplyOutcome::Applied(format!("{}%", duty)));
            }
        }
        Err(e) => shared.report_dispatch_error(&e),
    }
}

/// Controller of one speed channel
pub struct ChannelController {
    device: Arc<Device>,
    shared: Arc<Shared>,
    // Also serializes set_settings/clear
    setting: Mutex<Setting>,
}

impl ChannelController {
    /// Controller for a speed channel of `device`
    pub fn new(device: Arc<Device>, channel: &str, ctx: ControllerContext) -> Result<Self> {
        let options = *device.speed_options(channel)?;
        let hysteresis = ctx.config.hysteresis_pct;
        Ok(Self {
            shared: Arc::new(Shared {
                key: JobKey::new(device.id, channel),
                options,
                ctx,
                applied: Mutex::new(Applied {
                    generation: 0,
                    last_duty: None,
                    state: ControlState::Idle,
                }),
                smoother: Mutex::new(Smoother::disabled()),
                hysteresis: AtomicU8::new(hysteresis),
                failures: AtomicU32::new(0),
            }),
            device,
            setting: Mutex::new(Setting::None),
        })
    }

    pub fn key(&self) -> &JobKey {
        &self.shared.key
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn setting(&self) -> Setting {
        self.setting.lock().clone()
    }

    pub fn state(&self) -> ControlState {
        self.shared.applied.lock().state
    }

    pub fn last_applied_duty(&self) -> Option<u8> {
        self.shared.applied.lock().last_duty
    }

    pub fn hysteresis(&self) -> u8 {
        self.shared.hysteresis.load(Ordering::SeqCst)
    }

    /// Change the minimum duty delta of profile ticks
    pub fn set_hysteresis(&self, pct: u8) -> Result<()> {
        let pct = validate_hysteresis(pct)?;
        self.shared.hysteresis.store(pct, Ordering::SeqCst);
        Ok(())
    }

    /// Apply a new setting, replacing the channel's job
    ///
    /// Validation and scheduling failures leave the previous setting, its job
    /// and the applied state untouched.
    pub fn set_settings(&self, setting: Setting) -> Result<()> {
        let mut current = self.setting.lock();
        let plan = self.plan(&setting)?;
        let previous = self.shared.snapshot();
        if let Err(e) = self.carry_out(plan) {
            warn!(job = %self.shared.key, "Could not schedule {} setting: {}", setting.label(), e);
            self.shared.restore(previous);
            return Err(e);
        }

        info!(job = %self.shared.key, "Applied {} setting", setting.label());
        *current = setting;
        Ok(())
    }

    fn carry_out(&self, plan: Plan) -> Result<()> {
        let ctx = &self.shared.ctx;
        let key = self.shared.key.clone();
        match plan {
            Plan::Remove => {
                if !ctx.scheduler.is_running() {
                    return Err(CoolantError::SchedulerStopped);
                }
                self.shared.begin(ControlState::Idle);
                if ctx.scheduler.cancel(&key) {
                    self.shared.notify(ApplyOutcome::Removed);
                }
            }
            Plan::ResetToDefault => {
                let generation = self.shared.begin(ControlState::AwaitingDispatch);
                self.schedule_once(generation, DispatchValue::Default, None, ControlState::Idle)?;
            }
            Plan::Fixed(duty) => {
                let generation = self.shared.begin(ControlState::AwaitingDispatch);
                self.schedule_once(generation, DispatchValue::Duty(duty), Some(duty), ControlState::FixedApplied)?;
            }
            Plan::Native { points, sensor } => {
                let generation = self.shared.begin(ControlState::AwaitingDispatch);
                let value = DispatchValue::Profile {
                    points,
                    temp_sensor: sensor,
                };
                self.schedule_once(generation, value, None, ControlState::Delegated)?;
            }
            Plan::Manual {
                profile,
                source,
                smoother,
            } => {
                let generation = self.shared.begin(ControlState::ProfileScheduled);
                *self.shared.smoother.lock() = smoother;
                let shared = Arc::clone(&self.shared);
                let profile = Arc::new(profile);
                ctx.scheduler.schedule(
                    key,
                    Trigger::Every(ctx.config.poll_interval),
                    task(move || profile_tick(Arc::clone(&shared), generation, Arc::clone(&profile), source.clone())),
                )?;
            }
        }
        Ok(())
    }

    /// Cancel the channel's job and forget its setting
    ///
    /// Returns whether a job existed.
    pub fn clear(&self) -> bool {
        let mut current = self.setting.lock();
        self.shared.begin(ControlState::Idle);
        *current = Setting::None;
        let existed = self.shared.ctx.scheduler.cancel(&self.shared.key);
        if existed {
            debug!(job = %self.shared.key, "Cleared setting");
        }
        existed
    }

    /// Apply the current setting again (after a device reinitialization)
    pub fn reapply(&self) -> Result<()> {
        let setting = self.setting();
        if setting.is_none() {
            return Ok(());
        }
        self.set_settings(setting)
    }

    fn schedule_once(&self, generation: u64, value: DispatchValue, duty: Option<u8>, done: ControlState) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.shared.ctx.scheduler.schedule(
            self.shared.key.clone(),
            Trigger::Once,
            task(move || dispatch_once(Arc::clone(&shared), generation, value.clone(), duty, done)),
        )
    }

    fn plan(&self, setting: &Setting) -> std::result::Result<Plan, ValidationError> {
        let options = &self.shared.options;
        let channel = self.shared.channel();
        match setting {
            Setting::None => Ok(if self.device.kind.resets_to_default() {
                Plan::ResetToDefault
            } else {
                Plan::Remove
            }),
            Setting::Fixed { duty } => {
                if !options.fixed_enabled {
                    return Err(ValidationError::Unsupported {
                        channel: channel.to_string(),
                        what: "fixed duty".to_string(),
                    });
                }
                if !options.contains(*duty as i32) {
                    return Err(ValidationError::DutyOutOfRange {
                        duty: *duty as i32,
                        min: options.min_duty,
                        max: options.max_duty,
                    });
                }
                Ok(Plan::Fixed(*duty))
            }
            Setting::Profile {
                profile,
                temp_source,
            } => {
                if !options.profiles_enabled {
                    return Err(ValidationError::Unsupported {
                        channel: channel.to_string(),
                        what: "duty profiles".to_string(),
                    });
                }
                let max = self.device.profile_max_length();
                if profile.len() > max {
                    return Err(ValidationError::TooManyPoints {
                        count: profile.len(),
                        max,
                    });
                }
                let cross_device = temp_source.device_id != self.device.id;
                if cross_device && !options.external_temp_enabled {
                    return Err(ValidationError::Unsupported {
                        channel: channel.to_string(),
                        what: "external temperature sources".to_string(),
                    });
                }
                let source_device = self
                    .shared
                    .ctx
                    .devices
                    .get(&temp_source.device_id)
                    .ok_or_else(|| ValidationError::UnknownDevice(temp_source.device_id.to_string()))?;

                if options.manual_profiles_enabled || cross_device {
                    let config = &self.shared.ctx.config;
                    Ok(Plan::Manual {
                        profile: profile.clone(),
                        source: temp_source.clone(),
                        smoother: Smoother::for_device(
                            source_device,
                            config.smoothing_enabled,
                            config.smoothing_window,
                        ),
                    })
                } else {
                    Ok(Plan::Native {
                        points: profile.to_pairs(),
                        sensor: temp_source.sensor.clone(),
                    })
                }
            }
        }
    }
}
