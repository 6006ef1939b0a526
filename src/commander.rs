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

//! Device commander
//!
//! The entry point for everything that changes what the hardware does:
//! speed settings, lighting, device reinitialization and restoring the
//! settings saved by a previous run. It owns one [`ChannelController`] per
//! speed channel of every real device.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use cl_core::{
    validate_lighting, validate_setting_request, AppliedSetting, Device, DeviceId, DispatchValue,
    HistoryRegistry, LightingSetting, Setting, SettingRequest,
};
use cl_error::{DispatchError, Result, ValidationError};

use crate::controller::{ChannelController, ControllerContext, DeviceMap};
use crate::dispatch::{dispatch_blocking, ApplyOutcome, OrderedSaves, SettingsPersistence};
use crate::scheduler::{task, JobKey, Trigger};

pub struct DeviceCommander {
    ctx: ControllerContext,
    controllers: HashMap<JobKey, Arc<ChannelController>>,
    history: Arc<HistoryRegistry>,
    saves: Option<Arc<OrderedSaves>>,
    // Applying a setting and drawing its save ticket happen as one step
    apply_order: Mutex<()>,
}

impl DeviceCommander {
    pub fn new(ctx: ControllerContext, history: Arc<HistoryRegistry>) -> Self {
        let mut controllers = HashMap::new();
        for device in ctx.devices.values().filter(|d| !d.kind.is_virtual()) {
            for (name, channel) in &device.info.channels {
                if channel.speed_options.is_none() {
                    continue;
                }
                match ChannelController::new(Arc::clone(device), name, ctx.clone()) {
                    Ok(controller) => {
                        controllers.insert(controller.key().clone(), Arc::new(controller));
                    }
                    Err(e) => warn!(device = %device.id, channel = %name, "No controller: {}", e),
                }
            }
        }
        debug!("Created {} channel controllers", controllers.len());
        Self {
            ctx,
            controllers,
            history,
            saves: None,
            apply_order: Mutex::new(()),
        }
    }

    /// Save every applied setting through `persistence`
    pub fn with_persistence(mut self, persistence: Arc<dyn SettingsPersistence>) -> Self {
        self.saves = Some(Arc::new(OrderedSaves::new(persistence)));
        self
    }

    pub fn devices(&self) -> &DeviceMap {
        &self.ctx.devices
    }

    pub fn history(&self) -> &Arc<HistoryRegistry> {
        &self.history
    }

    pub fn controller(&self, device_id: DeviceId, channel: &str) -> Option<&Arc<ChannelController>> {
        self.controllers.get(&JobKey::new(device_id, channel))
    }

    fn device(&self, device_id: DeviceId) -> std::result::Result<&Arc<Device>, ValidationError> {
        self.ctx
            .devices
            .get(&device_id)
            .ok_or_else(|| ValidationError::UnknownDevice(device_id.to_string()))
    }

    fn channel_controller(&self, device: &Device, channel: &str) -> Result<&Arc<ChannelController>> {
        // Reports a missing or lighting-only channel precisely
        device.speed_options(channel)?;
        self.controller(device.id, channel).ok_or_else(|| {
            ValidationError::Unsupported {
                channel: channel.to_string(),
                what: format!("speed control on {}", device.kind),
            }
            .into()
        })
    }

    /// Validate and apply a speed setting
    ///
    /// Rejections leave the channel's current setting in place.
    pub fn set_speed_setting(&self, device_id: DeviceId, channel: &str, request: &SettingRequest) -> Result<()> {
        let device = self.device(device_id)?;
        let controller = self.channel_controller(device, channel)?;

        if self.ctx.dispatcher.is_read_only(device_id) {
            warn!(device = %device_id, channel, "Refusing setting on read-only device");
            return Err(DispatchError::ReadOnlyBlocked(device.name.clone()).into());
        }

        // The controller checks the temperature source against the known devices
        let setting = validate_setting_request(request, device, channel)?;
        let _order = self.apply_order.lock();
        controller.set_settings(setting.clone())?;
        self.persist(device_id, channel, setting);
        Ok(())
    }

    /// Drop the channel's setting without writing anything
    ///
    /// Returns whether a job existed.
    pub fn clear_channel_setting(&self, device_id: DeviceId, channel: &str) -> bool {
        let Some(controller) = self.controller(device_id, channel) else {
            return false;
        };
        let _order = self.apply_order.lock();
        let existed = controller.clear();
        self.persist(device_id, channel, Setting::None);
        existed
    }

    /// Validate and dispatch a lighting setting as a one-shot job
    pub fn set_lighting(&self, device_id: DeviceId, channel: &str, lighting: LightingSetting) -> Result<()> {
        let device = self.device(device_id)?;
        validate_lighting(&lighting, device, channel)?;

        let ctx = self.ctx.clone();
        let channel_name = channel.to_string();
        let value = DispatchValue::Lighting(lighting);
        self.ctx.scheduler.schedule(
            JobKey::new(device_id, channel),
            Trigger::Once,
            task(move || {
                let ctx = ctx.clone();
                let channel = channel_name.clone();
                let value = value.clone();
                async move {
                    let what = value.describe();
                    let outcome = match dispatch_blocking(ctx.dispatcher.clone(), device_id, channel.clone(), value).await {
                        Ok(()) => ApplyOutcome::Applied(what),
                        Err(e) if e.is_skip() => ApplyOutcome::Skipped(e.to_string()),
                        Err(e) => ApplyOutcome::Failed(e.to_string()),
                    };
                    ctx.notifier.settings_applied(device_id, &channel, &outcome);
                }
            }),
        )?;
        info!(device = %device_id, channel, "Lighting scheduled");
        Ok(())
    }

    /// Reinitialize every driver-managed device, then re-apply its settings
    ///
    /// Returns how many devices were scheduled.
    pub fn reinitialize_devices(&self) -> Result<usize> {
        let mut scheduled = 0;
        for device in self.ctx.devices.values().filter(|d| d.kind.supports_reinitialize()) {
            let device_id = device.id;
            let controllers: Vec<Arc<ChannelController>> = self
                .controllers
                .values()
                .filter(|c| c.key().device_id == device_id)
                .cloned()
                .collect();
            let dispatcher = self.ctx.dispatcher.clone();
            self.ctx.scheduler.schedule(
                JobKey::device_wide(device_id),
                Trigger::Once,
                task(move || {
                    let dispatcher = dispatcher.clone();
                    let controllers = controllers.clone();
                    async move {
                        let result = tokio::task::spawn_blocking(move || dispatcher.reinitialize(device_id))
                            .await
                            .map_err(|e| DispatchError::Aborted(e.to_string()))
                            .and_then(|r| r);
                        match result {
                            Ok(()) => {
                                info!(device = %device_id, "Device reinitialized");
                                for controller in &controllers {
                                    if let Err(e) = controller.reapply() {
                                        warn!(job = %controller.key(), "Re-applying setting failed: {}", e);
                                    }
                                }
                            }
                            Err(e) => warn!(device = %device_id, "Reinitialization failed: {}", e),
                        }
                    }
                }),
            )?;
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// Apply settings saved by a previous run
    ///
    /// Entries for devices or channels that no longer exist are skipped.
    /// Returns how many were applied.
    pub fn restore(&self, applied: &[AppliedSetting]) -> usize {
        let mut restored = 0;
        for entry in applied {
            let Some(controller) = self.controller(entry.device_id, &entry.channel) else {
                debug!(device = %entry.device_id, channel = %entry.channel, "Saved setting has no channel");
                continue;
            };
            match controller.set_settings(entry.setting.clone()) {
                Ok(()) => restored += 1,
                Err(e) => warn!(job = %controller.key(), "Saved setting not restored: {}", e),
            }
        }
        info!("Restored {} of {} saved settings", restored, applied.len());
        restored
    }

    /// Queue a save of `setting`; callers hold `apply_order`
    fn persist(&self, device_id: DeviceId, channel: &str, setting: Setting) {
        let Some(saves) = self.saves.clone() else {
            return;
        };
        let ticket = saves.ticket();
        let channel = channel.to_string();
        let save = move || {
            if let Err(e) = saves.save(ticket, device_id, &channel, &setting) {
                warn!(device = %device_id, channel = %channel, "Saving setting failed: {}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(save);
            }
            Err(_) => save(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControlState;
    use crate::dispatch::{JsonSettingsPersistence, MockSettingsPersistence};
    use cl_core::settings;
    use crate::test_utils::*;
    use cl_core::{HistoryConfig, TempSourceRef};
    use cl_error::CoolantError;

    fn commander(h: &Harness) -> DeviceCommander {
        DeviceCommander::new(h.context(), Arc::new(HistoryRegistry::new(HistoryConfig::default())))
    }

    fn profile_request(source: DeviceId, sensor: &str) -> SettingRequest {
        SettingRequest::Profile {
            temps: vec![30.0, 50.0],
            duties: vec![30, 80],
            temp_source: TempSourceRef::new(source, sensor),
        }
    }

    #[tokio::test]
    async fn test_controllers_only_for_speed_channels() {
        let h = Harness::new();
        let cmd = commander(&h);
        assert!(cmd.controller(KRAKEN, "pump").is_some());
        assert!(cmd.controller(KRAKEN, "fan").is_some());
        assert!(cmd.controller(KRAKEN, "ring").is_none());
        assert!(cmd.controller(HWMON, "fan2").is_some());
    }

    #[tokio::test]
    async fn test_unknown_targets_are_rejected() {
        let h = Harness::new();
        let cmd = commander(&h);
        let err = cmd
            .set_speed_setting(DeviceId(77), "fan", &SettingRequest::Fixed { duty: 50 })
            .unwrap_err();
        assert!(matches!(err, CoolantError::Validation(ValidationError::UnknownDevice(_))));

        let err = cmd
            .set_speed_setting(KRAKEN, "nope", &SettingRequest::Fixed { duty: 50 })
            .unwrap_err();
        assert!(err.is_validation());

        let err = cmd
            .set_speed_setting(KRAKEN, "ring", &SettingRequest::Fixed { duty: 50 })
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_fixed_setting_is_written_and_persisted() {
        let h = Harness::new();
        let mut persistence = MockSettingsPersistence::new();
        persistence
            .expect_save_applied()
            .withf(|id, channel, setting| *id == HWMON && channel == "fan1" && *setting == Setting::Fixed { duty: 45 })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let cmd = commander(&h).with_persistence(Arc::new(persistence));

        cmd.set_speed_setting(HWMON, "fan1", &SettingRequest::Fixed { duty: 45 })
            .unwrap();
        assert!(wait_until(|| h.dispatcher.duties_to("fan1") == vec![45]).await);
        let controller = cmd.controller(HWMON, "fan1").unwrap();
        assert!(wait_until(|| controller.state() == ControlState::FixedApplied).await);
        // Let the blocking save run before the mock checks its expectation
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rapid_requests_persist_the_last_setting() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let cmd = commander(&h).with_persistence(Arc::new(JsonSettingsPersistence::new(&path)));

        for round in 0..10u8 {
            for duty in [30, 40, 50, 60, 70] {
                let duty = duty + round;
                cmd.set_speed_setting(HWMON, "fan1", &SettingRequest::Fixed { duty: duty.into() })
                    .unwrap();
            }
            let active = cmd.controller(HWMON, "fan1").unwrap().setting();
            assert_eq!(active, Setting::Fixed { duty: 70 + round });

            let persisted = || {
                settings::load_settings_from(&path)
                    .ok()
                    .and_then(|s| s.applied_for(HWMON, "fan1").cloned())
            };
            assert!(wait_until(|| persisted().as_ref() == Some(&active)).await);
            // Nothing older lands afterwards
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            assert_eq!(persisted(), Some(active), "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_invalid_request_keeps_previous_setting() {
        let h = Harness::new();
        let cmd = commander(&h);
        cmd.set_speed_setting(KRAKEN, "pump", &SettingRequest::Fixed { duty: 60 })
            .unwrap();

        // Below the pump minimum of 20
        assert!(cmd
            .set_speed_setting(KRAKEN, "pump", &SettingRequest::Fixed { duty: 10 })
            .is_err());
        // Liquid curve above the cooler's 60°C limit
        let request = SettingRequest::Profile {
            temps: vec![30.0, 70.0],
            duties: vec![30, 100],
            temp_source: TempSourceRef::new(KRAKEN, "liquid"),
        };
        assert!(cmd.set_speed_setting(KRAKEN, "pump", &request).is_err());

        assert_eq!(
            cmd.controller(KRAKEN, "pump").unwrap().setting(),
            Setting::Fixed { duty: 60 }
        );
    }

    #[tokio::test]
    async fn test_read_only_hwmon_is_rejected_before_any_change() {
        let h = Harness::new();
        let cmd = commander(&h);
        h.dispatcher
            .block(HWMON, DispatchError::ReadOnlyBlocked("nct6798".into()));

        let err = cmd
            .set_speed_setting(HWMON, "fan1", &SettingRequest::Fixed { duty: 50 })
            .unwrap_err();
        assert!(matches!(err, CoolantError::Dispatch(DispatchError::ReadOnlyBlocked(_))));
        assert!(!h.scheduler.is_scheduled(&JobKey::new(HWMON, "fan1")));
        assert_eq!(cmd.controller(HWMON, "fan1").unwrap().setting(), Setting::None);
    }

    #[tokio::test]
    async fn test_temp_source_must_exist_and_be_allowed() {
        let h = Harness::new();
        let mut devices = (*h.devices).clone();
        let mut locked = (*devices[&HWMON]).clone();
        if let Some(channel) = locked.info.channels.get_mut("fan2") {
            if let Some(options) = channel.speed_options.as_mut() {
                options.external_temp_enabled = false;
            }
        }
        devices.insert(HWMON, Arc::new(locked));
        let mut ctx = h.context();
        ctx.devices = Arc::new(devices);
        let cmd = DeviceCommander::new(ctx, Arc::new(HistoryRegistry::default()));

        assert!(cmd
            .set_speed_setting(HWMON, "fan1", &profile_request(DeviceId(42), "cpu"))
            .is_err());
        assert!(cmd
            .set_speed_setting(HWMON, "fan2", &profile_request(KRAKEN, "liquid"))
            .is_err());
        cmd.set_speed_setting(HWMON, "fan1", &profile_request(KRAKEN, "liquid"))
            .unwrap();
        assert_eq!(
            cmd.controller(HWMON, "fan1").unwrap().state(),
            ControlState::ProfileScheduled
        );
    }

    #[tokio::test]
    async fn test_clear_channel_setting() {
        let h = Harness::new();
        let cmd = commander(&h);
        assert!(!cmd.clear_channel_setting(KRAKEN, "fan"));
        assert!(!cmd.clear_channel_setting(DeviceId(77), "fan"));

        h.temps.set(KRAKEN, "liquid", 35.0);
        cmd.set_speed_setting(HWMON, "fan2", &profile_request(KRAKEN, "liquid"))
            .unwrap();
        assert!(cmd.clear_channel_setting(HWMON, "fan2"));
        assert_eq!(cmd.controller(HWMON, "fan2").unwrap().state(), ControlState::Idle);
    }

    #[tokio::test]
    async fn test_lighting_is_validated_and_dispatched() {
        let h = Harness::new();
        let cmd = commander(&h);
        let mut lighting = LightingSetting {
            mode: "fixed".into(),
            speed: None,
            backwards: false,
            colors: vec![[255, 0, 0], [0, 0, 255]],
        };
        assert!(cmd.set_lighting(KRAKEN, "ring", lighting.clone()).is_err());

        lighting.colors.truncate(1);
        cmd.set_lighting(KRAKEN, "ring", lighting.clone()).unwrap();
        assert!(wait_until(|| h.dispatcher.writes_to("ring") == vec![DispatchValue::Lighting(lighting.clone())]).await);
        assert!(wait_until(|| !h.notifier.outcomes_for("ring").is_empty()).await);
        assert!(matches!(h.notifier.outcomes_for("ring")[0], ApplyOutcome::Applied(_)));
    }

    #[tokio::test]
    async fn test_reinitialize_reapplies_settings() {
        let h = Harness::new();
        let cmd = commander(&h);
        cmd.set_speed_setting(KRAKEN, "fan", &SettingRequest::Fixed { duty: 55 })
            .unwrap();
        assert!(wait_until(|| h.dispatcher.duties_to("fan") == vec![55]).await);

        // The kraken and the sensor package
        assert_eq!(cmd.reinitialize_devices().unwrap(), 2);
        assert!(wait_until(|| h.dispatcher.reinitialized.lock().len() == 2).await);
        assert!(h.dispatcher.reinitialized.lock().contains(&KRAKEN));
        assert!(wait_until(|| h.dispatcher.duties_to("fan") == vec![55, 55]).await);
        // hwmon chips are left alone
        assert!(h.dispatcher.duties_to("fan1").is_empty());
    }

    #[tokio::test]
    async fn test_restore_skips_vanished_channels() {
        let h = Harness::new();
        let cmd = commander(&h);
        let saved = vec![
            AppliedSetting {
                device_id: HWMON,
                channel: "fan1".into(),
                setting: Setting::Fixed { duty: 70 },
            },
            AppliedSetting {
                device_id: DeviceId(77),
                channel: "fan1".into(),
                setting: Setting::Fixed { duty: 70 },
            },
            AppliedSetting {
                device_id: KRAKEN,
                channel: "pump".into(),
                setting: Setting::Fixed { duty: 5 },
            },
        ];
        assert_eq!(cmd.restore(&saved), 1);
        assert!(wait_until(|| h.dispatcher.duties_to("fan1") == vec![70]).await);
    }
}
