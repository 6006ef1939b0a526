/*
 * Test utilities and fakes for Coolant
 *
 * Devices, a recording dispatcher, a settable temperature source and a
 * recording notifier shared by the unit tests of the scheduler stack.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use cl_core::{
    ChannelInfo, Device, DeviceId, DeviceInfo, DeviceKind, DispatchValue, LightingMode,
    SpeedOptions, TempSourceRef,
};
use cl_error::{CoolantError, DispatchError, Result};

use crate::controller::{ControllerConfig, ControllerContext, DeviceMap};
use crate::dispatch::{ApplyOutcome, DeviceDispatcher, Notifier};
use crate::scheduler::JobScheduler;
use crate::sources::TemperatureSource;

pub const KRAKEN: DeviceId = DeviceId(1);
pub const HWMON: DeviceId = DeviceId(2);
pub const SENSORS: DeviceId = DeviceId(3);

/// Liquid cooler evaluating profiles natively on its liquid sensor
pub fn kraken_device() -> Device {
    let mut info = DeviceInfo {
        temp_min: Some(20.0),
        temp_max: Some(60.0),
        profile_max_length: 9,
        temp_ext_available: true,
        lighting_speeds: vec!["slow".into(), "normal".into(), "fast".into()],
        ..DeviceInfo::default()
    };
    info.channels.insert(
        "pump".into(),
        ChannelInfo::speed(SpeedOptions {
            min_duty: 20,
            max_duty: 100,
            external_temp_enabled: true,
            ..SpeedOptions::default()
        }),
    );
    info.channels.insert(
        "fan".into(),
        ChannelInfo::speed(SpeedOptions {
            external_temp_enabled: true,
            ..SpeedOptions::default()
        }),
    );
    info.channels.insert(
        "ring".into(),
        ChannelInfo::lighting(vec![LightingMode {
            name: "fixed".into(),
            frontend_name: "Fixed".into(),
            min_colors: 1,
            max_colors: 1,
            speed_enabled: false,
            backward_enabled: false,
        }]),
    );
    Device::new(KRAKEN, DeviceKind::DriverManaged, "NZXT Kraken X63", info)
}

/// Motherboard chip whose curves we evaluate ourselves
pub fn hwmon_device() -> Device {
    let mut info = DeviceInfo::default();
    for name in ["fan1", "fan2"] {
        info.channels.insert(
            name.into(),
            ChannelInfo::speed(SpeedOptions {
                manual_profiles_enabled: true,
                external_temp_enabled: true,
                ..SpeedOptions::default()
            }),
        );
    }
    Device::new(HWMON, DeviceKind::Hwmon, "nct6798", info)
}

/// Monitored-only package sensor with jittery readings
pub fn sensor_device() -> Device {
    let info = DeviceInfo {
        temp_ext_available: true,
        smoothed: true,
        ..DeviceInfo::default()
    };
    Device::new(SENSORS, DeviceKind::DriverManaged, "k10temp", info)
}

pub fn device_map(devices: &[Device]) -> Arc<DeviceMap> {
    Arc::new(devices.iter().map(|d| (d.id, Arc::new(d.clone()))).collect())
}

/// A dispatcher remembering every write
#[derive(Default)]
pub struct RecordingDispatcher {
    pub writes: Mutex<Vec<(DeviceId, String, DispatchValue)>>,
    pub reinitialized: Mutex<Vec<DeviceId>>,
    /// Per-device writability override
    pub blocked: Mutex<HashMap<DeviceId, DispatchError>>,
    /// Remaining writes that fail
    pub failures: Mutex<u32>,
    pub delay: Mutex<Option<Duration>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes_to(&self, channel: &str) -> Vec<DispatchValue> {
        self.writes
            .lock()
            .iter()
            .filter(|(_, ch, _)| ch == channel)
            .map(|(_, _, v)| v.clone())
            .collect()
    }

    pub fn duties_to(&self, channel: &str) -> Vec<u8> {
        self.writes_to(channel)
            .into_iter()
            .filter_map(|v| match v {
                DispatchValue::Duty(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn block(&self, device_id: DeviceId, err: DispatchError) {
        self.blocked.lock().insert(device_id, err);
    }

    pub fn unblock(&self, device_id: DeviceId) {
        self.blocked.lock().remove(&device_id);
    }

    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

impl DeviceDispatcher for RecordingDispatcher {
    fn write(&self, device_id: DeviceId, channel: &str, value: &DispatchValue) -> std::result::Result<(), DispatchError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(DispatchError::write_failed(device_id.to_string(), channel, "simulated"));
            }
        }
        self.writes
            .lock()
            .push((device_id, channel.to_string(), value.clone()));
        Ok(())
    }

    fn check_writable(&self, device_id: DeviceId) -> std::result::Result<(), DispatchError> {
        match self.blocked.lock().get(&device_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn is_read_only(&self, device_id: DeviceId) -> bool {
        matches!(self.blocked.lock().get(&device_id), Some(DispatchError::ReadOnlyBlocked(_)))
    }

    fn reinitialize(&self, device_id: DeviceId) -> std::result::Result<(), DispatchError> {
        self.reinitialized.lock().push(device_id);
        Ok(())
    }
}

/// Temperature source returning whatever the test set last
#[derive(Default)]
pub struct ManualTemperatures {
    values: Mutex<HashMap<TempSourceRef, f64>>,
}

impl ManualTemperatures {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, device_id: DeviceId, sensor: &str, value: f64) {
        self.values
            .lock()
            .insert(TempSourceRef::new(device_id, sensor), value);
    }
}

impl TemperatureSource for ManualTemperatures {
    fn read(&self, source: &TempSourceRef) -> Result<f64> {
        self.values.lock().get(source).copied().ok_or_else(|| {
            CoolantError::temperature_read(source.device_id.to_string(), source.sensor.clone(), "not set")
        })
    }
}

/// Notifier collecting outcomes
#[derive(Default)]
pub struct RecordingNotifier {
    pub outcomes: Mutex<Vec<(DeviceId, String, ApplyOutcome)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn outcomes_for(&self, channel: &str) -> Vec<ApplyOutcome> {
        self.outcomes
            .lock()
            .iter()
            .filter(|(_, ch, _)| ch == channel)
            .map(|(_, _, o)| o.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn settings_applied(&self, device_id: DeviceId, channel: &str, outcome: &ApplyOutcome) {
        self.outcomes
            .lock()
            .push((device_id, channel.to_string(), outcome.clone()));
    }
}

/// Everything a controller test needs, with a fast poll interval
pub struct Harness {
    pub scheduler: Arc<JobScheduler>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub temps: Arc<ManualTemperatures>,
    pub notifier: Arc<RecordingNotifier>,
    pub devices: Arc<DeviceMap>,
}

impl Harness {
    pub fn new() -> Self {
        let scheduler = Arc::new(JobScheduler::new(Handle::current()));
        scheduler.start();
        Self {
            scheduler,
            dispatcher: RecordingDispatcher::new(),
            temps: ManualTemperatures::new(),
            notifier: RecordingNotifier::new(),
            devices: device_map(&[kraken_device(), hwmon_device(), sensor_device()]),
        }
    }

    pub fn config() -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_millis(10),
            ..ControllerConfig::default()
        }
    }

    pub fn context(&self) -> ControllerContext {
        ControllerContext {
            scheduler: self.scheduler.clone(),
            dispatcher: self.dispatcher.clone(),
            temperatures: self.temps.clone(),
            notifier: self.notifier.clone(),
            devices: self.devices.clone(),
            config: Self::config(),
        }
    }

    pub fn device(&self, id: DeviceId) -> Arc<Device> {
        self.devices[&id].clone()
    }
}

/// Poll `cond` until it holds or a second passes
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
