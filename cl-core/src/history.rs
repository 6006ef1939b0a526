//! Status history
//!
//! Every device keeps a chronological, age-evicted buffer of its status
//! samples. Derived series (temperatures and duties by name) are cached and
//! only rebuilt for the samples added since the last read.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use cl_error::{CoolantError, Result};

use crate::constants::timing;
use crate::data::{Device, DeviceId, Status};
use crate::engine::Smoother;

/// Named series, one entry per retained sample
pub type Series = BTreeMap<String, Vec<Option<f64>>>;

#[derive(Debug, Default)]
struct SeriesCache {
    /// Number of leading samples mirrored in the series below
    synced: usize,
    temps: BTreeMap<String, VecDeque<Option<f64>>>,
    duties: BTreeMap<String, VecDeque<Option<f64>>>,
    smoother: Smoother,
}

impl SeriesCache {
    fn pop_front(&mut self) {
        if self.synced == 0 {
            return;
        }
        for series in self.temps.values_mut().chain(self.duties.values_mut()) {
            series.pop_front();
        }
        self.synced -= 1;
    }

    fn sync(&mut self, samples: &VecDeque<Status>) {
        for sample in samples.iter().skip(self.synced) {
            let index = self.synced;
            for reading in &sample.temps {
                let value = if reading.value.is_finite() {
                    Some(self.smoother.smooth(&reading.name, reading.value))
                } else {
                    None
                };
                push_aligned(&mut self.temps, &reading.name, index, value);
            }
            for reading in &sample.channels {
                let key = format!("{} duty", reading.name);
                let value = reading.duty.map(|d| self.smoother.smooth(&key, d));
                push_aligned(&mut self.duties, &reading.name, index, value);
            }
            self.synced += 1;
            // Series the sample didn't mention still get their slot
            for series in self.temps.values_mut().chain(self.duties.values_mut()) {
                if series.len() < self.synced {
                    series.push_back(None);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.synced = 0;
        self.temps.clear();
        self.duties.clear();
        self.smoother.clear();
    }
}

fn push_aligned(
    map: &mut BTreeMap<String, VecDeque<Option<f64>>>,
    name: &str,
    index: usize,
    value: Option<f64>,
) {
    let series = map.entry(name.to_string()).or_insert_with(|| {
        // First appearance: backfill earlier samples
        let mut fresh = VecDeque::with_capacity(index + 1);
        fresh.resize(index, None);
        fresh
    });
    if series.len() == index {
        series.push_back(value);
    }
}

fn to_vecs(map: &BTreeMap<String, VecDeque<Option<f64>>>) -> Series {
    map.iter()
        .map(|(name, values)| (name.clone(), values.iter().copied().collect()))
        .collect()
}

/// Age of a sample at `now`; samples from the future have age zero
fn age_at(now: DateTime<Utc>, timestamp: DateTime<Utc>) -> Duration {
    (now - timestamp).to_std().unwrap_or(Duration::ZERO)
}

/// Chronological status samples of a single device
#[derive(Debug)]
pub struct HistoryBuffer {
    device_id: DeviceId,
    retention: Duration,
    samples: VecDeque<Status>,
    cache: Mutex<SeriesCache>,
}

impl HistoryBuffer {
    pub fn new(device_id: DeviceId, retention: Duration) -> Self {
        Self::with_smoother(device_id, retention, Smoother::disabled())
    }

    /// Buffer whose derived series are passed through `smoother`
    pub fn with_smoother(device_id: DeviceId, retention: Duration, smoother: Smoother) -> Self {
        Self {
            device_id,
            retention,
            samples: VecDeque::new(),
            cache: Mutex::new(SeriesCache {
                smoother,
                ..SeriesCache::default()
            }),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Append a sample and evict everything that fell out of retention
    ///
    /// Eviction is relative to the newest sample's timestamp, so a stalled
    /// poller does not empty the buffer. Samples older than the newest one
    /// already held are rejected.
    pub fn append(&mut self, sample: Status) -> Result<()> {
        if sample.device_id != self.device_id {
            return Err(CoolantError::InvalidSample(format!(
                "sample of device {} appended to history of {}",
                sample.device_id, self.device_id
            )));
        }
        if let Some(last) = self.samples.back() {
            if sample.timestamp < last.timestamp {
                return Err(CoolantError::InvalidSample(format!(
                    "out of order sample for {}: {} is older than {}",
                    self.device_id, sample.timestamp, last.timestamp
                )));
            }
        }
        let now = sample.timestamp;
        self.samples.push_back(sample);
        self.evict_older_than(now, self.retention);
        Ok(())
    }

    /// Drop samples whose age at `now` reached `retention`
    ///
    /// Returns how many samples were removed. Cached series lose the same
    /// leading entries so they stay aligned with the buffer.
    pub fn evict_older_than(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cache = self.cache.get_mut();
        let mut removed = 0;
        while let Some(front) = self.samples.front() {
            if age_at(now, front.timestamp) < retention {
                break;
            }
            self.samples.pop_front();
            cache.pop_front();
            removed += 1;
        }
        removed
    }

    /// Temperature series by sensor name
    pub fn temps(&self) -> Series {
        let mut cache = self.cache.lock();
        cache.sync(&self.samples);
        to_vecs(&cache.temps)
    }

    /// Duty series by channel name
    pub fn duties(&self) -> Series {
        let mut cache = self.cache.lock();
        cache.sync(&self.samples);
        to_vecs(&cache.duties)
    }

    /// A single temperature series
    pub fn temp_series(&self, sensor: &str) -> Option<Vec<Option<f64>>> {
        let mut cache = self.cache.lock();
        cache.sync(&self.samples);
        cache.temps.get(sensor).map(|s| s.iter().copied().collect())
    }

    /// Age of every sample in seconds at `now`
    pub fn ages_seconds(&self, now: DateTime<Utc>) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| age_at(now, s.timestamp).as_secs_f64())
            .collect()
    }

    pub fn latest(&self) -> Option<&Status> {
        self.samples.back()
    }

    /// Latest raw reading of one temperature sensor
    pub fn latest_temp(&self, sensor: &str) -> Option<f64> {
        self.latest().and_then(|s| s.temp(sensor))
    }

    pub fn samples(&self) -> impl Iterator<Item = &Status> + '_ {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.cache.get_mut().clear();
    }
}

/// Retention and smoothing parameters for new device histories
#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    pub retention: Duration,
    pub recent_window: Duration,
    pub smoothing_enabled: bool,
    pub smoothing_window: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention: timing::HISTORY_RETENTION,
            recent_window: timing::RECENT_WINDOW,
            smoothing_enabled: true,
            smoothing_window: crate::constants::smoothing::DEFAULT_WINDOW,
        }
    }
}

/// Long and recent history of one device
///
/// The long buffer holds raw series for the whole retention period; the
/// recent buffer covers the live window and is smoothed when the device
/// declares smoothed readings.
#[derive(Debug)]
pub struct DeviceHistory {
    pub long: HistoryBuffer,
    pub recent: HistoryBuffer,
}

impl DeviceHistory {
    pub fn new(device: &Device, config: &HistoryConfig) -> Self {
        let smoother = Smoother::for_device(device, config.smoothing_enabled, config.smoothing_window);
        Self {
            long: HistoryBuffer::new(device.id, config.retention),
            recent: HistoryBuffer::with_smoother(device.id, config.recent_window, smoother),
        }
    }

    pub fn append(&mut self, sample: Status) -> Result<()> {
        self.recent.append(sample.clone())?;
        self.long.append(sample)
    }

    pub fn latest(&self) -> Option<&Status> {
        self.long.latest()
    }
}

/// Histories of every known device
///
/// Each device history sits behind its own lock: the poll tick is the only
/// writer, controllers and display readers take read locks, and a reader
/// never sees a half-appended sample.
#[derive(Debug, Default)]
pub struct HistoryRegistry {
    config: HistoryConfig,
    devices: RwLock<HashMap<DeviceId, Arc<RwLock<DeviceHistory>>>>,
}

impl HistoryRegistry {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Create the history of a device (no-op when it already exists)
    pub fn register(&self, device: &Device) {
        self.devices.write().entry(device.id).or_insert_with(|| {
            debug!("Tracking history of {} ({})", device.id, device.kind);
            Arc::new(RwLock::new(DeviceHistory::new(device, &self.config)))
        });
    }

    pub fn remove(&self, device_id: DeviceId) -> bool {
        self.devices.write().remove(&device_id).is_some()
    }

    pub fn contains(&self, device_id: DeviceId) -> bool {
        self.devices.read().contains_key(&device_id)
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.read().keys().copied().collect();
        ids.sort();
        ids
    }

    fn get(&self, device_id: DeviceId) -> Option<Arc<RwLock<DeviceHistory>>> {
        self.devices.read().get(&device_id).cloned()
    }

    /// Append a sample to the history of its device
    pub fn append(&self, sample: Status) -> Result<()> {
        let Some(history) = self.get(sample.device_id) else {
            warn!("Dropping sample of unregistered device {}", sample.device_id);
            return Err(CoolantError::InvalidSample(format!(
                "no history registered for {}",
                sample.device_id
            )));
        };
        let mut guard = history.write();
        guard.append(sample)
    }

    /// Run `f` against a device history under a read lock
    pub fn with_history<R>(&self, device_id: DeviceId, f: impl FnOnce(&DeviceHistory) -> R) -> Option<R> {
        let history = self.get(device_id)?;
        let guard = history.read();
        Some(f(&guard))
    }

    pub fn latest(&self, device_id: DeviceId) -> Option<Status> {
        self.with_history(device_id, |h| h.latest().cloned()).flatten()
    }

    pub fn latest_temp(&self, device_id: DeviceId, sensor: &str) -> Option<f64> {
        self.with_history(device_id, |h| h.long.latest_temp(sensor))
            .flatten()
    }
}
