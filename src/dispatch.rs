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

//! Seams to the outside world: hardware writes, apply notifications and
//! settings persistence.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use cl_core::settings;
use cl_core::{DeviceId, DispatchValue, Setting};
use cl_error::DispatchError;

use crate::logger;
use crate::scheduler::JobKey;

/// Performs the actual hardware write
///
/// Implementations block; callers run them on the blocking pool.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceDispatcher: Send + Sync {
    /// Write a value to one channel of a device
    fn write(&self, device_id: DeviceId, channel: &str, value: &DispatchValue) -> Result<(), DispatchError>;

    /// Whether the device currently accepts writes
    ///
    /// Fails with `DeviceUnreachable` or `ReadOnlyBlocked` when it doesn't.
    fn check_writable(&self, device_id: DeviceId) -> Result<(), DispatchError>;

    /// Whether the device was found read-only at discovery
    ///
    /// Answers from cached state without touching the hardware.
    fn is_read_only(&self, device_id: DeviceId) -> bool;

    /// Ask the driver to reinitialize the device
    fn reinitialize(&self, device_id: DeviceId) -> Result<(), DispatchError>;
}

/// Check writability and write on the blocking pool
pub async fn dispatch_blocking(
    dispatcher: Arc<dyn DeviceDispatcher>,
    device_id: DeviceId,
    channel: String,
    value: DispatchValue,
) -> Result<(), DispatchError> {
    tokio::task::spawn_blocking(move || {
        dispatcher.check_writable(device_id)?;
        dispatcher.write(device_id, &channel, &value)
    })
    .await
    .map_err(|e| DispatchError::Aborted(e.to_string()))?
}

/// Result of applying something to a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Value written to the device
    Applied(String),
    /// Scheduled setting removed
    Removed,
    /// Nothing written (device unreachable or read-only)
    Skipped(String),
    /// Write failed
    Failed(String),
}

impl ApplyOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ApplyOutcome::Failed(_))
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyOutcome::Applied(what) => write!(f, "applied {}", what),
            ApplyOutcome::Removed => f.write_str("removed"),
            ApplyOutcome::Skipped(why) => write!(f, "skipped: {}", why),
            ApplyOutcome::Failed(why) => write!(f, "failed: {}", why),
        }
    }
}

/// Receives apply outcomes (UI toasts, event log, ...)
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn settings_applied(&self, device_id: DeviceId, channel: &str, outcome: &ApplyOutcome);
}

/// Notifier writing to tracing and the JSON event log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn settings_applied(&self, device_id: DeviceId, channel: &str, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied(_) => debug!(device = %device_id, channel, "{}", outcome),
            ApplyOutcome::Removed => info!(device = %device_id, channel, "Setting removed"),
            ApplyOutcome::Skipped(_) | ApplyOutcome::Failed(_) => {
                warn!(device = %device_id, channel, "{}", outcome)
            }
        }
        logger::log_event(
            "settings_applied",
            json!({
                "device": device_id.0,
                "channel": channel,
                "outcome": outcome.to_string(),
            }),
        );
    }
}

/// Stores the setting applied to a channel
#[cfg_attr(test, mockall::automock)]
pub trait SettingsPersistence: Send + Sync {
    fn save_applied(&self, device_id: DeviceId, channel: &str, setting: &Setting) -> cl_error::Result<()>;
}

/// Persists applied settings into the JSON settings file
#[derive(Debug)]
pub struct JsonSettingsPersistence {
    path: PathBuf,
    // Load-modify-save must not interleave
    lock: Mutex<()>,
}

impl JsonSettingsPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Persistence at the default settings location
    pub fn default_location() -> cl_error::Result<Self> {
        Ok(Self::new(settings::get_settings_path()?))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl SettingsPersistence for JsonSettingsPersistence {
    fn save_applied(&self, device_id: DeviceId, channel: &str, setting: &Setting) -> cl_error::Result<()> {
        let _guard = self.lock.lock();
        settings::update_settings_at(&self.path, |s| s.record_applied(device_id, channel, setting))?;
        Ok(())
    }
}

/// Saves applied settings in the order they were applied
///
/// A ticket is drawn while the setting is applied; saves then run on the
/// blocking pool in whatever order they get scheduled. A save that finds a
/// later ticket of the same channel already handled is dropped, so the stored
/// setting is always the last one applied.
pub struct OrderedSaves {
    persistence: Arc<dyn SettingsPersistence>,
    next: AtomicU64,
    // Latest ticket handled per channel; held across the save
    handled: Mutex<HashMap<JobKey, u64>>,
}

impl OrderedSaves {
    pub fn new(persistence: Arc<dyn SettingsPersistence>) -> Self {
        Self {
            persistence,
            next: AtomicU64::new(0),
            handled: Mutex::new(HashMap::new()),
        }
    }

    /// Next ticket; draw it in the same critical section that applied the setting
    pub fn ticket(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Save `setting` unless a later ticket of the channel was already handled
    ///
    /// Returns whether the save was attempted.
    pub fn save(&self, ticket: u64, device_id: DeviceId, channel: &str, setting: &Setting) -> cl_error::Result<bool> {
        let key = JobKey::new(device_id, channel);
        let mut handled = self.handled.lock();
        if handled.get(&key).is_some_and(|&latest| latest > ticket) {
            debug!(job = %key, ticket, "Dropping superseded settings save");
            return Ok(false);
        }
        // A failed save still supersedes older ones
        handled.insert(key, ticket);
        self.persistence.save_applied(device_id, channel, setting)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(ApplyOutcome::Applied("42%".into()).to_string(), "applied 42%");
        assert_eq!(ApplyOutcome::Removed.to_string(), "removed");
        assert!(ApplyOutcome::Failed("io".into()).is_failure());
        assert!(!ApplyOutcome::Skipped("ro".into()).is_failure());
    }

    #[test]
    fn test_json_persistence_records_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JsonSettingsPersistence::new(dir.path().join("settings.json"));

        persistence
            .save_applied(DeviceId(4), "fan2", &Setting::Fixed { duty: 35 })
            .unwrap();
        let loaded = settings::load_settings_from(persistence.path()).unwrap();
        assert_eq!(
            loaded.applied_for(DeviceId(4), "fan2"),
            Some(&Setting::Fixed { duty: 35 })
        );

        persistence.save_applied(DeviceId(4), "fan2", &Setting::None).unwrap();
        let loaded = settings::load_settings_from(persistence.path()).unwrap();
        assert!(loaded.applied.is_empty());
    }

    #[derive(Default)]
    struct RecordingPersistence {
        saved: Mutex<Vec<(String, Setting)>>,
    }

    impl SettingsPersistence for RecordingPersistence {
        fn save_applied(&self, _device_id: DeviceId, channel: &str, setting: &Setting) -> cl_error::Result<()> {
            self.saved.lock().push((channel.to_string(), setting.clone()));
            Ok(())
        }
    }

    #[test]
    fn test_ordered_saves_drop_superseded() {
        let persistence = Arc::new(RecordingPersistence::default());
        let saves = OrderedSaves::new(persistence.clone());
        let first = saves.ticket();
        let second = saves.ticket();
        let other = saves.ticket();

        assert!(saves.save(second, DeviceId(2), "fan1", &Setting::Fixed { duty: 70 }).unwrap());
        assert!(!saves.save(first, DeviceId(2), "fan1", &Setting::Fixed { duty: 30 }).unwrap());
        // Tickets are compared per channel
        assert!(saves.save(other, DeviceId(2), "fan2", &Setting::None).unwrap());

        assert_eq!(
            *persistence.saved.lock(),
            vec![
                ("fan1".to_string(), Setting::Fixed { duty: 70 }),
                ("fan2".to_string(), Setting::None),
            ]
        );
    }
}
