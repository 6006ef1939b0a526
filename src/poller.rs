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

//! Poll tick
//!
//! Every interval each device is polled on the blocking pool, its sample is
//! appended to the history, and the composite device gets a sample derived
//! from all the others.
//!
//! # Error handling
//! - A failing device does not stop the others
//! - Repeated failures are logged on the first and every Nth occurrence

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use cl_core::constants::{composite, errors::MAX_CONSECUTIVE_ERRORS};
use cl_core::{Device, DeviceId, DeviceInfo, DeviceKind, HistoryRegistry, Status};
use cl_error::Result;

/// Produces status samples for one device
///
/// `poll` blocks; the loop calls it on the blocking pool.
pub trait StatusPoller: Send + Sync {
    fn device_id(&self) -> DeviceId;
    fn poll(&self) -> Result<Status>;
}

/// The virtual device aggregating every other device's temperatures
pub fn composite_device(id: DeviceId) -> Device {
    Device::new(id, DeviceKind::VirtualAggregate, composite::DEVICE_NAME, DeviceInfo::default())
}

/// Derive the composite sample from the samples of one tick
///
/// Returns `None` when no finite temperature was read.
pub fn composite_status(id: DeviceId, timestamp: DateTime<Utc>, statuses: &[Status]) -> Option<Status> {
    let temps: Vec<f64> = statuses
        .iter()
        .filter(|s| s.device_id != id)
        .flat_map(|s| s.temps.iter().map(|t| t.value))
        .filter(|v| v.is_finite())
        .collect();
    if temps.is_empty() {
        return None;
    }
    let avg = temps.iter().sum::<f64>() / temps.len() as f64;
    Some(Status::new(id, timestamp).with_temp(composite::AVERAGE_ALL, (avg * 100.0).round() / 100.0))
}

/// Drives the poll tick
pub struct PollLoop {
    pollers: Vec<Arc<dyn StatusPoller>>,
    registry: Arc<HistoryRegistry>,
    composite: Option<DeviceId>,
    interval: Duration,
    failures: HashMap<DeviceId, u32>,
}

impl PollLoop {
    pub fn new(pollers: Vec<Arc<dyn StatusPoller>>, registry: Arc<HistoryRegistry>, interval: Duration) -> Self {
        Self {
            pollers,
            registry,
            composite: None,
            interval,
            failures: HashMap::new(),
        }
    }

    /// Also feed the composite device (must be registered in the history)
    pub fn with_composite(mut self, id: DeviceId) -> Self {
        self.composite = Some(id);
        self
    }

    /// Poll every device once and append the samples
    pub async fn tick(&mut self) -> Vec<Status> {
        let mut collected = Vec::with_capacity(self.pollers.len() + 1);

        for poller in &self.pollers {
            let device_id = poller.device_id();
            let p = poller.clone();
            let result = match tokio::task::spawn_blocking(move || p.poll()).await {
                Ok(r) => r,
                Err(e) => Err(cl_error::CoolantError::generic(format!("poll task failed: {}", e))),
            };

            match result.and_then(|status| {
                self.registry.append(status.clone())?;
                Ok(status)
            }) {
                Ok(status) => {
                    if let Some(count) = self.failures.remove(&device_id) {
                        info!(device = %device_id, "Polling recovered after {} errors", count);
                    }
                    collected.push(status);
                }
                Err(e) => {
                    let count = self.failures.entry(device_id).or_insert(0);
                    *count += 1;
                    if *count == 1 || *count % MAX_CONSECUTIVE_ERRORS == 0 {
                        warn!(device = %device_id, "Status poll failed (count: {}): {}", count, e);
                    }
                }
            }
        }

        if let Some(id) = self.composite {
            if let Some(status) = composite_status(id, Utc::now(), &collected) {
                match self.registry.append(status.clone()) {
                    Ok(()) => collected.push(status),
                    Err(e) => debug!(device = %id, "Composite sample dropped: {}", e),
                }
            }
        }
        collected
    }

    /// Tick until `shutdown` is set; `wake` interrupts the sleep
    pub async fn run(mut self, shutdown: Arc<AtomicBool>, wake: Arc<Notify>) {
        info!("Poll loop starting ({} devices, every {:?})", self.pollers.len(), self.interval);
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let samples = self.tick().await;
            if samples.is_empty() && !self.pollers.is_empty() {
                error!("No device produced a status sample this tick");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = wake.notified() => {
                    debug!("Poll loop woken up");
                }
            }
        }
        info!("Poll loop stopped");
    }
}
