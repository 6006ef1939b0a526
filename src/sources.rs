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

//! Temperature sources for profile evaluation

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use cl_core::{HistoryRegistry, TempSourceRef};
use cl_error::{CoolantError, Result};

/// Latest temperature of a (device, sensor) pair
pub trait TemperatureSource: Send + Sync {
    fn read(&self, source: &TempSourceRef) -> Result<f64>;
}

/// Reads the newest sample in the device history
#[derive(Debug, Clone)]
pub struct HistoryTemperatureSource {
    registry: Arc<HistoryRegistry>,
    /// Samples older than this are treated as missing
    max_age: Option<Duration>,
}

impl HistoryTemperatureSource {
    pub fn new(registry: Arc<HistoryRegistry>) -> Self {
        Self {
            registry,
            max_age: None,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

impl TemperatureSource for HistoryTemperatureSource {
    fn read(&self, source: &TempSourceRef) -> Result<f64> {
        let fail = |reason: &str| {
            CoolantError::temperature_read(source.device_id.to_string(), source.sensor.clone(), reason)
        };

        let status = self
            .registry
            .latest(source.device_id)
            .ok_or_else(|| fail("no status sample yet"))?;

        if let Some(max_age) = self.max_age {
            let age = (Utc::now() - status.timestamp).to_std().unwrap_or(Duration::ZERO);
            if age > max_age {
                return Err(fail(&format!("latest sample is {:.1}s old", age.as_secs_f64())));
            }
        }

        let value = status.temp(&source.sensor).ok_or_else(|| fail("sensor not in status"))?;
        if !value.is_finite() {
            return Err(fail("reading is not a number"));
        }
        Ok(value)
    }
}
