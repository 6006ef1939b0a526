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

//! Coolant - cooling device control scheduler for Linux
//!
//! Turns fixed duties, duty profiles and lighting settings into timed
//! hardware writes. The pure model lives in `cl_core`; this crate adds the
//! job scheduler, per-channel controllers, the poll tick and the hwmon
//! adapter.

pub mod commander;
pub mod controller;
pub mod dispatch;
pub mod hwmon;
pub mod logger;
pub mod poller;
pub mod scheduler;
pub mod sources;

#[cfg(test)]
pub mod test_utils;
