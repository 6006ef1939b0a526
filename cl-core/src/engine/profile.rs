//! Duty profile engine
//!
//! A `DutyProfile` is an immutable, validated piecewise-linear mapping from
//! temperature to duty. It can only be obtained through [`DutyProfile::build`]
//! (or deserialization, which runs the same checks), so every instance holds
//! at least one breakpoint, strictly increasing temperatures and duties
//! within 0-100.

use serde::{Deserialize, Serialize};

use cl_error::ValidationError;

use crate::constants::{duty, profile};

/// A single breakpoint of a duty profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    pub temp: f64,
    pub duty: u8,
}

/// Validated piecewise-linear temperature to duty curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ProfilePoint>", into = "Vec<ProfilePoint>")]
pub struct DutyProfile {
    points: Vec<ProfilePoint>,
}

impl DutyProfile {
    /// Build a profile from parallel temperature and duty sequences
    ///
    /// # Arguments
    /// * `temps` - breakpoint temperatures in °C, strictly increasing
    /// * `duties` - breakpoint duties, each within 0-100
    /// * `max_points` - the device's profile length limit
    pub fn build(temps: &[f64], duties: &[i32], max_points: usize) -> Result<Self, ValidationError> {
        if temps.len() != duties.len() {
            return Err(ValidationError::InvalidCurve(format!(
                "{} temperatures but {} duties",
                temps.len(),
                duties.len()
            )));
        }
        if temps.is_empty() {
            return Err(ValidationError::InvalidCurve(
                "curve must have at least one point".into(),
            ));
        }
        let limit = max_points.min(profile::HARD_MAX_LENGTH);
        if temps.len() > limit {
            return Err(ValidationError::TooManyPoints {
                count: temps.len(),
                max: limit,
            });
        }

        let mut points = Vec::with_capacity(temps.len());
        let mut last_temp = f64::NEG_INFINITY;
        for (&temp, &d) in temps.iter().zip(duties) {
            if !temp.is_finite() {
                return Err(ValidationError::InvalidCurve(
                    "temperature must be finite".into(),
                ));
            }
            if temp <= last_temp {
                return Err(ValidationError::InvalidCurve(format!(
                    "temperatures must be strictly increasing ({} after {})",
                    temp, last_temp
                )));
            }
            if d < duty::MIN_PERCENT as i32 || d > duty::MAX_PERCENT as i32 {
                return Err(ValidationError::DutyOutOfRange {
                    duty: d,
                    min: duty::MIN_PERCENT,
                    max: duty::MAX_PERCENT,
                });
            }
            last_temp = temp;
            points.push(ProfilePoint { temp, duty: d as u8 });
        }

        Ok(Self { points })
    }

    /// Build from `(temp, duty)` pairs
    pub fn from_pairs(pairs: &[(f64, i32)], max_points: usize) -> Result<Self, ValidationError> {
        let (temps, duties): (Vec<f64>, Vec<i32>) = pairs.iter().copied().unzip();
        Self::build(&temps, &duties, max_points)
    }

    /// Duty for a temperature, clamped to the channel's `[min_duty, max_duty]`
    ///
    /// - Below the first breakpoint: the first duty
    /// - Above the last breakpoint: the last duty
    /// - Between breakpoints: linear interpolation rounded to the nearest integer
    pub fn evaluate(&self, temp: f64, min_duty: u8, max_duty: u8) -> u8 {
        let raw = self.interpolate(temp);
        let (lo, hi) = if min_duty <= max_duty {
            (min_duty as f64, max_duty as f64)
        } else {
            (max_duty as f64, min_duty as f64)
        };
        raw.round().clamp(lo, hi) as u8
    }

    fn interpolate(&self, temp: f64) -> f64 {
        // Non-empty by construction
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];

        if temp.is_nan() || temp >= last.temp {
            return last.duty as f64;
        }
        if temp <= first.temp {
            return first.duty as f64;
        }

        for window in self.points.windows(2) {
            let lower = window[0];
            let upper = window[1];
            if temp >= lower.temp && temp <= upper.temp {
                let span = upper.temp - lower.temp;
                if span.abs() < profile::FLOAT_EPSILON {
                    return lower.duty as f64;
                }
                let ratio = (temp - lower.temp) / span;
                return lower.duty as f64 + ratio * (upper.duty as f64 - lower.duty as f64);
            }
        }

        last.duty as f64
    }

    /// Reject breakpoints outside the temperature range a device accepts
    pub fn check_temp_range(&self, min: Option<f64>, max: Option<f64>) -> Result<(), ValidationError> {
        let lo = min.unwrap_or(f64::NEG_INFINITY);
        let hi = max.unwrap_or(f64::INFINITY);
        match self.points.iter().find(|p| p.temp < lo || p.temp > hi) {
            Some(p) => Err(ValidationError::TemperatureOutOfRange {
                temp: p.temp,
                min: lo,
                max: hi,
            }),
            None => Ok(()),
        }
    }

    pub fn points(&self) -> &[ProfilePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false, kept for clippy's `len_without_is_empty`
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Breakpoints as `(temp, duty)` pairs, the form drivers take
    pub fn to_pairs(&self) -> Vec<(f64, u8)> {
        self.points.iter().map(|p| (p.temp, p.duty)).collect()
    }
}

impl TryFrom<Vec<ProfilePoint>> for DutyProfile {
    type Error = ValidationError;

    fn try_from(points: Vec<ProfilePoint>) -> Result<Self, Self::Error> {
        let (temps, duties): (Vec<f64>, Vec<i32>) =
            points.iter().map(|p| (p.temp, p.duty as i32)).unzip();
        Self::build(&temps, &duties, profile::HARD_MAX_LENGTH)
    }
}

impl From<DutyProfile> for Vec<ProfilePoint> {
    fn from(profile: DutyProfile) -> Self {
        profile.points
    }
}
