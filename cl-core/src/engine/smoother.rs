//! Moving average smoothing for fluctuating sensor series

use std::collections::{HashMap, VecDeque};

use crate::data::Device;

/// Bounded moving-average filter over named series
///
/// Each series keeps at most `2 * window` raw values; [`Smoother::smooth`]
/// returns the mean of the `window` most recent ones. A window of 0 disables
/// smoothing entirely and values pass through untouched.
#[derive(Debug, Clone, Default)]
pub struct Smoother {
    window: usize,
    /// Pass values through until a series holds more than `window` of them
    warm_up: bool,
    series: HashMap<String, VecDeque<f64>>,
}

impl Smoother {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            warm_up: false,
            series: HashMap::new(),
        }
    }

    /// A passthrough smoother
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Smoother for readings of `device`, honouring the user preference
    ///
    /// Smoothing only applies when the device declares its readings smoothed
    /// and the user has it enabled. Each series reports raw readings until
    /// more than `window` of them were seen.
    pub fn for_device(device: &Device, user_enabled: bool, window: usize) -> Self {
        if device.info.smoothed && user_enabled {
            Self {
                warm_up: true,
                ..Self::new(window)
            }
        } else {
            Self::disabled()
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn is_enabled(&self) -> bool {
        self.window > 0
    }

    /// Append a raw value to a series and return its current smoothed value
    pub fn smooth(&mut self, key: &str, value: f64) -> f64 {
        if self.window == 0 {
            return value;
        }
        let values = self.series.entry(key.to_string()).or_default();
        let settled = !self.warm_up || values.len() > self.window;
        values.push_back(value);
        while values.len() > self.window * 2 {
            values.pop_front();
        }
        if !settled {
            return value;
        }
        let taken = values.len().min(self.window);
        values.iter().rev().take(taken).sum::<f64>() / taken as f64
    }

    /// Forget the history of one series
    pub fn reset(&mut self, key: &str) {
        self.series.remove(key);
    }

    /// Forget every series
    pub fn clear(&mut self) {
        self.series.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DeviceId, DeviceInfo, DeviceKind};

    #[test]
    fn test_window_zero_is_passthrough() {
        let mut smoother = Smoother::new(0);
        for v in [12.0, 99.5, -3.25, 40.0, 40.0, f64::MAX] {
            assert_eq!(smoother.smooth("cpu", v), v);
        }
    }

    #[test]
    fn test_mean_of_recent_window() {
        let mut smoother = Smoother::new(2);
        assert_eq!(smoother.smooth("cpu", 40.0), 40.0);
        assert_eq!(smoother.smooth("cpu", 50.0), 45.0);
        assert_eq!(smoother.smooth("cpu", 60.0), 55.0);
        assert_eq!(smoother.smooth("cpu", 60.0), 60.0);
    }

    #[test]
    fn test_series_are_independent() {
        let mut smoother = Smoother::new(2);
        smoother.smooth("cpu", 80.0);
        assert_eq!(smoother.smooth("gpu", 30.0), 30.0);
        assert_eq!(smoother.smooth("cpu", 60.0), 70.0);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut smoother = Smoother::new(3);
        smoother.smooth("liquid", 30.0);
        smoother.smooth("liquid", 32.0);
        smoother.reset("liquid");
        assert_eq!(smoother.smooth("liquid", 40.0), 40.0);
    }

    fn noisy_device() -> Device {
        Device::new(
            DeviceId(2),
            DeviceKind::DriverManaged,
            "cpu package",
            DeviceInfo {
                smoothed: true,
                ..DeviceInfo::default()
            },
        )
    }

    #[test]
    fn test_device_smoother_is_raw_until_window_filled() {
        let mut smoother = Smoother::for_device(&noisy_device(), true, 2);
        assert_eq!(smoother.smooth("cpu", 40.0), 40.0);
        assert_eq!(smoother.smooth("cpu", 50.0), 50.0);
        assert_eq!(smoother.smooth("cpu", 60.0), 60.0);
        assert_eq!(smoother.smooth("cpu", 70.0), 65.0);
        assert_eq!(smoother.smooth("cpu", 70.0), 70.0);
        assert_eq!(smoother.smooth("cpu", 90.0), 80.0);
        // A new series warms up on its own
        assert_eq!(smoother.smooth("gpu", 30.0), 30.0);
        assert_eq!(smoother.smooth("gpu", 50.0), 50.0);
    }

    #[test]
    fn test_for_device_gating() {
        let plain = Device::new(DeviceId(1), DeviceKind::Hwmon, "nct6798", DeviceInfo::default());
        let noisy = noisy_device();
        assert!(!Smoother::for_device(&plain, true, 2).is_enabled());
        assert!(Smoother::for_device(&noisy, true, 2).is_enabled());
        assert!(!Smoother::for_device(&noisy, false, 2).is_enabled());
    }
}
