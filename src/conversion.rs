//! Frequency to RPM conversion and the running/stalled verdict

use crate::errors::{FanError, Result};

/// `rpm = frequency_hz * 60 / pulses_per_revolution`.
///
/// `pulses_per_revolution` counts the edges registered per revolution
/// under the configured edge mode, so a 2-pulse fan sampled on both
/// edges is configured as 4.
pub fn rpm_from_frequency(frequency_hz: f64, pulses_per_revolution: u32) -> Result<f64> {
    if pulses_per_revolution == 0 {
        return Err(FanError::UndefinedConversion {
            pulses_per_revolution,
        });
    }
    Ok(frequency_hz * 60.0 / f64::from(pulses_per_revolution))
}

/// A fan is healthy when it turns at least `threshold_rpm`.
///
/// A fan commanded to 0% is unhealthy by this test; callers distinguish
/// stopped from stalled using the commanded duty.
pub fn is_healthy(rpm: f64, threshold_rpm: f64) -> bool {
    rpm >= threshold_rpm
}

/// Reject thresholds, targets and tolerances that are negative or not finite
pub fn check_rpm_bound(name: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(FanError::ValueOutOfRange { name, value })
    }
}
