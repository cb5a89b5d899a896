//! Hardware collaborator interfaces: PWM output and edge interrupts

use crate::edge_counter::EdgeCounter;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical GPIO number. The bank never owns the pin, it only names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinId(pub u16);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

/// Which transitions of the FG line raise an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    Rising,
    Falling,
    Both,
}

/// PWM output driver
pub trait PwmDriver: Send {
    /// Prepare `pin` for PWM output at the given carrier frequency
    fn configure(&mut self, pin: PinId, frequency_hz: u32) -> Result<()>;

    /// Command a duty cycle in percent (0-100)
    fn set_duty(&mut self, pin: PinId, percent: u8) -> Result<()>;
}

/// GPIO interrupt driver
pub trait EdgeDriver {
    /// Attach `counter` to `pin`. The driver calls
    /// [`EdgeCounter::record_edge`] from its interrupt handler for every
    /// transition matching `mode`.
    fn on_edge(&mut self, pin: PinId, mode: EdgeMode, counter: EdgeCounter) -> Result<()>;
}

/// Convert a percentage to the raw compare value of a `resolution`-step
/// PWM peripheral, rounding to nearest.
pub fn duty_to_raw(percent: u8, resolution: u16) -> u16 {
    let percent = u32::from(percent.min(100));
    ((percent * u32::from(resolution) + 50) / 100) as u16
}
