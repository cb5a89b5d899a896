//! Per-fan state: commanded duty plus the tachometer measurement pipeline

use crate::clock::Clock;
use crate::conversion::{check_rpm_bound, is_healthy, rpm_from_frequency};
use crate::edge_counter::EdgeCounter;
use crate::errors::{FanError, Result};
use crate::frequency::{FrequencyWindow, WindowSample};
use crate::hardware::{PinId, PwmDriver};
use crate::stabilization::RpmSource;
use log::{debug, error, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Allowed duty range, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DutyLimits {
    pub min: u8,
    pub max: u8,
}

impl DutyLimits {
    pub fn check(&self, percent: u8) -> Result<u8> {
        if (self.min..=self.max).contains(&percent) {
            Ok(percent)
        } else {
            Err(FanError::DutyOutOfRange {
                percent,
                min: self.min,
                max: self.max,
            })
        }
    }
}

#[derive(Debug)]
struct ChannelState {
    duty_percent: u8,
    window: FrequencyWindow,
    last_frequency_hz: Option<f64>,
}

/// One fan: its PWM control pin, its FG feedback pin and the readings
/// derived from the feedback edges.
///
/// Channels never look at each other; every lock here is private to the
/// channel and is never held across an await.
#[derive(Debug)]
pub struct SpeedChannel<C> {
    id: usize,
    control_pin: PinId,
    feedback_pin: PinId,
    pulses_per_revolution: u32,
    limits: DutyLimits,
    /// False when the PWM output could not be configured
    control_ready: bool,
    counter: Option<EdgeCounter>,
    clock: Arc<C>,
    state: Mutex<ChannelState>,
}

impl<C: Clock> SpeedChannel<C> {
    /// Build a stopped channel whose first measurement window opens now.
    ///
    /// `counter` is `None` when the feedback interrupt could not be attached.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        control_pin: PinId,
        feedback_pin: PinId,
        pulses_per_revolution: u32,
        limits: DutyLimits,
        measurement_window: Duration,
        counter: Option<EdgeCounter>,
        clock: Arc<C>,
    ) -> Self {
        let window = FrequencyWindow::new(clock.now(), measurement_window);
        Self {
            id,
            control_pin,
            feedback_pin,
            pulses_per_revolution,
            limits,
            control_ready: true,
            counter,
            clock,
            state: Mutex::new(ChannelState {
                duty_percent: 0,
                window,
                last_frequency_hz: None,
            }),
        }
    }

    /// Mark the PWM output as unusable. Duty writes then fail with a
    /// driver error and emergency stops only record 0%.
    pub fn without_control(mut self) -> Self {
        self.control_ready = false;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn control_pin(&self) -> PinId {
        self.control_pin
    }

    pub fn feedback_pin(&self) -> PinId {
        self.feedback_pin
    }

    pub fn pulses_per_revolution(&self) -> u32 {
        self.pulses_per_revolution
    }

    pub fn limits(&self) -> DutyLimits {
        self.limits
    }

    pub fn has_control(&self) -> bool {
        self.control_ready
    }

    pub fn has_feedback(&self) -> bool {
        self.counter.is_some()
    }

    pub fn duty_percent(&self) -> u8 {
        self.state().duty_percent
    }

    pub fn is_stopped(&self) -> bool {
        self.duty_percent() == 0
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Command a new duty. On any failure the previous duty stays in effect.
    pub fn set_duty<P: PwmDriver + ?Sized>(&self, pwm: &mut P, percent: u8) -> Result<()> {
        let percent = self.limits.check(percent).map_err(|e| {
            warn!("Fan {}: rejected duty {}%", self.id + 1, percent);
            e
        })?;
        self.write_duty(pwm, percent)
    }

    /// Command 0% regardless of the configured minimum
    pub fn stop<P: PwmDriver + ?Sized>(&self, pwm: &mut P) -> Result<()> {
        self.write_duty(pwm, 0)
    }

    fn write_duty<P: PwmDriver + ?Sized>(&self, pwm: &mut P, percent: u8) -> Result<()> {
        if !self.control_ready {
            return Err(FanError::driver(self.control_pin, "PWM output unavailable"));
        }
        let mut state = self.state();
        pwm.set_duty(self.control_pin, percent)?;
        debug!(
            "Fan {}: duty {}% -> {}%",
            self.id + 1,
            state.duty_percent,
            percent
        );
        state.duty_percent = percent;
        Ok(())
    }

    /// Zero the duty, retrying the driver write up to `attempts` times.
    ///
    /// The commanded duty is recorded as 0 even if every write fails;
    /// returns whether the hardware acknowledged.
    pub fn force_stop<P: PwmDriver + ?Sized>(&self, pwm: &mut P, attempts: u32) -> bool {
        let mut state = self.state();
        let attempts = if self.control_ready { attempts.max(1) } else { 0 };
        let mut acknowledged = false;
        for attempt in 1..=attempts {
            match pwm.set_duty(self.control_pin, 0) {
                Ok(()) => {
                    acknowledged = true;
                    break;
                }
                Err(e) => warn!(
                    "Fan {}: emergency stop attempt {}/{} failed: {}",
                    self.id + 1,
                    attempt,
                    attempts,
                    e
                ),
            }
        }
        if !acknowledged {
            error!(
                "Fan {}: {} did not acknowledge emergency stop",
                self.id + 1,
                self.control_pin
            );
        }
        state.duty_percent = 0;
        acknowledged
    }

    /// Edge rate in Hz.
    ///
    /// Closes the measurement window when it has run long enough; otherwise
    /// returns the previous window's value, or `NotReady` if no window has
    /// completed yet. Never blocks.
    pub fn read_frequency(&self) -> Result<f64> {
        let counter = self
            .counter
            .as_ref()
            .ok_or(FanError::FeedbackUnavailable { id: self.id })?;

        let now = self.clock.now();
        let mut state = self.state();
        match state.window.sample(counter, now) {
            WindowSample::Complete { frequency_hz, .. } => {
                state.last_frequency_hz = Some(frequency_hz);
                Ok(frequency_hz)
            }
            WindowSample::NotReady { .. } => state
                .last_frequency_hz
                .ok_or(FanError::NotReady { id: self.id }),
        }
    }

    /// Throw away the edges counted so far and start a fresh window now.
    /// The cached reading is kept.
    pub fn restart_window(&self) {
        let Some(counter) = self.counter.as_ref() else {
            return;
        };
        let now = self.clock.now();
        let dropped = self.state().window.restart(counter, now);
        debug!("Fan {}: window restarted ({} edges dropped)", self.id + 1, dropped);
    }

    pub fn read_rpm(&self) -> Result<f64> {
        let frequency_hz = self.read_frequency()?;
        rpm_from_frequency(frequency_hz, self.pulses_per_revolution)
    }

    pub fn read_health(&self, threshold_rpm: f64) -> Result<bool> {
        let threshold_rpm = check_rpm_bound("threshold_rpm", threshold_rpm)?;
        Ok(is_healthy(self.read_rpm()?, threshold_rpm))
    }

    /// Most recent completed frequency, without touching the window
    pub fn last_frequency(&self) -> Option<f64> {
        self.state().last_frequency_hz
    }

    pub fn last_rpm(&self) -> Option<f64> {
        self.last_frequency()
            .and_then(|hz| rpm_from_frequency(hz, self.pulses_per_revolution).ok())
    }
}

impl<C: Clock> RpmSource for SpeedChannel<C> {
    fn sample_rpm(&self) -> Result<f64> {
        self.read_rpm()
    }
}
