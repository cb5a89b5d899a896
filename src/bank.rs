//! The fixed set of fan channels and the control surface over them

use crate::channel::{DutyLimits, SpeedChannel};
use crate::clock::Clock;
use crate::config::FanBankConfig;
use crate::conversion::{is_healthy, rpm_from_frequency};
use crate::edge_counter::EdgeCounter;
use crate::errors::{FanError, Result};
use crate::hardware::{EdgeDriver, PwmDriver};
use crate::stabilization::{self, StabilizationTarget, WaitOutcome};
use crate::status::{ChannelStatus, Reading, StatusReport};
use log::{error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Per-channel results of a bulk operation, indexed by fan id
#[derive(Debug)]
pub struct BatchOutcome {
    results: Vec<Result<()>>,
}

impl BatchOutcome {
    pub fn results(&self) -> &[Result<()>] {
        &self.results
    }

    pub fn into_results(self) -> Vec<Result<()>> {
        self.results
    }

    pub fn all_ok(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &FanError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (id, e)))
    }
}

/// Owns every fan channel plus the PWM driver they share.
///
/// All operations take `&self`, so a stabilization wait on one fan can be
/// in flight while other calls (including [`emergency_stop`]) proceed.
///
/// [`emergency_stop`]: FanBank::emergency_stop
pub struct FanBank<P, C> {
    config: FanBankConfig,
    channels: Vec<SpeedChannel<C>>,
    pwm: Mutex<P>,
    clock: Arc<C>,
}

impl<P: PwmDriver, C: Clock> FanBank<P, C> {
    /// Configure every control pin, start it at 0% and attach an edge
    /// counter to every feedback pin.
    pub fn new<G>(config: FanBankConfig, mut pwm: P, gpio: &mut G, clock: Arc<C>) -> Result<Self>
    where
        G: EdgeDriver + ?Sized,
    {
        config.validate()?;

        let limits = DutyLimits {
            min: config.min_speed,
            max: config.max_speed,
        };
        let mut channels = Vec::with_capacity(config.fan_count);

        for (id, (&control_pin, &feedback_pin)) in config
            .control_pins
            .iter()
            .zip(&config.feedback_pins)
            .enumerate()
        {
            let control_ready = match pwm
                .configure(control_pin, config.pwm_frequency_hz)
                .and_then(|()| pwm.set_duty(control_pin, 0))
            {
                Ok(()) => true,
                Err(e) if config.ignore_missing_control => {
                    warn!("Fan {}: PWM output disabled: {}", id + 1, e);
                    false
                }
                Err(e) => return Err(e),
            };

            let counter = EdgeCounter::new();
            let counter = match gpio.on_edge(feedback_pin, config.edge_mode, counter.clone()) {
                Ok(()) => Some(counter),
                Err(e) if config.ignore_missing_feedback => {
                    warn!("Fan {}: feedback disabled: {}", id + 1, e);
                    None
                }
                Err(e) => return Err(e),
            };

            info!(
                "Fan {}: control {} feedback {}",
                id + 1,
                control_pin,
                feedback_pin
            );
            let channel = SpeedChannel::new(
                id,
                control_pin,
                feedback_pin,
                config.pulses_per_revolution,
                limits,
                config.measurement_window(),
                counter,
                Arc::clone(&clock),
            );
            channels.push(if control_ready {
                channel
            } else {
                channel.without_control()
            });
        }

        info!("Fan bank initialized with {} channels", channels.len());
        Ok(Self {
            config,
            channels,
            pwm: Mutex::new(pwm),
            clock,
        })
    }

    pub fn fan_count(&self) -> usize {
        self.channels.len()
    }

    pub fn config(&self) -> &FanBankConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn channels(&self) -> &[SpeedChannel<C>] {
        &self.channels
    }

    /// The one place fan ids are validated
    pub fn channel(&self, id: usize) -> Result<&SpeedChannel<C>> {
        self.channels.get(id).ok_or(FanError::FanIdOutOfRange {
            id,
            fan_count: self.channels.len(),
        })
    }

    fn pwm(&self) -> MutexGuard<'_, P> {
        self.pwm.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_speed(&self, id: usize, percent: u8) -> Result<()> {
        let channel = self.channel(id)?;
        channel.set_duty(&mut *self.pwm(), percent)
    }

    /// Apply one percentage to every fan, best effort
    pub fn set_all_speeds(&self, percent: u8) -> BatchOutcome {
        let mut pwm = self.pwm();
        let results = self
            .channels
            .iter()
            .map(|channel| channel.set_duty(&mut *pwm, percent))
            .collect();
        self.log_batch("set speed", BatchOutcome { results })
    }

    /// Apply one percentage per fan. The list must cover every fan.
    pub fn set_speeds(&self, percents: &[u8]) -> Result<BatchOutcome> {
        if percents.len() != self.channels.len() {
            return Err(FanError::SpeedListLength {
                expected: self.channels.len(),
                actual: percents.len(),
            });
        }
        let mut pwm = self.pwm();
        let results = self
            .channels
            .iter()
            .zip(percents)
            .map(|(channel, &percent)| channel.set_duty(&mut *pwm, percent))
            .collect();
        Ok(self.log_batch("set speeds", BatchOutcome { results }))
    }

    pub fn apply_default_speed(&self) -> BatchOutcome {
        self.set_all_speeds(self.config.default_speed)
    }

    pub fn stop(&self, id: usize) -> Result<()> {
        let channel = self.channel(id)?;
        channel.stop(&mut *self.pwm())
    }

    pub fn stop_all(&self) -> BatchOutcome {
        let mut pwm = self.pwm();
        let results = self
            .channels
            .iter()
            .map(|channel| channel.stop(&mut *pwm))
            .collect();
        self.log_batch("stop", BatchOutcome { results })
    }

    /// Force every fan to 0%. Cannot fail; driver errors are retried and logged.
    pub fn emergency_stop(&self) {
        warn!("Emergency stop: forcing all fans to 0%");
        let attempts = self.config.emergency_stop_retries;
        let mut pwm = self.pwm();
        let unacknowledged = self
            .channels
            .iter()
            .filter(|channel| !channel.force_stop(&mut *pwm, attempts))
            .count();
        if unacknowledged > 0 {
            error!(
                "Emergency stop: {} fan(s) did not acknowledge",
                unacknowledged
            );
        }
    }

    pub fn duty_percent(&self, id: usize) -> Result<u8> {
        Ok(self.channel(id)?.duty_percent())
    }

    pub fn read_rpm(&self, id: usize) -> Result<f64> {
        self.channel(id)?.read_rpm()
    }

    pub fn read_frequency(&self, id: usize) -> Result<f64> {
        self.channel(id)?.read_frequency()
    }

    pub fn read_health(&self, id: usize, threshold_rpm: f64) -> Result<bool> {
        self.channel(id)?.read_health(threshold_rpm)
    }

    pub fn read_all_rpm(&self) -> Vec<Result<f64>> {
        self.channels.iter().map(SpeedChannel::read_rpm).collect()
    }

    pub fn read_all_health(&self, threshold_rpm: f64) -> Vec<Result<bool>> {
        self.channels
            .iter()
            .map(|channel| channel.read_health(threshold_rpm))
            .collect()
    }

    /// Duty and stop state for every fan; with `detailed`, also a fresh
    /// measurement. A fault on one fan is reported in its row only.
    pub fn status_report(&self, detailed: bool) -> StatusReport {
        let threshold = self.config.health_threshold_rpm;
        let channels = self
            .channels
            .iter()
            .map(|channel| {
                let duty_percent = channel.duty_percent();
                ChannelStatus {
                    id: channel.id(),
                    control_pin: channel.control_pin(),
                    feedback_pin: channel.feedback_pin(),
                    duty_percent,
                    is_stopped: duty_percent == 0,
                    reading: detailed.then(|| Self::measure(channel, threshold)),
                }
            })
            .collect();

        StatusReport {
            detailed,
            health_threshold_rpm: threshold,
            channels,
        }
    }

    fn measure(channel: &SpeedChannel<C>, threshold_rpm: f64) -> Reading {
        let reading = channel.read_frequency().and_then(|frequency_hz| {
            let rpm = rpm_from_frequency(frequency_hz, channel.pulses_per_revolution())?;
            Ok((frequency_hz, rpm))
        });
        match reading {
            Ok((frequency_hz, rpm)) => Reading::Ready {
                frequency_hz,
                rpm,
                healthy: is_healthy(rpm, threshold_rpm),
            },
            Err(e) if e.is_not_ready() => Reading::NotReady,
            Err(e) => Reading::Fault {
                message: e.to_string(),
            },
        }
    }

    /// Wait for fan `id` to settle within `tolerance_rpm` of `target_rpm`.
    ///
    /// Uses the configured poll interval and stable-sample count. Returns
    /// `Err` only for an unknown fan or invalid bounds; a timeout is an
    /// `Ok` outcome.
    pub async fn wait_for_stabilization(
        &self,
        id: usize,
        target_rpm: f64,
        tolerance_rpm: f64,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        let target = StabilizationTarget::new(target_rpm, tolerance_rpm, timeout)?
            .with_poll_interval(self.config.poll_interval())
            .with_stable_samples(self.config.stable_samples);
        self.wait_with(id, target).await
    }

    /// Wait with a caller-built target. Its poll interval is raised to at
    /// least one measurement window.
    pub async fn wait_with(&self, id: usize, target: StabilizationTarget) -> Result<WaitOutcome> {
        let channel = self.channel(id)?;
        let poll_interval = target.poll_interval.max(self.config.measurement_window());
        let target = target.with_poll_interval(poll_interval);
        Ok(stabilization::wait_for_stabilization(&*self.clock, channel, target).await)
    }

    /// Drop the edges counted so far on every fan and open fresh windows
    pub fn restart_windows(&self) {
        for channel in &self.channels {
            channel.restart_window();
        }
    }

    fn log_batch(&self, what: &str, outcome: BatchOutcome) -> BatchOutcome {
        for (id, e) in outcome.failures() {
            warn!("Fan {}: {} failed: {}", id + 1, what, e);
        }
        info!(
            "{}: {}/{} fans",
            what,
            outcome.succeeded(),
            self.channels.len()
        );
        outcome
    }
}
