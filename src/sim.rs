//! Simulated fan rig
//!
//! Implements both hardware collaborators over a set of modelled fans: PWM
//! writes set each fan's drive, and [`SimulatedRig::advance`] integrates
//! the rotor speed and fires the registered edge counters the way a GPIO
//! interrupt would. Used by the CLI (in real time) and by tests (through
//! [`SimClock`], in virtual time).

use crate::clock::{Clock, ManualClock};
use crate::config::FanBankConfig;
use crate::edge_counter::EdgeCounter;
use crate::errors::{FanError, Result};
use crate::hardware::{duty_to_raw, EdgeDriver, EdgeMode, PinId, PwmDriver};
use log::{debug, trace};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Physical behaviour shared by every simulated fan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanModel {
    /// Speed at 100% duty
    pub max_rpm: f64,
    /// Below this duty the rotor stalls
    pub stall_below_percent: u8,
    /// First-order lag of the rotor
    pub time_constant: Duration,
    /// FG pulses per revolution as produced by the fan
    pub fg_pulses_per_revolution: u32,
    /// Relative speed noise, e.g. 0.01 for ±1%
    pub jitter: f64,
}

impl Default for FanModel {
    fn default() -> Self {
        Self {
            max_rpm: 3000.0,
            stall_below_percent: 20,
            time_constant: Duration::from_millis(800),
            fg_pulses_per_revolution: 1,
            jitter: 0.0,
        }
    }
}

impl FanModel {
    /// A fan whose FG output agrees with the configured pulses per
    /// revolution under the configured edge mode.
    pub fn for_config(config: &FanBankConfig) -> Self {
        let edges_per_pulse = edges_per_pulse(config.edge_mode);
        Self {
            fg_pulses_per_revolution: (config.pulses_per_revolution / edges_per_pulse).max(1),
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.abs();
        self
    }

    /// Steady-state speed for a duty
    pub fn target_rpm(&self, duty_percent: u8) -> f64 {
        if duty_percent < self.stall_below_percent {
            0.0
        } else {
            self.max_rpm * f64::from(duty_percent.min(100)) / 100.0
        }
    }
}

fn edges_per_pulse(mode: EdgeMode) -> u32 {
    match mode {
        EdgeMode::Both => 2,
        EdgeMode::Rising | EdgeMode::Falling => 1,
    }
}

#[derive(Debug)]
struct SimFan {
    control_pin: PinId,
    feedback_pin: PinId,
    configured_hz: Option<u32>,
    duty_percent: u8,
    raw_duty: u16,
    rpm: f64,
    edge_carry: f64,
    listener: Option<(EdgeMode, EdgeCounter)>,
}

#[derive(Debug)]
struct RigState {
    model: FanModel,
    resolution: u16,
    fans: Vec<SimFan>,
    failing_pins: HashSet<PinId>,
}

impl RigState {
    fn fan_by_control(&mut self, pin: PinId) -> Result<&mut SimFan> {
        if self.failing_pins.contains(&pin) {
            return Err(FanError::driver(pin, "simulated fault"));
        }
        self.fans
            .iter_mut()
            .find(|fan| fan.control_pin == pin)
            .ok_or_else(|| FanError::driver(pin, "no PWM channel on pin"))
    }

    fn fan_by_feedback(&mut self, pin: PinId) -> Result<&mut SimFan> {
        if self.failing_pins.contains(&pin) {
            return Err(FanError::driver(pin, "simulated fault"));
        }
        self.fans
            .iter_mut()
            .find(|fan| fan.feedback_pin == pin)
            .ok_or_else(|| FanError::driver(pin, "no input on pin"))
    }
}

/// Cloneable handle to a shared simulated rig
#[derive(Debug, Clone)]
pub struct SimulatedRig {
    state: Arc<Mutex<RigState>>,
}

impl SimulatedRig {
    /// One simulated fan per configured control/feedback pin pair
    pub fn new(config: &FanBankConfig, model: FanModel) -> Self {
        let fans = config
            .control_pins
            .iter()
            .zip(&config.feedback_pins)
            .map(|(&control_pin, &feedback_pin)| SimFan {
                control_pin,
                feedback_pin,
                configured_hz: None,
                duty_percent: 0,
                raw_duty: 0,
                rpm: 0.0,
                edge_carry: 0.0,
                listener: None,
            })
            .collect();

        Self {
            state: Arc::new(Mutex::new(RigState {
                model,
                resolution: config.pwm_resolution,
                fans,
                failing_pins: HashSet::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, RigState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn model(&self) -> FanModel {
        self.state().model
    }

    /// Make every driver call touching `pin` fail
    pub fn fail_pin(&self, pin: PinId) {
        self.state().failing_pins.insert(pin);
    }

    pub fn heal_pin(&self, pin: PinId) {
        self.state().failing_pins.remove(&pin);
    }

    /// Raw compare value last written to a control pin
    pub fn raw_duty(&self, control_pin: PinId) -> Option<u16> {
        let state = self.state();
        state
            .fans
            .iter()
            .find(|fan| fan.control_pin == control_pin)
            .map(|fan| fan.raw_duty)
    }

    /// Actual rotor speed behind a feedback pin
    pub fn true_rpm(&self, feedback_pin: PinId) -> Option<f64> {
        let state = self.state();
        state
            .fans
            .iter()
            .find(|fan| fan.feedback_pin == feedback_pin)
            .map(|fan| fan.rpm)
    }

    /// Fire `edges` interrupts on a feedback pin, bypassing the rotor model
    pub fn inject_edges(&self, feedback_pin: PinId, edges: u32) {
        let state = self.state();
        let listener = state
            .fans
            .iter()
            .find(|fan| fan.feedback_pin == feedback_pin)
            .and_then(|fan| fan.listener.as_ref());
        if let Some((_, counter)) = listener {
            for _ in 0..edges {
                counter.record_edge();
            }
        }
    }

    /// Integrate every rotor over `dt` and deliver the resulting edges
    pub fn advance(&self, dt: Duration) {
        let mut state = self.state();
        let model = state.model;
        let secs = dt.as_secs_f64();
        let alpha = if model.time_constant.is_zero() {
            1.0
        } else {
            1.0 - (-secs / model.time_constant.as_secs_f64()).exp()
        };
        let mut rng = rand::thread_rng();

        for fan in state.fans.iter_mut() {
            let target = model.target_rpm(fan.duty_percent);
            fan.rpm += (target - fan.rpm) * alpha;
            if fan.rpm < 0.5 && target == 0.0 {
                fan.rpm = 0.0;
            }

            let Some((mode, counter)) = fan.listener.as_ref() else {
                continue;
            };

            let mut rpm = fan.rpm;
            if model.jitter > 0.0 && rpm > 0.0 {
                rpm *= 1.0 + rng.gen_range(-model.jitter..=model.jitter);
            }
            let edges_per_rev = f64::from(model.fg_pulses_per_revolution * edges_per_pulse(*mode));
            let edges = rpm / 60.0 * edges_per_rev * secs + fan.edge_carry;
            let whole = edges.floor();
            fan.edge_carry = edges - whole;
            for _ in 0..whole as u64 {
                counter.record_edge();
            }
        }
    }

    /// Drive the rig from the tokio timer until the handle is aborted
    pub fn spawn_realtime(&self, tick: Duration) -> JoinHandle<()> {
        let rig = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            let mut last = tokio::time::Instant::now();
            loop {
                interval.tick().await;
                let now = tokio::time::Instant::now();
                rig.advance(now - last);
                last = now;
            }
        })
    }
}

impl PwmDriver for SimulatedRig {
    fn configure(&mut self, pin: PinId, frequency_hz: u32) -> Result<()> {
        let mut state = self.state();
        let fan = state.fan_by_control(pin)?;
        fan.configured_hz = Some(frequency_hz);
        debug!("Simulated PWM on {} at {} Hz", pin, frequency_hz);
        Ok(())
    }

    fn set_duty(&mut self, pin: PinId, percent: u8) -> Result<()> {
        let mut state = self.state();
        let resolution = state.resolution;
        let fan = state.fan_by_control(pin)?;
        if fan.configured_hz.is_none() {
            return Err(FanError::driver(pin, "PWM not configured"));
        }
        fan.duty_percent = percent.min(100);
        fan.raw_duty = duty_to_raw(percent, resolution);
        trace!("{} duty {}% (raw {})", pin, percent, fan.raw_duty);
        Ok(())
    }
}

impl EdgeDriver for SimulatedRig {
    fn on_edge(&mut self, pin: PinId, mode: EdgeMode, counter: EdgeCounter) -> Result<()> {
        let mut state = self.state();
        let fan = state.fan_by_feedback(pin)?;
        fan.listener = Some((mode, counter));
        Ok(())
    }
}

/// Virtual clock that runs the rig forward whenever it sleeps
#[derive(Debug)]
pub struct SimClock {
    rig: SimulatedRig,
    time: ManualClock,
    step: Duration,
}

impl SimClock {
    pub fn new(rig: SimulatedRig) -> Self {
        Self {
            rig,
            time: ManualClock::new(),
            step: Duration::from_millis(10),
        }
    }

    /// Advance time and physics together in small steps
    pub fn run_for(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() {
            let step = remaining.min(self.step);
            self.rig.advance(step);
            self.time.advance(step);
            remaining -= step;
        }
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.time.now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.run_for(duration);
        tokio::task::yield_now()
    }
}
