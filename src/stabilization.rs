//! Wait for a fan's measured speed to settle on a target
//!
//! The waiter is a small state machine, `Polling -> Converged | TimedOut`,
//! fed one RPM sample per tick. [`wait_for_stabilization`] drives it from a
//! [`Clock`], sleeping cooperatively between samples. Timing out is a normal
//! outcome, not an error.

use crate::clock::Clock;
use crate::conversion::check_rpm_bound;
use crate::errors::Result;
use crate::frequency::MIN_SAMPLE_TIME;
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Duration;

/// Anything that can be asked for a current RPM reading
pub trait RpmSource {
    fn sample_rpm(&self) -> Result<f64>;
}

/// What "settled" means for one wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizationTarget {
    pub target_rpm: f64,
    pub tolerance_rpm: f64,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Consecutive in-tolerance samples required
    pub stable_samples: u32,
}

impl StabilizationTarget {
    pub fn new(target_rpm: f64, tolerance_rpm: f64, timeout: Duration) -> Result<Self> {
        Ok(Self {
            target_rpm: check_rpm_bound("target_rpm", target_rpm)?,
            tolerance_rpm: check_rpm_bound("tolerance_rpm", tolerance_rpm)?,
            timeout,
            poll_interval: Duration::from_millis(500),
            stable_samples: 1,
        })
    }

    /// Intervals shorter than [`MIN_SAMPLE_TIME`] are raised to it
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_SAMPLE_TIME);
        self
    }

    pub fn with_stable_samples(mut self, stable_samples: u32) -> Self {
        self.stable_samples = stable_samples.max(1);
        self
    }

    pub fn accepts(&self, rpm: f64) -> bool {
        (rpm - self.target_rpm).abs() <= self.tolerance_rpm
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    Polling,
    Converged,
    TimedOut,
}

impl WaitState {
    pub fn is_terminal(self) -> bool {
        self != WaitState::Polling
    }
}

/// Final report of a wait
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitOutcome {
    pub state: WaitState,
    pub elapsed: Duration,
    pub last_rpm: Option<f64>,
    pub samples: u32,
}

impl WaitOutcome {
    pub fn converged(&self) -> bool {
        self.state == WaitState::Converged
    }
}

#[derive(Debug, Clone)]
pub struct StabilizationWaiter {
    target: StabilizationTarget,
    started_at: Duration,
    state: WaitState,
    streak: u32,
    samples: u32,
    last_rpm: Option<f64>,
    last_seen: Duration,
}

impl StabilizationWaiter {
    pub fn new(target: StabilizationTarget, started_at: Duration) -> Self {
        Self {
            target,
            started_at,
            state: WaitState::Polling,
            streak: 0,
            samples: 0,
            last_rpm: None,
            last_seen: started_at,
        }
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    /// Feed the sample taken at `now`. `None` means no reading was
    /// available and breaks any in-tolerance streak. Terminal states are
    /// sticky.
    pub fn observe(&mut self, now: Duration, rpm: Option<f64>) -> WaitState {
        if self.state.is_terminal() {
            return self.state;
        }

        self.samples += 1;
        self.last_seen = now;
        match rpm {
            Some(rpm) => {
                self.last_rpm = Some(rpm);
                if self.target.accepts(rpm) {
                    self.streak += 1;
                } else {
                    self.streak = 0;
                }
            }
            None => self.streak = 0,
        }

        if self.streak >= self.target.stable_samples {
            self.state = WaitState::Converged;
        } else if self.elapsed(now) >= self.target.timeout {
            self.state = WaitState::TimedOut;
        }
        self.state
    }

    /// Sleep before the next sample: one poll interval, cut short so the
    /// final sample lands exactly on the deadline.
    pub fn next_delay(&self, now: Duration) -> Duration {
        let remaining = self.target.timeout.saturating_sub(self.elapsed(now));
        self.target.poll_interval.max(MIN_SAMPLE_TIME).min(remaining)
    }

    pub fn outcome(&self) -> WaitOutcome {
        WaitOutcome {
            state: self.state,
            elapsed: self.elapsed(self.last_seen),
            last_rpm: self.last_rpm,
            samples: self.samples,
        }
    }

    fn elapsed(&self, now: Duration) -> Duration {
        now.saturating_sub(self.started_at)
    }
}

/// Poll `source` until it settles on the target or the timeout elapses.
///
/// Does not touch the duty cycle; the caller commands the speed first.
pub async fn wait_for_stabilization<C, S>(
    clock: &C,
    source: &S,
    target: StabilizationTarget,
) -> WaitOutcome
where
    C: Clock,
    S: RpmSource + ?Sized,
{
    let mut waiter = StabilizationWaiter::new(target, clock.now());
    debug!(
        "Waiting for {:.0}±{:.0} RPM (timeout {:?})",
        target.target_rpm, target.tolerance_rpm, target.timeout
    );

    loop {
        let sample = match source.sample_rpm() {
            Ok(rpm) => Some(rpm),
            Err(e) if e.is_not_ready() => None,
            Err(e) => {
                warn!("RPM sample failed during stabilization: {}", e);
                None
            }
        };

        let now = clock.now();
        if waiter.observe(now, sample).is_terminal() {
            break;
        }
        clock.sleep(waiter.next_delay(now)).await;
    }

    let outcome = waiter.outcome();
    match outcome.state {
        WaitState::Converged => info!(
            "Converged at {:.0} RPM after {:?}",
            outcome.last_rpm.unwrap_or_default(),
            outcome.elapsed
        ),
        _ => info!(
            "Timed out after {:?} (last reading {:?} RPM, target {:.0})",
            outcome.elapsed, outcome.last_rpm, target.target_rpm
        ),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::FanError;

    /// RPM as a function of seconds since the clock's epoch
    struct Profile<'a, F> {
        clock: &'a ManualClock,
        rpm_at: F,
    }

    impl<F: Fn(f64) -> Option<f64>> RpmSource for Profile<'_, F> {
        fn sample_rpm(&self) -> Result<f64> {
            (self.rpm_at)(self.clock.now().as_secs_f64()).ok_or(FanError::NotReady { id: 0 })
        }
    }

    fn target(timeout_secs: u64) -> StabilizationTarget {
        StabilizationTarget::new(2000.0, 50.0, Duration::from_secs(timeout_secs)).unwrap()
    }

    #[tokio::test]
    async fn test_converges_when_ramp_arrives() {
        let clock = ManualClock::new();
        let source = Profile {
            clock: &clock,
            rpm_at: |t: f64| Some(1995.0 * (t / 3.0).min(1.0)),
        };

        let outcome = wait_for_stabilization(&clock, &source, target(10)).await;

        assert!(outcome.converged());
        assert!(outcome.elapsed <= Duration::from_secs(3));
        assert_eq!(outcome.last_rpm, Some(1995.0));
    }

    #[tokio::test]
    async fn test_times_out_within_one_poll() {
        let clock = ManualClock::new();
        let source = Profile {
            clock: &clock,
            rpm_at: |_: f64| Some(800.0),
        };
        let target = target(10);

        let outcome = wait_for_stabilization(&clock, &source, target).await;

        assert_eq!(outcome.state, WaitState::TimedOut);
        assert!(outcome.elapsed >= target.timeout);
        assert!(outcome.elapsed <= target.timeout + target.poll_interval);
        assert_eq!(outcome.last_rpm, Some(800.0));
    }

    #[tokio::test]
    async fn test_deadline_between_polls() {
        let clock = ManualClock::new();
        let source = Profile {
            clock: &clock,
            rpm_at: |_: f64| Some(0.0),
        };
        let target = StabilizationTarget::new(2000.0, 50.0, Duration::from_millis(1200)).unwrap();

        let outcome = wait_for_stabilization(&clock, &source, target).await;

        assert_eq!(outcome.state, WaitState::TimedOut);
        assert_eq!(outcome.elapsed, Duration::from_millis(1200));
        // 0, 0.5, 1.0, 1.2
        assert_eq!(outcome.samples, 4);
    }

    #[tokio::test]
    async fn test_not_ready_samples_do_not_converge() {
        let clock = ManualClock::new();
        let source = Profile {
            clock: &clock,
            rpm_at: |t: f64| if t < 1.0 { None } else { Some(2010.0) },
        };

        let outcome = wait_for_stabilization(&clock, &source, target(5)).await;

        assert!(outcome.converged());
        assert_eq!(outcome.elapsed, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_requires_consecutive_samples() {
        let clock = ManualClock::new();
        // In tolerance only on whole seconds until 3s, then steady
        let source = Profile {
            clock: &clock,
            rpm_at: |t: f64| {
                if t >= 3.0 || t.fract() == 0.0 {
                    Some(2000.0)
                } else {
                    Some(1500.0)
                }
            },
        };
        let target = target(10).with_stable_samples(3);

        let outcome = wait_for_stabilization(&clock, &source, target).await;

        assert!(outcome.converged());
        // 3.0, 3.5, 4.0
        assert_eq!(outcome.elapsed, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_zero_poll_interval_still_advances() {
        let clock = ManualClock::new();
        let source = Profile {
            clock: &clock,
            rpm_at: |_: f64| Some(800.0),
        };
        let target = StabilizationTarget {
            poll_interval: Duration::ZERO,
            ..StabilizationTarget::new(2000.0, 50.0, Duration::from_millis(20)).unwrap()
        };

        let outcome = wait_for_stabilization(&clock, &source, target).await;

        assert_eq!(outcome.state, WaitState::TimedOut);
        assert_eq!(outcome.elapsed, Duration::from_millis(20));
        // 0, 5, 10, 15, 20 ms
        assert_eq!(outcome.samples, 5);

        assert_eq!(
            target.with_poll_interval(Duration::ZERO).poll_interval,
            MIN_SAMPLE_TIME
        );
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut waiter = StabilizationWaiter::new(target(1), Duration::ZERO);
        assert_eq!(waiter.observe(Duration::ZERO, Some(2000.0)), WaitState::Converged);
        assert_eq!(
            waiter.observe(Duration::from_secs(5), Some(0.0)),
            WaitState::Converged
        );
        assert_eq!(waiter.outcome().samples, 1);

        let mut waiter = StabilizationWaiter::new(target(1), Duration::ZERO);
        assert_eq!(
            waiter.observe(Duration::from_secs(2), None),
            WaitState::TimedOut
        );
        assert_eq!(
            waiter.observe(Duration::from_secs(3), Some(2000.0)),
            WaitState::TimedOut
        );
    }

    #[test]
    fn test_rejects_bad_targets() {
        assert!(StabilizationTarget::new(-1.0, 50.0, Duration::from_secs(1))
            .unwrap_err()
            .is_out_of_range());
        assert!(StabilizationTarget::new(2000.0, f64::NAN, Duration::from_secs(1)).is_err());
    }
}
