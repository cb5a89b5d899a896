//! Windowed edge-rate measurement

use crate::edge_counter::EdgeCounter;
use log::trace;
use std::time::Duration;

/// Shortest window that can produce a frequency
pub const MIN_SAMPLE_TIME: Duration = Duration::from_millis(5);

/// Outcome of trying to close a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowSample {
    /// Window still open; the counter was left untouched
    NotReady { elapsed: Duration },
    /// Window closed and a new one opened at the sample time
    Complete {
        edges: u32,
        elapsed: Duration,
        frequency_hz: f64,
    },
}

/// Tracks the open measurement window of one channel.
///
/// Lives in main context only; the counter it drains is the one piece of
/// state shared with the interrupt handler.
#[derive(Debug, Clone)]
pub struct FrequencyWindow {
    started_at: Duration,
    length: Duration,
}

impl FrequencyWindow {
    /// Open a window at `now`. Lengths below [`MIN_SAMPLE_TIME`] are raised to it.
    pub fn new(now: Duration, length: Duration) -> Self {
        Self {
            started_at: now,
            length: length.max(MIN_SAMPLE_TIME),
        }
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    pub fn started_at(&self) -> Duration {
        self.started_at
    }

    /// Close the window if it has run for at least its length.
    pub fn sample(&mut self, counter: &EdgeCounter, now: Duration) -> WindowSample {
        let elapsed = now.saturating_sub(self.started_at);
        if elapsed < self.length {
            return WindowSample::NotReady { elapsed };
        }

        let edges = counter.take();
        self.started_at = now;
        let frequency_hz = f64::from(edges) / elapsed.as_secs_f64();
        trace!(
            "Window closed: {} edges over {:?} ({:.2} Hz)",
            edges,
            elapsed,
            frequency_hz
        );

        WindowSample::Complete {
            edges,
            elapsed,
            frequency_hz,
        }
    }

    /// Discard everything counted so far and open a new window at `now`.
    /// Returns the number of edges dropped.
    pub fn restart(&mut self, counter: &EdgeCounter, now: Duration) -> u32 {
        let dropped = counter.take();
        self.started_at = now;
        trace!("Window restarted, {} edges dropped", dropped);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(counter: &EdgeCounter, edges: u32) {
        for _ in 0..edges {
            counter.record_edge();
        }
    }

    #[test]
    fn test_not_ready_before_window_length() {
        let counter = EdgeCounter::new();
        let mut window = FrequencyWindow::new(Duration::ZERO, Duration::from_millis(500));
        feed(&counter, 10);

        let sample = window.sample(&counter, Duration::from_millis(499));
        assert_eq!(
            sample,
            WindowSample::NotReady {
                elapsed: Duration::from_millis(499)
            }
        );
        // Counter must survive an early sample
        assert_eq!(counter.pending(), 10);
    }

    #[test]
    fn test_frequency_uses_actual_elapsed() {
        let counter = EdgeCounter::new();
        let mut window = FrequencyWindow::new(Duration::from_secs(1), Duration::from_millis(500));
        feed(&counter, 300);

        match window.sample(&counter, Duration::from_secs(3)) {
            WindowSample::Complete {
                edges,
                elapsed,
                frequency_hz,
            } => {
                assert_eq!(edges, 300);
                assert_eq!(elapsed, Duration::from_secs(2));
                assert!((frequency_hz - 150.0).abs() < 1e-9);
            }
            other => panic!("expected complete window, got {:?}", other),
        }

        assert_eq!(counter.pending(), 0);
        assert_eq!(window.started_at(), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_edges_is_zero_hz() {
        let counter = EdgeCounter::new();
        let mut window = FrequencyWindow::new(Duration::ZERO, Duration::from_millis(100));
        match window.sample(&counter, Duration::from_millis(100)) {
            WindowSample::Complete { frequency_hz, .. } => assert_eq!(frequency_hz, 0.0),
            other => panic!("expected complete window, got {:?}", other),
        }
    }

    #[test]
    fn test_restart_drops_edges_and_reopens() {
        let counter = EdgeCounter::new();
        let mut window = FrequencyWindow::new(Duration::ZERO, Duration::from_millis(500));
        feed(&counter, 40);

        assert_eq!(window.restart(&counter, Duration::from_millis(200)), 40);
        assert_eq!(window.started_at(), Duration::from_millis(200));
        assert!(matches!(
            window.sample(&counter, Duration::from_millis(600)),
            WindowSample::NotReady { .. }
        ));

        feed(&counter, 10);
        match window.sample(&counter, Duration::from_millis(700)) {
            WindowSample::Complete { edges, .. } => assert_eq!(edges, 10),
            other => panic!("expected complete window, got {:?}", other),
        }
    }

    #[test]
    fn test_length_has_a_floor() {
        let counter = EdgeCounter::new();
        let mut window = FrequencyWindow::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(window.length(), MIN_SAMPLE_TIME);
        assert!(matches!(
            window.sample(&counter, Duration::ZERO),
            WindowSample::NotReady { .. }
        ));
    }
}
