//! Interrupt-context FG pulse accumulator
//!
//! One [`EdgeCounter`] exists per channel. Clones share the same counter:
//! the edge driver holds one clone and increments it from its interrupt
//! handler, the channel holds another and drains it when a measurement
//! window closes.
//!
//! The interrupt side is a single relaxed `fetch_add`; no locks, no
//! allocation, no logging. The main side drains with `swap(0)`, which
//! snapshots and resets in one atomic step, so an edge landing during the
//! reset is carried into the next window instead of being dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct EdgeCounter {
    edges: Arc<AtomicU32>,
}

impl EdgeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt handler body. Wraps on overflow.
    #[inline]
    pub fn record_edge(&self) {
        self.edges.fetch_add(1, Ordering::Relaxed);
    }

    /// Edges accumulated since the last [`take`](Self::take)
    pub fn pending(&self) -> u32 {
        self.edges.load(Ordering::Acquire)
    }

    /// Snapshot the count and reset it to zero
    pub fn take(&self) -> u32 {
        self.edges.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_take_resets() {
        let counter = EdgeCounter::new();
        for _ in 0..11 {
            counter.record_edge();
        }
        assert_eq!(counter.pending(), 11);
        assert_eq!(counter.take(), 11);
        assert_eq!(counter.take(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let isr_side = EdgeCounter::new();
        let main_side = isr_side.clone();
        isr_side.record_edge();
        isr_side.record_edge();
        assert_eq!(main_side.take(), 2);
    }

    #[test]
    fn test_concurrent_drain_loses_nothing() {
        let counter = EdgeCounter::new();
        let isr_side = counter.clone();

        let producer = thread::spawn(move || {
            for _ in 0..100_000 {
                isr_side.record_edge();
            }
        });

        let mut drained = 0u64;
        while !producer.is_finished() {
            drained += u64::from(counter.take());
        }
        producer.join().unwrap();
        drained += u64::from(counter.take());

        assert_eq!(drained, 100_000);
    }
}
