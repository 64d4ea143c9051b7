//! Throughput counters: frames received, packets sent and connections
//! accepted, plus per-interval rates for periodic reporting.
//!
//! Every [`Session`](crate::Session) counts its own traffic and also feeds the
//! [`TrafficCounters`] shared through its [`SessionConfig`](crate::SessionConfig),
//! so all sessions built from one config add up to a process-wide total.
//! A [`TrafficMeter`] turns those totals into per-second rates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lifetime traffic totals. Safe to update from any thread.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    frames_received: AtomicU64,
    packets_sent: AtomicU64,
    accepted: AtomicU64,
}

impl TrafficCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one complete inbound frame.
    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `packets` written by one send batch.
    pub fn record_sent(&self, packets: usize) {
        self.packets_sent.fetch_add(packets as u64, Ordering::Relaxed);
    }

    /// Count one accepted connection.
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames received so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Packets sent so far.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Read all three totals.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            frames_received: self.frames_received(),
            packets_sent: self.packets_sent(),
            accepted: self.accepted(),
        }
    }
}

/// Point-in-time copy of [`TrafficCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub frames_received: u64,
    pub packets_sent: u64,
    pub accepted: u64,
}

impl TrafficSnapshot {
    /// Per-second rates between `earlier` and `self`.
    ///
    /// A zero `elapsed` yields zero rates.
    pub fn rates_since(&self, earlier: &TrafficSnapshot, elapsed: Duration) -> TrafficRates {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return TrafficRates::default();
        }
        let per_sec = |now: u64, then: u64| now.saturating_sub(then) as f64 / secs;
        TrafficRates {
            recv_per_sec: per_sec(self.frames_received, earlier.frames_received),
            send_per_sec: per_sec(self.packets_sent, earlier.packets_sent),
            accept_per_sec: per_sec(self.accepted, earlier.accepted),
        }
    }
}

/// Traffic per second over one sampling interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrafficRates {
    pub recv_per_sec: f64,
    pub send_per_sec: f64,
    pub accept_per_sec: f64,
}

/// Samples shared counters and reports the rate since the previous sample.
#[derive(Debug)]
pub struct TrafficMeter {
    counters: Arc<TrafficCounters>,
    last: TrafficSnapshot,
    last_at: Instant,
}

impl TrafficMeter {
    /// Start measuring from the counters' current values.
    pub fn new(counters: Arc<TrafficCounters>) -> Self {
        Self::starting_at(counters, Instant::now())
    }

    fn starting_at(counters: Arc<TrafficCounters>, at: Instant) -> Self {
        let last = counters.snapshot();
        Self {
            counters,
            last,
            last_at: at,
        }
    }

    /// Rates since the previous call (or since construction).
    pub fn sample(&mut self) -> TrafficRates {
        self.sample_at(Instant::now())
    }

    fn sample_at(&mut self, now: Instant) -> TrafficRates {
        let current = self.counters.snapshot();
        let rates = current.rates_since(&self.last, now.saturating_duration_since(self.last_at));
        self.last = current;
        self.last_at = now;
        rates
    }

    /// Lifetime totals of the sampled counters.
    pub fn totals(&self) -> TrafficSnapshot {
        self.counters.snapshot()
    }
}
