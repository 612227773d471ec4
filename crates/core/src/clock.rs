//! Clock Sync Estimator
//!
//! Estimates the offset between the local wall clock and the server's from
//! a rolling window of round-trip samples. Each sample assumes symmetric
//! network delay; the window is reduced to a single estimate weighted by
//! inverse round-trip latency.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;

/// Number of samples held in the rolling window
pub const CLOCK_WINDOW: usize = 20;

/// Delay between samples once the window is full
pub const CLOCK_STEADY_PERIOD: Duration = Duration::from_secs(5);

/// Delay between samples while the window is still filling
pub const CLOCK_FILL_PERIOD: Duration = Duration::from_millis(1);

/// Floor on round-trip latency when computing weights (100µs)
const MIN_ROUND_TRIP: f64 = 1e-4;

/// Current wall clock in seconds since the Unix epoch
pub fn wall_clock() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// One measured exchange with the server's time endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    /// Server time minus local time at the moment the reply arrived
    pub offset: f64,
    /// Round-trip latency in seconds
    pub round_trip: f64,
}

impl ClockSample {
    /// Derive a sample from one exchange.
    ///
    /// `sent` and `received` are local wall times around the request;
    /// `reported` is the server's clock as carried in the reply.
    pub fn from_exchange(sent: f64, received: f64, reported: f64) -> Self {
        let round_trip = (received - sent).max(0.0);
        let server_now = reported + round_trip / 2.0;
        Self {
            offset: server_now - received,
            round_trip,
        }
    }

    fn weight(&self) -> f64 {
        1.0 / self.round_trip.max(MIN_ROUND_TRIP)
    }
}

/// Reduced view of the whole window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockEstimate {
    pub offset: f64,
    pub round_trip: f64,
}

/// Rolling window of clock samples
#[derive(Debug, Clone)]
pub struct ClockEstimator {
    window: VecDeque<ClockSample>,
    capacity: usize,
}

impl Default for ClockEstimator {
    fn default() -> Self {
        Self::new(CLOCK_WINDOW)
    }
}

impl ClockEstimator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn is_full(&self) -> bool {
        self.window.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Add a sample, dropping the oldest once the window is full
    pub fn push(&mut self, sample: ClockSample) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    /// Record a completed exchange; see [`ClockSample::from_exchange`]
    pub fn record(&mut self, sent: f64, received: f64, reported: f64) -> ClockSample {
        let sample = ClockSample::from_exchange(sent, received, reported);
        self.push(sample);
        sample
    }

    /// Combined estimate, unavailable until the window has filled.
    ///
    /// Samples are folded pairwise: each step merges the running estimate
    /// with the next sample in proportion to their accumulated weights. The
    /// result is the inverse-RTL weighted mean of the window and does not
    /// depend on sample order.
    pub fn estimate(&self) -> Option<ClockEstimate> {
        if !self.is_full() {
            return None;
        }
        let mut samples = self.window.iter();
        let first = samples.next()?;
        let (offset, round_trip, _) = samples.fold(
            (first.offset, first.round_trip, first.weight()),
            |(offset, round_trip, weight), sample| {
                let w = sample.weight();
                let total = weight + w;
                (
                    (offset * weight + sample.offset * w) / total,
                    (round_trip * weight + sample.round_trip * w) / total,
                    total,
                )
            },
        );
        Some(ClockEstimate { offset, round_trip })
    }

    /// Relative weight of each sample in the combined estimate, in window order
    pub fn weights(&self) -> Vec<f64> {
        let total: f64 = self.window.iter().map(ClockSample::weight).sum();
        self.window.iter().map(|s| s.weight() / total).collect()
    }

    /// Estimated server wall time at local wall time `local`
    pub fn server_time_at(&self, local: f64) -> Option<f64> {
        self.estimate().map(|e| local + e.offset)
    }

    /// Estimated server wall time now
    pub fn server_now(&self) -> Option<f64> {
        self.server_time_at(wall_clock())
    }

    /// How long to wait before taking the next sample
    pub fn next_delay(&self) -> Duration {
        if self.is_full() {
            CLOCK_STEADY_PERIOD
        } else {
            CLOCK_FILL_PERIOD
        }
    }

    /// Human-readable state: fill progress, or the observed RTL range
    pub fn diagnostic(&self) -> String {
        if !self.is_full() {
            return format!("measuring {} / {}", self.window.len(), self.capacity);
        }
        let (min, max) = self
            .window
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s.round_trip), hi.max(s.round_trip))
            });
        format!("{:.0} ~ {:.0} ms", min * 1000.0, max * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulate an exchange against a server whose clock runs `offset`
    /// ahead, with `one_way` delay in each direction
    fn exchange(est: &mut ClockEstimator, local: f64, offset: f64, one_way: f64) {
        let reported = local + one_way + offset;
        est.record(local, local + 2.0 * one_way, reported);
    }

    #[test]
    fn test_sample_assumes_symmetric_delay() {
        let sample = ClockSample::from_exchange(100.0, 100.2, 150.1);
        assert!((sample.round_trip - 0.2).abs() < 1e-9);
        assert!((sample.offset - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_unavailable_until_full() {
        let mut est = ClockEstimator::default();
        for i in 0..CLOCK_WINDOW - 1 {
            exchange(&mut est, i as f64, 3.0, 0.01);
            assert!(est.estimate().is_none());
            assert_eq!(est.next_delay(), CLOCK_FILL_PERIOD);
        }
        exchange(&mut est, 100.0, 3.0, 0.01);
        assert!(est.estimate().is_some());
        assert_eq!(est.next_delay(), CLOCK_STEADY_PERIOD);
    }

    #[test]
    fn test_converges_to_true_offset_within_one_fill() {
        let mut est = ClockEstimator::default();
        let true_offset = -12.345;
        for i in 0..CLOCK_WINDOW {
            let one_way = 0.005 + (i % 4) as f64 * 0.01;
            exchange(&mut est, 1_000.0 + i as f64, true_offset, one_way);
        }
        let estimate = est.estimate().unwrap();
        assert!((estimate.offset - true_offset).abs() < 1e-6);
        assert!((est.server_time_at(0.0).unwrap() - true_offset).abs() < 1e-6);
    }

    #[test]
    fn test_outlier_weight_bounded_by_fastest_sample() {
        let mut est = ClockEstimator::default();
        for i in 0..CLOCK_WINDOW - 1 {
            exchange(&mut est, i as f64, 1.0, 0.01 + i as f64 * 0.001);
        }
        // Asymmetric slow path: the derived offset is badly wrong
        est.record(50.0, 52.0, 51.9);

        let weights = est.weights();
        let outlier = *weights.last().unwrap();
        let fastest = weights[0];
        assert!(outlier <= fastest);

        let estimate = est.estimate().unwrap();
        assert!((estimate.offset - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_weight_is_inverse_round_trip() {
        let mut est = ClockEstimator::new(2);
        est.push(ClockSample { offset: 0.0, round_trip: 0.01 });
        est.push(ClockSample { offset: 3.0, round_trip: 0.02 });

        let weights = est.weights();
        assert!((weights[0] / weights[1] - 2.0).abs() < 1e-9);
        // Twice the weight on offset 0.0: (0 * 2 + 3 * 1) / 3
        assert!((est.estimate().unwrap().offset - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_is_order_independent() {
        let samples = [
            ClockSample { offset: 1.0, round_trip: 0.02 },
            ClockSample { offset: 1.2, round_trip: 0.05 },
            ClockSample { offset: 0.9, round_trip: 0.01 },
        ];
        let mut forward = ClockEstimator::new(3);
        let mut backward = ClockEstimator::new(3);
        for s in samples {
            forward.push(s);
        }
        for s in samples.iter().rev() {
            backward.push(*s);
        }
        let a = forward.estimate().unwrap();
        let b = backward.estimate().unwrap();
        assert!((a.offset - b.offset).abs() < 1e-12);
        assert!((a.round_trip - b.round_trip).abs() < 1e-12);
    }

    #[test]
    fn test_window_rolls() {
        let mut est = ClockEstimator::new(2);
        est.push(ClockSample { offset: 5.0, round_trip: 0.01 });
        est.push(ClockSample { offset: 5.0, round_trip: 0.01 });
        est.push(ClockSample { offset: 7.0, round_trip: 0.01 });
        est.push(ClockSample { offset: 7.0, round_trip: 0.01 });
        assert_eq!(est.len(), 2);
        assert!((est.estimate().unwrap().offset - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_diagnostic() {
        let mut est = ClockEstimator::new(2);
        assert_eq!(est.diagnostic(), "measuring 0 / 2");
        est.push(ClockSample { offset: 0.0, round_trip: 0.012 });
        est.push(ClockSample { offset: 0.0, round_trip: 0.040 });
        assert_eq!(est.diagnostic(), "12 ~ 40 ms");
    }
}
