//! Launch times for arrival-rate scenarios.
//!
//! The iteration rate changes linearly within each stage, from the previous stage's target (or the
//! start rate) to the stage's own target. Iteration `k` is launched at the moment the integral of
//! the rate over time reaches `k`, so the schedule is a pure function of the configuration and can
//! be checked without running anything.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tolerance for floating point comparisons of iteration counts.
const EPSILON: f64 = 1e-9;

/// One linear ramp of the target rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Stage {
    /// Iterations per time unit reached at the end of the stage.
    pub target: u64,
    /// How long the ramp takes.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Stage {
    /// Creates a stage ramping to `target` over `duration`.
    pub fn new(target: u64, duration: Duration) -> Self {
        Self { target, duration }
    }
}

#[derive(Clone, Copy, Debug)]
struct Segment {
    /// Offset of the segment start, in seconds.
    start: f64,
    /// Length, in seconds.
    duration: f64,
    /// Rate at the start, per second.
    from: f64,
    /// Rate change per second.
    slope: f64,
    /// Iterations launched in all previous segments.
    before: f64,
    /// Iterations launched in this segment.
    total: f64,
}

impl Segment {
    /// Seconds into the segment at which `n` iterations have been launched.
    fn offset_of(&self, n: f64) -> f64 {
        if n <= 0.0 {
            return 0.0;
        }

        let offset = if self.slope.abs() < EPSILON {
            n / self.from
        } else {
            // Solves `from * t + slope / 2 * t^2 = n` in a form that is stable for small slopes.
            let discriminant = (self.from * self.from + 2.0 * self.slope * n).max(0.0);
            2.0 * n / (self.from + discriminant.sqrt())
        };

        offset.clamp(0.0, self.duration)
    }
}

/// Iterator over the launch offsets of an arrival-rate scenario, relative to its start.
#[derive(Clone, Debug)]
pub struct ArrivalSchedule {
    segments: Vec<Segment>,
    duration: Duration,
    next: u64,
    segment: usize,
}

impl ArrivalSchedule {
    /// Creates the schedule for rates given per `time_unit`.
    ///
    /// `time_unit` must not be zero.
    pub fn new(start_rate: u64, time_unit: Duration, stages: &[Stage]) -> Self {
        let unit = time_unit.as_secs_f64();
        let mut segments = Vec::with_capacity(stages.len());

        let mut start = 0.0;
        let mut before = 0.0;
        let mut from = start_rate as f64 / unit;

        for stage in stages {
            let duration = stage.duration.as_secs_f64();
            let to = stage.target as f64 / unit;
            if duration > 0.0 {
                let total = (from + to) / 2.0 * duration;
                segments.push(Segment {
                    start,
                    duration,
                    from,
                    slope: (to - from) / duration,
                    before,
                    total,
                });
                before += total;
            }

            start += duration;
            from = to;
        }

        Self {
            segments,
            duration: stages.iter().map(|stage| stage.duration).sum(),
            next: 0,
            segment: 0,
        }
    }

    /// Total length of all stages.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Number of iterations the schedule launches in total.
    pub fn total(&self) -> u64 {
        let total = self
            .segments
            .last()
            .map_or(0.0, |segment| segment.before + segment.total);
        (total - EPSILON).ceil().max(0.0) as u64
    }
}

impl Iterator for ArrivalSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let k = self.next as f64;

        while let Some(segment) = self.segments.get(self.segment) {
            if k < segment.before + segment.total - EPSILON {
                self.next += 1;
                let offset = segment.start + segment.offset_of(k - segment.before);
                return Some(Duration::from_secs_f64(offset));
            }
            self.segment += 1;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn assert_close(actual: Duration, expected_secs: f64) {
        let diff = (actual.as_secs_f64() - expected_secs).abs();
        assert!(diff < 1e-6, "expected {expected_secs}s, got {actual:?}");
    }

    #[test]
    fn constant_rate() {
        let schedule = ArrivalSchedule::new(10, secs(1), &[Stage::new(10, secs(1))]);
        assert_eq!(schedule.total(), 10);

        let offsets: Vec<_> = schedule.collect();
        assert_eq!(offsets.len(), 10);
        for (i, offset) in offsets.into_iter().enumerate() {
            assert_close(offset, i as f64 * 0.1);
        }
    }

    #[test]
    fn zero_rate_launches_nothing() {
        let mut schedule = ArrivalSchedule::new(0, secs(1), &[Stage::new(0, secs(10))]);
        assert_eq!(schedule.duration(), secs(10));
        assert_eq!(schedule.total(), 0);
        assert_eq!(schedule.next(), None);

        let mut empty = ArrivalSchedule::new(5, secs(1), &[]);
        assert_eq!(empty.next(), None);
    }

    #[test]
    fn linear_ramp_up() {
        // 0 -> 10/s over 10s: the integral is t^2 / 2
        let schedule = ArrivalSchedule::new(0, secs(1), &[Stage::new(10, secs(10))]);
        assert_eq!(schedule.total(), 50);

        let offsets: Vec<_> = schedule.collect();
        assert_eq!(offsets.len(), 50);
        assert_close(offsets[0], 0.0);
        assert_close(offsets[2], 2.0);
        assert_close(offsets[8], 4.0);
        assert_close(offsets[32], 8.0);
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn ramp_down_and_hold() {
        let stages = [Stage::new(100, secs(2)), Stage::new(0, secs(2))];
        let schedule = ArrivalSchedule::new(100, secs(1), &stages);
        // 200 during the hold, 100 during the ramp down
        assert_eq!(schedule.total(), 300);

        let offsets: Vec<_> = schedule.collect();
        assert_eq!(offsets.len(), 300);
        assert_close(offsets[199], 1.99);
        assert!(offsets[200] >= secs(2));
        assert!(offsets.iter().all(|offset| *offset <= secs(4)));
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn rates_are_per_time_unit() {
        let stages = [Stage::new(60, secs(5))];
        let schedule = ArrivalSchedule::new(60, Duration::from_secs(60), &stages);
        let offsets: Vec<_> = schedule.collect();

        assert_eq!(offsets.len(), 5);
        assert_close(offsets[4], 4.0);
    }

    #[test]
    fn original_publisher_profile() {
        let stages = [
            Stage::new(50, secs(30)),
            Stage::new(100, secs(30)),
            Stage::new(100, secs(60)),
            Stage::new(50, secs(30)),
            Stage::new(0, secs(30)),
        ];
        let schedule = ArrivalSchedule::new(0, secs(1), &stages);

        assert_eq!(schedule.duration(), secs(180));
        // 750 + 2250 + 6000 + 2250 + 750
        assert_eq!(schedule.total(), 12_000);
        assert_eq!(schedule.count(), 12_000);
    }
}
