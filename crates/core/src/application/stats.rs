// Rolling latency statistics for push/pop

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::application::constants::STAT_MAX_SAMPLES;

/// Aggregate over the samples currently inside the window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatSnapshot {
    pub count: usize,
    pub sum: i64,
    pub average: f64,
}

/// Time-windowed sample tracker
///
/// Samples older than `window_ms` are discarded on every access.
pub struct RollingStat {
    window_ms: i64,
    samples: Mutex<VecDeque<(i64, i64)>>,
}

impl RollingStat {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a sample taken at `now_millis`
    pub fn add_sample(&self, now_millis: i64, value: i64) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back((now_millis, value));
        if samples.len() > STAT_MAX_SAMPLES {
            samples.pop_front();
        }
        Self::evict(&mut samples, now_millis - self.window_ms);
    }

    pub fn snapshot(&self, now_millis: i64) -> StatSnapshot {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        Self::evict(&mut samples, now_millis - self.window_ms);

        let count = samples.len();
        let sum: i64 = samples.iter().map(|(_, v)| v).sum();
        let average = if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        };
        StatSnapshot {
            count,
            sum,
            average,
        }
    }

    fn evict(samples: &mut VecDeque<(i64, i64)>, cutoff: i64) {
        while samples.front().is_some_and(|(at, _)| *at < cutoff) {
            samples.pop_front();
        }
    }
}
