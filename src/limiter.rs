//! Sliding-window byte-rate counters.
//!
//! Two global instances exist, one for upload and one for download. Every
//! send/receive path calls [`RateCounter::add`]; the queue-drain gates in
//! the client engine call [`RateCounter::rate`].

use crate::constants::RATE_WINDOW;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// Thread-safe byte-rate counter averaged over the last [`RATE_WINDOW`].
pub struct RateCounter {
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(256)),
        }
    }

    /// Record `bytes` transferred now.
    pub fn add(&self, bytes: usize) {
        let mut samples = self.samples.lock().unwrap();
        samples.push_back((Instant::now(), bytes as u64));
    }

    /// Bytes per second over the window. Expired samples are dropped here
    /// so an idle counter decays to zero.
    pub fn rate(&self) -> f64 {
        let mut samples = self.samples.lock().unwrap();
        let now = Instant::now();
        while let Some(&(t, _)) = samples.front() {
            if now.duration_since(t) > RATE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
        let total: u64 = samples.iter().map(|&(_, b)| b).sum();
        total as f64 / RATE_WINDOW.as_secs_f64()
    }

    /// Drop all samples. Used when engines restart.
    pub fn reset(&self) {
        self.samples.lock().unwrap().clear();
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}
