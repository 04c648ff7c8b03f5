// Round-trip time tracking for adaptive probe deadlines
//
// Keeps a fixed ring of recently observed round trips and derives a smoothed
// percentile estimate. The scheduler reads the estimate once per protocol
// period to place the indirect-probe deadline.

use parking_lot::Mutex;
use std::time::Duration;

/// RTT tracker configuration.
#[derive(Debug, Clone)]
pub struct RttConfig {
    /// Number of samples retained in the ring.
    pub sample_count: usize,

    /// Percentile selected from the sorted ring, in [0, 1].
    pub percentile: f64,

    /// EWMA blend weight for the freshly selected percentile.
    pub smoothing_factor: f64,

    /// Value the ring is seeded with before any real samples arrive.
    pub default_rtt: Duration,

    /// Lower clamp for the published estimate.
    pub min_rtt: Duration,

    /// Upper clamp for the published estimate.
    pub max_rtt: Duration,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            sample_count: 64,
            percentile: 0.9,
            smoothing_factor: 0.3,
            default_rtt: Duration::from_millis(200),
            min_rtt: Duration::from_millis(20),
            max_rtt: Duration::from_millis(500),
        }
    }
}

impl RttConfig {
    /// Enforce `min <= default <= max`. An inconsistent min is clamped down
    /// to max first, then the default is clamped into the resulting range.
    pub fn normalized(mut self) -> Self {
        if self.min_rtt > self.max_rtt {
            self.min_rtt = self.max_rtt;
        }
        self.default_rtt = self.default_rtt.clamp(self.min_rtt, self.max_rtt);
        self
    }
}

struct TrackerState {
    samples: Vec<Duration>,
    cursor: usize,
    scratch: Vec<Duration>,
    current: Duration,
}

/// Thread-safe ring of observed round trips with a smoothed percentile
/// output. Callers may `add` and `get` concurrently; `update` is invoked
/// once per protocol period by the scheduler.
pub struct RttTracker {
    config: RttConfig,
    state: Mutex<TrackerState>,
}

impl RttTracker {
    pub fn new(config: RttConfig) -> Self {
        let config = config.normalized();
        let count = config.sample_count.max(1);
        Self {
            state: Mutex::new(TrackerState {
                samples: vec![config.default_rtt; count],
                cursor: 0,
                scratch: Vec::with_capacity(count),
                current: config.default_rtt,
            }),
            config,
        }
    }

    /// Record one observed round trip, overwriting the oldest slot.
    pub fn add(&self, sample: Duration) {
        let mut state = self.state.lock();
        let cursor = state.cursor;
        state.samples[cursor] = sample;
        state.cursor = (cursor + 1) % state.samples.len();
    }

    /// Recompute the estimate: sort a copy of the ring, select the
    /// configured percentile, blend it into the previous output and clamp.
    pub fn update(&self) -> Duration {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.scratch.clear();
        state.scratch.extend_from_slice(&state.samples);
        state.scratch.sort_unstable();

        let index = ((state.scratch.len() - 1) as f64 * self.config.percentile) as usize;
        let selected = state.scratch[index];

        let alpha = self.config.smoothing_factor;
        let blended = alpha * selected.as_secs_f64() + (1.0 - alpha) * state.current.as_secs_f64();
        let clamped = Duration::from_secs_f64(blended)
            .clamp(self.config.min_rtt, self.config.max_rtt);

        state.current = clamped;
        clamped
    }

    /// The most recently computed estimate.
    pub fn get(&self) -> Duration {
        self.state.lock().current
    }
}
