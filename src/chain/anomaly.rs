use std::collections::VecDeque;

/// Rolling mean/standard-deviation baseline over a bounded trailing window.
///
/// Deviation checks are gated on a minimum sample count so a cold start can
/// never flag an anomaly.
#[derive(Debug)]
pub struct RollingBaseline {
    window: VecDeque<f64>,
    capacity: usize,
    min_samples: usize,
    sigma_limit: f64,
}

impl RollingBaseline {
    pub fn new(capacity: usize, min_samples: usize, sigma_limit: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            min_samples: min_samples.max(2),
            sigma_limit,
        }
    }

    /// Add an observation, evicting the oldest once the window is full.
    pub fn observe(&mut self, value: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .window
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n as f64;
        var.sqrt()
    }

    /// z-score of `value` against the window, or None below the sample gate.
    ///
    /// A near-zero standard deviation is floored so a spike on a perfectly
    /// flat baseline still yields a finite, very large z.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.window.len() < self.min_samples {
            return None;
        }
        let mean = self.mean();
        let floor = (mean.abs() * 1e-3).max(1e-9);
        let sd = self.std_dev().max(floor);
        Some((value - mean) / sd)
    }

    pub fn is_anomalous(&self, value: f64) -> bool {
        self.z_score(value)
            .map(|z| z.abs() > self.sigma_limit)
            .unwrap_or(false)
    }
}
