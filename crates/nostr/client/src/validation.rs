//! Sampled signature verification
//!
//! Each relay starts by verifying every event it delivers. As it accumulates
//! clean history the verification ratio converges toward a floor.

use std::sync::Arc;

/// Computes a new target ratio from `(current_target, validated, non_validated)`.
pub type ValidationRatioFn = Arc<dyn Fn(f64, u64, u64) -> f64 + Send + Sync>;

/// Per-relay verification sampler.
pub struct ValidationSampler {
    trusted: bool,
    initial_ratio: Option<f64>,
    lowest_ratio: f64,
    target_ratio: Option<f64>,
    validated: u64,
    non_validated: u64,
    ratio_fn: ValidationRatioFn,
}

impl ValidationSampler {
    pub fn new(initial_ratio: f64, lowest_ratio: f64) -> Self {
        Self {
            trusted: false,
            initial_ratio: Some(initial_ratio),
            lowest_ratio,
            target_ratio: Some(initial_ratio),
            validated: 0,
            non_validated: 0,
            ratio_fn: default_ratio_fn(initial_ratio, lowest_ratio),
        }
    }

    /// A sampler with no target always verifies.
    pub fn unconfigured() -> Self {
        Self {
            trusted: false,
            initial_ratio: None,
            lowest_ratio: 1.0,
            target_ratio: None,
            validated: 0,
            non_validated: 0,
            ratio_fn: Arc::new(|current, _, _| current),
        }
    }

    pub fn with_ratio_fn(mut self, ratio_fn: ValidationRatioFn) -> Self {
        self.ratio_fn = ratio_fn;
        self
    }

    pub fn set_trusted(&mut self, trusted: bool) {
        self.trusted = trusted;
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Whether the next event should have its signature verified.
    pub fn should_validate(&self) -> bool {
        if self.trusted {
            return false;
        }
        let Some(target) = self.target_ratio else {
            return true;
        };
        if target >= 1.0 {
            return true;
        }
        rand::random::<f64>() < target
    }

    pub fn add_validated(&mut self) {
        self.validated += 1;
        self.update_ratio();
    }

    pub fn add_non_validated(&mut self) {
        self.non_validated += 1;
    }

    fn update_ratio(&mut self) {
        let Some(current) = self.target_ratio else {
            return;
        };
        let next = (self.ratio_fn)(current, self.validated, self.non_validated);
        self.target_ratio = Some(next.clamp(self.lowest_ratio.min(1.0), 1.0));
    }

    pub fn target_ratio(&self) -> Option<f64> {
        self.target_ratio
    }

    pub fn initial_ratio(&self) -> Option<f64> {
        self.initial_ratio
    }

    pub fn validated_count(&self) -> u64 {
        self.validated
    }

    pub fn non_validated_count(&self) -> u64 {
        self.non_validated
    }

    /// Fraction of delivered events that were actually verified.
    pub fn achieved_ratio(&self) -> f64 {
        if self.non_validated == 0 {
            return 1.0;
        }
        self.validated as f64 / (self.validated + self.non_validated) as f64
    }
}

/// Below 10 validated events the initial ratio holds. After that the ratio
/// blends linearly toward `lowest` and reaches it at 100 validated events.
pub fn default_ratio_fn(initial: f64, lowest: f64) -> ValidationRatioFn {
    Arc::new(move |_current, validated, _non_validated| {
        if validated < 10 {
            return initial;
        }
        let trust = (validated as f64 / 100.0).min(1.0);
        (initial * (1.0 - trust) + lowest * trust).max(lowest)
    })
}
