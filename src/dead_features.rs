//! Dead-feature tracking.
//!
//! One counter per dictionary feature: forward passes since the feature
//! last produced a nonzero activation anywhere in a batch. A feature whose
//! counter reaches `dead_feature_window` is dead: eligible for the
//! ghost-gradient loss and for resampling.

use anyhow::Result;
use candle_core::{DType, Tensor};

/// Per-feature "steps since last fired" counters.
///
/// Owned, explicit state: the trainer updates it once per forward pass and
/// reads the dead mask from it. Never stored inside the autograd graph.
#[derive(Debug, Clone)]
pub struct DeadFeatureTracker {
    n_forward_passes_since_fired: Vec<u64>,
    dead_feature_window: u64,
}

impl DeadFeatureTracker {
    pub fn new(d_sae: usize, dead_feature_window: u64) -> Self {
        Self {
            n_forward_passes_since_fired: vec![0; d_sae],
            dead_feature_window,
        }
    }

    /// Update counters from one batch of feature activations `(batch, d_sae)`.
    ///
    /// Features with any activation > 0 across the batch reset to 0; all
    /// others increment by one.
    pub fn record_firings(&mut self, feature_acts: &Tensor) -> Result<()> {
        let fired_per_feature = feature_acts
            .gt(0f32)?
            .to_dtype(DType::F32)?
            .sum(0)?
            .to_vec1::<f32>()?;
        anyhow::ensure!(
            fired_per_feature.len() == self.n_forward_passes_since_fired.len(),
            "feature_acts width {} does not match tracker size {}",
            fired_per_feature.len(),
            self.n_forward_passes_since_fired.len()
        );
        for (count, fired) in self
            .n_forward_passes_since_fired
            .iter_mut()
            .zip(fired_per_feature)
        {
            if fired > 0.0 {
                *count = 0;
            } else {
                *count += 1;
            }
        }
        Ok(())
    }

    /// Whether a feature is currently dead (counter >= window).
    pub fn is_dead(&self, feature: usize) -> bool {
        self.n_forward_passes_since_fired[feature] >= self.dead_feature_window
    }

    /// Indices of all dead features, as u32 for tensor index-select.
    pub fn dead_indices(&self) -> Vec<u32> {
        self.n_forward_passes_since_fired
            .iter()
            .enumerate()
            .filter(|(_, &count)| count >= self.dead_feature_window)
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn n_dead(&self) -> usize {
        self.n_forward_passes_since_fired
            .iter()
            .filter(|&&count| count >= self.dead_feature_window)
            .count()
    }

    pub fn counters(&self) -> &[u64] {
        &self.n_forward_passes_since_fired
    }

    /// Overwrite one feature's counter. Operator/test hook for forcing
    /// features dead or alive.
    pub fn set_count(&mut self, feature: usize, count: u64) {
        self.n_forward_passes_since_fired[feature] = count;
    }

    /// Overwrite every counter with the same value.
    pub fn fill(&mut self, count: u64) {
        self.n_forward_passes_since_fired.fill(count);
    }
}
