//! Configuration for sparse autoencoder training.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Reconstruction-loss normalization mode.
///
/// `DenseBatch` divides each example's squared error by the L2 norm of the
/// batch-mean-centered target, which keeps the reconstruction term comparable
/// across hook points with very different activation scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MseLossNormalization {
    /// Plain per-example squared error.
    #[default]
    None,
    /// Squared error scaled by the norm of the batch-centered target.
    DenseBatch,
}

/// Immutable configuration for a [`SparseAutoencoder`](crate::SparseAutoencoder).
///
/// Created once at run start. The single exception to immutability is
/// `mse_loss_normalization`, which an operator may switch mid-run; the loss
/// dispatch re-reads it on every step, so no refresh call is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseAutoencoderConfig {
    /// Input dimension (width of the activation vectors at the hook point).
    pub d_in: usize,
    /// Dictionary size (number of learned features).
    pub d_sae: usize,
    /// Named location in the base model whose activations we train on,
    /// e.g. `"blocks.1.hook_resid_pre"`. Opaque to the training core.
    pub hook_point: String,
    /// Keep every row of `W_dec` at unit L2 norm after each optimizer step,
    /// and project the parallel component out of its gradient beforehand.
    pub normalize_sae_decoder: bool,
    /// Scale each feature's L1 penalty by its decoder row norm. In practice
    /// mutually exclusive with `normalize_sae_decoder` (unit rows make the
    /// scaling a no-op).
    pub scale_sparsity_penalty_by_decoder_norm: bool,
    /// Reconstruction-loss formula. May be changed mid-run.
    pub mse_loss_normalization: MseLossNormalization,
    /// Weight on the sparsity penalty.
    pub l1_coefficient: f64,
    /// Std-dev of the Gaussian perturbation added to pre-activations during
    /// encoding. Zero disables the noise entirely.
    pub noise_scale: f64,
    /// Enable the ghost-gradient loss term for resurrecting dead features.
    pub use_ghost_grads: bool,
    /// Steps of inactivity before a feature counts as dead.
    pub dead_feature_window: u64,
    /// Subtract `b_dec` from the input before encoding.
    pub apply_b_dec_to_input: bool,
}

impl Default for SparseAutoencoderConfig {
    fn default() -> Self {
        Self {
            d_in: 512,
            d_sae: 2048,
            hook_point: "blocks.0.hook_resid_pre".to_string(),
            normalize_sae_decoder: true,
            scale_sparsity_penalty_by_decoder_norm: false,
            mse_loss_normalization: MseLossNormalization::None,
            l1_coefficient: 1e-3,
            noise_scale: 0.0,
            use_ghost_grads: false,
            dead_feature_window: 1000,
            apply_b_dec_to_input: false,
        }
    }
}

impl SparseAutoencoderConfig {
    /// Validate the configuration.
    ///
    /// Dimension and coefficient errors are not recoverable, so they are
    /// surfaced here rather than deep inside a training step.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.d_in > 0, "d_in must be positive");
        anyhow::ensure!(self.d_sae > 0, "d_sae must be positive");
        anyhow::ensure!(
            self.l1_coefficient >= 0.0,
            "l1_coefficient must be non-negative, got {}",
            self.l1_coefficient
        );
        anyhow::ensure!(
            self.noise_scale >= 0.0,
            "noise_scale must be non-negative, got {}",
            self.noise_scale
        );
        anyhow::ensure!(
            self.dead_feature_window > 0,
            "dead_feature_window must be positive"
        );
        if self.normalize_sae_decoder && self.scale_sparsity_penalty_by_decoder_norm {
            // Unit-norm rows make the decoder-norm scaling a no-op.
            warn!(
                "normalize_sae_decoder and scale_sparsity_penalty_by_decoder_norm \
                 are both set; the scaled L1 penalty degenerates to the plain one"
            );
        }
        Ok(())
    }
}
