//! Loss terms for sparse autoencoder training.
//!
//! Three independent terms summed into the total training loss:
//!
//! - reconstruction (MSE), plain or normalized by the batch-centered target norm
//! - sparsity (L1), optionally scaled by decoder row norms
//! - ghost gradients, a surrogate reconstruction that routes gradient signal
//!   to dead features through an `exp` nonlinearity
//!
//! All functions here are pure over their tensor inputs. The MSE variant is
//! dispatched on [`MseLossNormalization`] at every call site rather than
//! cached, so a mid-run config change takes effect on the next step.

use anyhow::Result;
use candle_core::{Tensor, D};

use crate::config::MseLossNormalization;

/// Additive epsilon guarding zero-norm denominators.
///
/// Degenerate inputs (a zero-norm centered target, a zero-norm ghost
/// reconstruction) are silently stabilized with this value, never reported
/// as errors.
pub const NORM_EPS: f64 = 1e-6;

/// Per-example, per-dimension reconstruction error.
///
/// Shape: `(batch, d_in)` for both inputs and the result.
///
/// `DenseBatch` divides each row's squared error by
/// `‖target − mean₀(target)‖₂ + 1e-6`, the norm of the batch-mean-centered
/// target with the epsilon added outside the square root.
pub fn per_item_mse_loss(
    normalization: MseLossNormalization,
    preds: &Tensor,
    target: &Tensor,
) -> Result<Tensor> {
    let squared_error = (preds - target)?.sqr()?;
    match normalization {
        MseLossNormalization::None => Ok(squared_error),
        MseLossNormalization::DenseBatch => {
            let centered = target.broadcast_sub(&target.mean_keepdim(0)?)?;
            // (batch, 1) row norms of the centered target
            let norm = centered.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
            Ok(squared_error.broadcast_div(&(&norm + NORM_EPS)?)?)
        }
    }
}

/// Batch reconstruction loss: per-item error summed over the input
/// dimension, averaged over the batch. Returns a scalar tensor.
pub fn mse_loss(
    normalization: MseLossNormalization,
    preds: &Tensor,
    target: &Tensor,
) -> Result<Tensor> {
    Ok(per_item_mse_loss(normalization, preds, target)?
        .sum(D::Minus1)?
        .mean_all()?)
}

/// Sparsity penalty on the feature activations, weighted by `l1_coefficient`.
///
/// With `scale_by_decoder_norm`, each feature's activation is first scaled by
/// the L2 norm of its decoder row, so that shrinking a decoder row cannot
/// cheat the penalty. Returns a scalar tensor.
pub fn l1_loss(
    feature_acts: &Tensor,
    w_dec: &Tensor,
    l1_coefficient: f64,
    scale_by_decoder_norm: bool,
) -> Result<Tensor> {
    let penalized = if scale_by_decoder_norm {
        // (d_sae,) decoder row norms
        let row_norms = w_dec.sqr()?.sum(1)?.sqrt()?;
        feature_acts.broadcast_mul(&row_norms)?
    } else {
        feature_acts.clone()
    };
    let l1 = penalized.abs()?.sum(D::Minus1)?.mean_all()?;
    Ok((l1 * l1_coefficient)?)
}

/// Ghost-gradient loss resurrecting dead features.
///
/// The surrogate reconstruction uses only the dead features' pre-activations
/// through `exp` (which, unlike ReLU, carries gradient even when the primary
/// activation is zero) and the dead rows of `W_dec`, then is rescaled in two
/// detached steps:
///
/// 1. L2-matched to half the residual norm: `‖resid‖ / (1e-6 + 2‖ghost‖)`
/// 2. per-item MSE matched to the primary loss:
///    `per_item_mse / (ghost_mse + 1e-6)`
///
/// Both scale factors are detached so they contribute magnitude, not
/// gradient. The caller must pass at least one dead index; when every
/// feature is dead the same path runs over the full dictionary.
///
/// `per_item_mse` is the primary per-item reconstruction error for the same
/// batch, shape `(batch, d_in)`.
pub fn ghost_grad_loss(
    normalization: MseLossNormalization,
    sae_in: &Tensor,
    sae_out: &Tensor,
    hidden_pre: &Tensor,
    w_dec: &Tensor,
    per_item_mse: &Tensor,
    dead_indices: &[u32],
) -> Result<Tensor> {
    anyhow::ensure!(
        !dead_indices.is_empty(),
        "ghost_grad_loss requires at least one dead feature"
    );
    let device = sae_in.device();

    let residual = (sae_in - sae_out)?;
    let l2_residual = residual.sqr()?.sum(D::Minus1)?.sqrt()?;

    let ids = Tensor::from_vec(dead_indices.to_vec(), (dead_indices.len(),), device)?;
    let ghost_acts = hidden_pre.index_select(&ids, 1)?.exp()?;
    let ghost_out = ghost_acts.matmul(&w_dec.index_select(&ids, 0)?)?;

    // Match the ghost reconstruction's norm to half the residual's.
    let l2_ghost = ghost_out.sqr()?.sum(D::Minus1)?.sqrt()?;
    let denom = ((l2_ghost * 2.0)? + NORM_EPS)?;
    let norm_scale = (l2_residual / denom)?.detach();
    let ghost_out = ghost_out.broadcast_mul(&norm_scale.unsqueeze(1)?)?;

    // Rescale the ghost error to the magnitude of the primary loss.
    let per_item_ghost = per_item_mse_loss(normalization, &ghost_out, &residual.detach())?;
    let rescale = (per_item_mse.detach() / &(&per_item_ghost + NORM_EPS)?)?.detach();
    Ok((per_item_ghost * rescale)?.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn close(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_plain_per_item_mse_is_squared_error() {
        let device = Device::Cpu;
        let preds = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &device).unwrap();
        let target = Tensor::from_vec(vec![0.0f32, 2.0, 1.0, 6.0], (2, 2), &device).unwrap();

        let per_item = per_item_mse_loss(MseLossNormalization::None, &preds, &target).unwrap();
        let values = per_item.to_vec2::<f32>().unwrap();
        assert_eq!(values, vec![vec![1.0, 0.0], vec![4.0, 4.0]]);

        // sum over d_in, mean over batch
        let loss = mse_loss(MseLossNormalization::None, &preds, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(close(loss, (1.0 + 8.0) / 2.0, 1e-6));
    }

    #[test]
    fn test_dense_batch_mse_divides_by_centered_target_norm() {
        let device = Device::Cpu;
        let preds = Tensor::randn(0f32, 1f32, (3, 2), &device).unwrap();
        let target = Tensor::randn(0f32, 1f32, (3, 2), &device).unwrap();

        let per_item =
            per_item_mse_loss(MseLossNormalization::DenseBatch, &preds, &target).unwrap();

        // Reference: (preds - target)^2 / sqrt(sum(centered^2))
        let p = preds.to_vec2::<f32>().unwrap();
        let t = target.to_vec2::<f32>().unwrap();
        let mean = [
            (t[0][0] + t[1][0] + t[2][0]) / 3.0,
            (t[0][1] + t[1][1] + t[2][1]) / 3.0,
        ];
        let got = per_item.to_vec2::<f32>().unwrap();
        for i in 0..3 {
            let c0 = t[i][0] - mean[0];
            let c1 = t[i][1] - mean[1];
            let norm = (c0 * c0 + c1 * c1).sqrt();
            for j in 0..2 {
                let expected = (p[i][j] - t[i][j]).powi(2) / norm;
                assert!(
                    close(got[i][j], expected, 1e-4),
                    "mismatch at ({i},{j}): {} vs {expected}",
                    got[i][j]
                );
            }
        }
    }

    #[test]
    fn test_l1_loss_plain_formula() {
        let device = Device::Cpu;
        let acts = Tensor::from_vec(vec![1.0f32, 0.0, 2.0, 3.0, 0.0, 1.0], (2, 3), &device).unwrap();
        let w_dec = Tensor::randn(0f32, 1f32, (3, 4), &device).unwrap();

        let l1 = l1_loss(&acts, &w_dec, 0.5, false)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // 0.5 * mean(3, 4) = 1.75
        assert!(close(l1, 1.75, 1e-6));
    }

    #[test]
    fn test_l1_loss_scaled_by_decoder_norm() {
        let device = Device::Cpu;
        let acts = Tensor::from_vec(vec![1.0f32, 2.0], (1, 2), &device).unwrap();
        // rows with norms 2 and 3
        let w_dec = Tensor::from_vec(vec![2.0f32, 0.0, 0.0, 3.0], (2, 2), &device).unwrap();

        let l1 = l1_loss(&acts, &w_dec, 1.0, true)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // |1*2| + |2*3| = 8
        assert!(close(l1, 8.0, 1e-5));
    }

    #[test]
    fn test_ghost_grad_loss_requires_dead_features() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap();
        let out = Tensor::randn(0f32, 1f32, (4, 3), &device).unwrap();
        let pre = Tensor::randn(0f32, 1f32, (4, 5), &device).unwrap();
        let w_dec = Tensor::randn(0f32, 1f32, (5, 3), &device).unwrap();
        let per_item = per_item_mse_loss(MseLossNormalization::None, &out, &x).unwrap();

        let err = ghost_grad_loss(
            MseLossNormalization::None,
            &x,
            &out,
            &pre,
            &w_dec,
            &per_item,
            &[],
        );
        assert!(err.is_err());

        let loss = ghost_grad_loss(
            MseLossNormalization::None,
            &x,
            &out,
            &pre,
            &w_dec,
            &per_item,
            &[1, 3],
        )
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }
}
