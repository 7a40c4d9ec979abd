//! The sparse autoencoder model.
//!
//! Holds the four weight tensors as `candle` [`Var`]s so the optimizer and
//! autograd see them:
//!
//! ```text
//! Encode:  feature_acts = ReLU(x @ W_enc + b_enc [+ noise])
//! Decode:  sae_out      = feature_acts @ W_dec + b_dec
//! ```
//!
//! Weight mutation happens in exactly three places: the optimizer step,
//! [`SparseAutoencoder::set_decoder_norm_to_unit_norm`], and
//! [`SparseAutoencoder::resample_features`]. Gradient surgery lives in
//! [`SparseAutoencoder::remove_gradient_parallel_to_decoder_directions`],
//! which edits the [`GradStore`] before the optimizer consumes it; the two
//! invariants (unit decoder rows, no norm drift through the update) are kept
//! consistent by calling projection before the step and renormalization
//! after it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use tracing::{debug, info};

use crate::config::{MseLossNormalization, SparseAutoencoderConfig};
use crate::loss::NORM_EPS;

/// Sparse autoencoder over one hook point's activations.
pub struct SparseAutoencoder {
    cfg: SparseAutoencoderConfig,
    /// (d_in, d_sae)
    w_enc: Var,
    /// (d_sae,)
    b_enc: Var,
    /// (d_sae, d_in)
    w_dec: Var,
    /// (d_in,)
    b_dec: Var,
    device: Device,
    rng: StdRng,
    unit_normal: Normal,
}

impl SparseAutoencoder {
    /// Construct a freshly initialized SAE.
    ///
    /// Weight matrices get Kaiming-uniform initialization, biases start at
    /// zero, and the decoder is renormalized to unit rows up front when
    /// `normalize_sae_decoder` is set. All randomness (initialization and
    /// later encode noise) comes from the caller-supplied seed.
    pub fn new(cfg: SparseAutoencoderConfig, device: &Device, seed: u64) -> Result<Self> {
        cfg.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let unit_normal = Normal::new(0.0, 1.0)
            .map_err(|e| anyhow::anyhow!("failed to construct unit normal: {e}"))?;

        let w_enc = Var::from_tensor(&kaiming_uniform(&mut rng, cfg.d_in, cfg.d_sae, device)?)?;
        let b_enc = Var::zeros(cfg.d_sae, DType::F32, device)?;
        let w_dec = Var::from_tensor(&kaiming_uniform(&mut rng, cfg.d_sae, cfg.d_in, device)?)?;
        let b_dec = Var::zeros(cfg.d_in, DType::F32, device)?;

        let mut sae = Self {
            cfg,
            w_enc,
            b_enc,
            w_dec,
            b_dec,
            device: device.clone(),
            rng,
            unit_normal,
        };
        if sae.cfg.normalize_sae_decoder {
            sae.set_decoder_norm_to_unit_norm()?;
        }
        debug!(
            "Initialized SAE: d_in={}, d_sae={}, hook_point={}",
            sae.cfg.d_in, sae.cfg.d_sae, sae.cfg.hook_point
        );
        Ok(sae)
    }

    pub fn cfg(&self) -> &SparseAutoencoderConfig {
        &self.cfg
    }

    pub fn d_in(&self) -> usize {
        self.cfg.d_in
    }

    pub fn d_sae(&self) -> usize {
        self.cfg.d_sae
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn w_enc(&self) -> &Var {
        &self.w_enc
    }

    pub fn b_enc(&self) -> &Var {
        &self.b_enc
    }

    pub fn w_dec(&self) -> &Var {
        &self.w_dec
    }

    pub fn b_dec(&self) -> &Var {
        &self.b_dec
    }

    /// Switch the reconstruction-loss formula mid-run. The loss dispatch
    /// re-reads the config on every step, so this takes effect immediately.
    pub fn set_mse_loss_normalization(&mut self, normalization: MseLossNormalization) {
        self.cfg.mse_loss_normalization = normalization;
    }

    /// The variables the optimizer trains, in a stable order.
    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![
            self.w_enc.clone(),
            self.b_enc.clone(),
            self.w_dec.clone(),
            self.b_dec.clone(),
        ]
    }

    // --- Forward pass ---

    /// Encode a `(batch, d_in)` activation batch into feature activations.
    pub fn encode(&mut self, x: &Tensor) -> Result<Tensor> {
        let (feature_acts, _) = self.encode_with_hidden_pre(x)?;
        Ok(feature_acts)
    }

    /// Encode, returning both the feature activations and the un-noised
    /// pre-activations.
    ///
    /// The pre-activations feed the ghost-gradient loss, which needs the
    /// clean linear response of each feature; noise only perturbs what goes
    /// through the ReLU. A fresh noise draw happens on every call when
    /// `noise_scale > 0`.
    pub fn encode_with_hidden_pre(&mut self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, width) = x.dims2()?;
        anyhow::ensure!(
            width == self.cfg.d_in,
            "activation batch width {width} does not match d_in {}",
            self.cfg.d_in
        );

        let sae_in = if self.cfg.apply_b_dec_to_input {
            x.broadcast_sub(self.b_dec.as_tensor())?
        } else {
            x.clone()
        };

        let hidden_pre = sae_in
            .matmul(self.w_enc.as_tensor())?
            .broadcast_add(self.b_enc.as_tensor())?;

        let noisy_hidden_pre = if self.cfg.noise_scale > 0.0 {
            let noise = self.gaussian_noise(batch, self.cfg.d_sae)?;
            (&hidden_pre + &noise)?
        } else {
            hidden_pre.clone()
        };

        let feature_acts = noisy_hidden_pre.relu()?;
        Ok((feature_acts, hidden_pre))
    }

    /// Reconstruct the input from `(batch, d_sae)` feature activations.
    pub fn decode(&self, feature_acts: &Tensor) -> Result<Tensor> {
        let (_, width) = feature_acts.dims2()?;
        anyhow::ensure!(
            width == self.cfg.d_sae,
            "feature_acts width {width} does not match d_sae {}",
            self.cfg.d_sae
        );
        Ok(feature_acts
            .matmul(self.w_dec.as_tensor())?
            .broadcast_add(self.b_dec.as_tensor())?)
    }

    /// Encode then decode. No state survives beyond the return value.
    pub fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        let feature_acts = self.encode(x)?;
        self.decode(&feature_acts)
    }

    // --- Invariant maintenance ---

    /// Rescale every decoder row to unit L2 norm, in place.
    ///
    /// Idempotent: rows already at unit norm are left untouched (up to the
    /// 1e-6 epsilon guarding zero-norm rows). Called after every optimizer
    /// step when `normalize_sae_decoder` is set.
    pub fn set_decoder_norm_to_unit_norm(&mut self) -> Result<()> {
        let w_dec = self.w_dec.as_tensor();
        let norms = (w_dec.sqr()?.sum_keepdim(1)?.sqrt()? + NORM_EPS)?;
        let normalized = w_dec.broadcast_div(&norms)?;
        self.w_dec.set(&normalized)?;
        Ok(())
    }

    /// Project the component parallel to each decoder row out of `W_dec`'s
    /// gradient, editing the grad store in place before the optimizer step.
    ///
    /// With unit-norm rows, the parallel component is exactly the part of
    /// the update that would change row norms; removing it leaves norm
    /// control entirely to [`Self::set_decoder_norm_to_unit_norm`]. The
    /// weights themselves are untouched. No-op when decoder normalization
    /// is disabled or no gradient is present.
    pub fn remove_gradient_parallel_to_decoder_directions(
        &self,
        grads: &mut GradStore,
    ) -> Result<()> {
        if !self.cfg.normalize_sae_decoder {
            return Ok(());
        }
        let Some(grad) = grads.remove(self.w_dec.as_tensor()) else {
            return Ok(());
        };
        let directions = self.w_dec.as_tensor().detach();
        // (d_sae, 1) per-row dot products of gradient and direction
        let parallel = (&grad * &directions)?.sum_keepdim(1)?;
        let projected = (grad - directions.broadcast_mul(&parallel)?)?;
        grads.insert(self.w_dec.as_tensor(), projected);
        Ok(())
    }

    /// Reinitialize dead features' weights.
    ///
    /// Each listed feature gets a fresh random unit decoder row, an encoder
    /// column following the same direction at 0.2x scale, and a zeroed
    /// encoder bias. Counterpart to the dead-feature tracker's periodic
    /// resampling trigger.
    pub fn resample_features(&mut self, dead: &[usize]) -> Result<()> {
        if dead.is_empty() {
            return Ok(());
        }
        for &f in dead {
            anyhow::ensure!(
                f < self.cfg.d_sae,
                "resample index {f} out of range (d_sae={})",
                self.cfg.d_sae
            );
        }

        let mut w_dec = self.w_dec.as_tensor().to_vec2::<f32>()?;
        let mut w_enc = self.w_enc.as_tensor().to_vec2::<f32>()?;
        let mut b_enc = self.b_enc.as_tensor().to_vec1::<f32>()?;

        for &f in dead {
            let mut row: Vec<f32> = (0..self.cfg.d_in)
                .map(|_| self.unit_normal.sample(&mut self.rng) as f32)
                .collect();
            let norm = row
                .iter()
                .map(|v| v * v)
                .sum::<f32>()
                .sqrt()
                .max(NORM_EPS as f32);
            for v in &mut row {
                *v /= norm;
            }
            for (i, &v) in row.iter().enumerate() {
                w_enc[i][f] = v * 0.2;
            }
            w_dec[f] = row;
            b_enc[f] = 0.0;
        }

        let d_in = self.cfg.d_in;
        let d_sae = self.cfg.d_sae;
        let w_dec_flat: Vec<f32> = w_dec.into_iter().flatten().collect();
        let w_enc_flat: Vec<f32> = w_enc.into_iter().flatten().collect();
        self.w_dec
            .set(&Tensor::from_vec(w_dec_flat, (d_sae, d_in), &self.device)?)?;
        self.w_enc
            .set(&Tensor::from_vec(w_enc_flat, (d_in, d_sae), &self.device)?)?;
        self.b_enc
            .set(&Tensor::from_vec(b_enc, d_sae, &self.device)?)?;

        info!("Resampled {} dead features", dead.len());
        Ok(())
    }

    // --- Persistence ---

    /// Save the four weight tensors to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors: HashMap<String, Tensor> = [
            ("W_enc".to_string(), self.w_enc.as_tensor().clone()),
            ("b_enc".to_string(), self.b_enc.as_tensor().clone()),
            ("W_dec".to_string(), self.w_dec.as_tensor().clone()),
            ("b_dec".to_string(), self.b_dec.as_tensor().clone()),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, path.as_ref()).with_context(|| {
            format!("Failed to save SAE weights to {}", path.as_ref().display())
        })
    }

    /// Load weights saved by [`Self::save`], validating shapes against `cfg`.
    pub fn load<P: AsRef<Path>>(
        path: P,
        cfg: SparseAutoencoderConfig,
        device: &Device,
        seed: u64,
    ) -> Result<Self> {
        cfg.validate()?;
        let tensors = candle_core::safetensors::load(path.as_ref(), device).with_context(|| {
            format!("Failed to load SAE weights from {}", path.as_ref().display())
        })?;
        let get = |name: &str| -> Result<&Tensor> {
            tensors
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("Tensor '{name}' missing from checkpoint"))
        };

        let w_enc = get("W_enc")?;
        let w_dec = get("W_dec")?;
        anyhow::ensure!(
            w_enc.dims2()? == (cfg.d_in, cfg.d_sae),
            "W_enc shape {:?} does not match config ({}, {})",
            w_enc.dims(),
            cfg.d_in,
            cfg.d_sae
        );
        anyhow::ensure!(
            w_dec.dims2()? == (cfg.d_sae, cfg.d_in),
            "W_dec shape {:?} does not match config ({}, {})",
            w_dec.dims(),
            cfg.d_sae,
            cfg.d_in
        );

        let unit_normal = Normal::new(0.0, 1.0)
            .map_err(|e| anyhow::anyhow!("failed to construct unit normal: {e}"))?;
        Ok(Self {
            w_enc: Var::from_tensor(w_enc)?,
            b_enc: Var::from_tensor(get("b_enc")?)?,
            w_dec: Var::from_tensor(w_dec)?,
            b_dec: Var::from_tensor(get("b_dec")?)?,
            cfg,
            device: device.clone(),
            rng: StdRng::seed_from_u64(seed),
            unit_normal,
        })
    }

    /// Fresh `(rows, cols)` Gaussian noise scaled by `noise_scale`.
    fn gaussian_noise(&mut self, rows: usize, cols: usize) -> Result<Tensor> {
        let scale = self.cfg.noise_scale;
        let data: Vec<f32> = (0..rows * cols)
            .map(|_| (self.unit_normal.sample(&mut self.rng) * scale) as f32)
            .collect();
        Ok(Tensor::from_vec(data, (rows, cols), &self.device)?)
    }
}

/// Kaiming-uniform matrix: U(-b, b) with b = sqrt(6 / fan_in), fan_in taken
/// from the trailing dimension.
fn kaiming_uniform(rng: &mut StdRng, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    let bound = (6.0 / cols as f64).sqrt();
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-bound..bound) as f32)
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}
