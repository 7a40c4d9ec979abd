//! Training orchestration.
//!
//! One step runs a fixed pipeline, in this exact order:
//!
//! 1. forward pass (encode → decode → loss terms → dead-counter update)
//! 2. backward pass
//! 3. project the parallel component out of the decoder gradient
//! 4. optimizer step
//! 5. renormalize decoder rows to unit norm
//!
//! The pipeline is synchronous and single-threaded: exactly one step is in
//! flight against a given SAE at a time. Checkpointing is an injected
//! callback; this module decides cadence, never format.

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MseLossNormalization;
use crate::dead_features::DeadFeatureTracker;
use crate::loss::{ghost_grad_loss, l1_loss, per_item_mse_loss, NORM_EPS};
use crate::sae::SparseAutoencoder;
use crate::store::ActivationSource;

/// Injected checkpoint hook: `(step, sae)`. The trainer invokes it every
/// `checkpoint_every` steps and consumes no return value beyond the error.
pub type SaveCheckpointFn = Box<dyn FnMut(usize, &SparseAutoencoder) -> Result<()>>;

/// Trainer-side knobs, separate from the SAE's own config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    /// Linear warmup from 0 to `learning_rate` over this many steps.
    pub lr_warmup_steps: usize,
    /// Invoke the checkpoint callback every N steps. 0 disables.
    pub checkpoint_every: usize,
    /// Log a feature-firing-frequency summary every N steps. 0 disables.
    pub feature_sampling_window: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            lr_warmup_steps: 500,
            checkpoint_every: 0,
            feature_sampling_window: 1000,
        }
    }
}

/// Ephemeral result of one training forward pass. The loss components stay
/// attached to the autograd graph; scalar accessors read them out for
/// logging without disturbing it.
pub struct TrainStepOutput {
    /// Reconstruction, `(batch, d_in)`.
    pub sae_out: Tensor,
    /// Feature activations, `(batch, d_sae)`.
    pub feature_acts: Tensor,
    /// Un-noised pre-activations, `(batch, d_sae)`.
    pub hidden_pre: Tensor,
    /// Total loss (scalar): `mse + l1 + ghost_grad`.
    pub loss: Tensor,
    pub mse_loss: Tensor,
    pub l1_loss: Tensor,
    pub ghost_grad_loss: Tensor,
}

impl TrainStepOutput {
    pub fn loss_value(&self) -> Result<f32> {
        Ok(self.loss.to_scalar::<f32>()?)
    }

    pub fn mse_loss_value(&self) -> Result<f32> {
        Ok(self.mse_loss.to_scalar::<f32>()?)
    }

    pub fn l1_loss_value(&self) -> Result<f32> {
        Ok(self.l1_loss.to_scalar::<f32>()?)
    }

    pub fn ghost_grad_loss_value(&self) -> Result<f32> {
        Ok(self.ghost_grad_loss.to_scalar::<f32>()?)
    }
}

/// Detached per-step training metrics.
#[derive(Debug, Clone, Serialize)]
pub struct TrainStepMetrics {
    pub step: usize,
    pub loss: f32,
    pub mse_loss: f32,
    pub l1_loss: f32,
    pub ghost_grad_loss: f32,
    /// Mean number of active features per example.
    pub l0: f32,
    /// 1 - residual variance / input variance, batch mean.
    pub explained_variance: f32,
    pub n_dead_features: usize,
    pub learning_rate: f64,
    pub n_training_tokens: usize,
}

/// Orchestrates SAE training over a streamed activation source.
pub struct SaeTrainer {
    sae: SparseAutoencoder,
    trainer_cfg: TrainerConfig,
    optimizer: AdamW,
    tracker: DeadFeatureTracker,
    save_checkpoint: Option<SaveCheckpointFn>,
    n_training_steps: usize,
    n_training_tokens: usize,
    window_fired: Vec<u64>,
    window_steps: usize,
}

impl SaeTrainer {
    pub fn new(sae: SparseAutoencoder, trainer_cfg: TrainerConfig) -> Result<Self> {
        anyhow::ensure!(
            trainer_cfg.learning_rate > 0.0,
            "learning_rate must be positive, got {}",
            trainer_cfg.learning_rate
        );
        let optimizer = AdamW::new(
            sae.trainable_vars(),
            ParamsAdamW {
                lr: trainer_cfg.learning_rate,
                ..Default::default()
            },
        )?;
        let tracker = DeadFeatureTracker::new(sae.d_sae(), sae.cfg().dead_feature_window);
        let window_fired = vec![0; sae.d_sae()];
        Ok(Self {
            sae,
            trainer_cfg,
            optimizer,
            tracker,
            save_checkpoint: None,
            n_training_steps: 0,
            n_training_tokens: 0,
            window_fired,
            window_steps: 0,
        })
    }

    /// Install the checkpoint callback.
    pub fn with_checkpoint_fn(mut self, f: SaveCheckpointFn) -> Self {
        self.save_checkpoint = Some(f);
        self
    }

    pub fn sae(&self) -> &SparseAutoencoder {
        &self.sae
    }

    pub fn sae_mut(&mut self) -> &mut SparseAutoencoder {
        &mut self.sae
    }

    pub fn tracker(&self) -> &DeadFeatureTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut DeadFeatureTracker {
        &mut self.tracker
    }

    pub fn n_training_steps(&self) -> usize {
        self.n_training_steps
    }

    /// Operator switch for the reconstruction-loss formula; effective on the
    /// next step because the dispatch re-reads the config every call.
    pub fn set_mse_loss_normalization(&mut self, normalization: MseLossNormalization) {
        self.sae.set_mse_loss_normalization(normalization);
    }

    /// One training forward pass: encode, decode, loss terms, dead-feature
    /// counter update. No backward pass, no weight mutation.
    pub fn training_forward_pass(&mut self, sae_in: &Tensor) -> Result<TrainStepOutput> {
        let cfg = self.sae.cfg().clone();

        // The ghost term reads the dead mask as of the start of the step;
        // counters update after the losses are formed.
        let dead = self.tracker.dead_indices();

        let (feature_acts, hidden_pre) = self.sae.encode_with_hidden_pre(sae_in)?;
        let sae_out = self.sae.decode(&feature_acts)?;

        let per_item_mse = per_item_mse_loss(cfg.mse_loss_normalization, &sae_out, sae_in)?;
        let mse_loss = per_item_mse.sum(D::Minus1)?.mean_all()?;
        let l1_loss = l1_loss(
            &feature_acts,
            self.sae.w_dec().as_tensor(),
            cfg.l1_coefficient,
            cfg.scale_sparsity_penalty_by_decoder_norm,
        )?;

        let ghost_grad_loss = if cfg.use_ghost_grads && !dead.is_empty() {
            ghost_grad_loss(
                cfg.mse_loss_normalization,
                sae_in,
                &sae_out,
                &hidden_pre,
                self.sae.w_dec().as_tensor(),
                &per_item_mse,
                &dead,
            )?
        } else {
            // Constant zero: contributes nothing to the graph.
            Tensor::zeros((), DType::F32, sae_in.device())?
        };

        self.tracker.record_firings(&feature_acts)?;
        self.accumulate_firing_window(&feature_acts)?;

        let loss = ((&mse_loss + &l1_loss)? + &ghost_grad_loss)?;
        Ok(TrainStepOutput {
            sae_out,
            feature_acts,
            hidden_pre,
            loss,
            mse_loss,
            l1_loss,
            ghost_grad_loss,
        })
    }

    /// One full optimization step, in the fixed pipeline order.
    pub fn train_step(&mut self, sae_in: &Tensor) -> Result<TrainStepMetrics> {
        self.optimizer.set_learning_rate(self.warmup_lr());

        let output = self.training_forward_pass(sae_in)?;
        let mut grads = output.loss.backward()?;
        self.sae
            .remove_gradient_parallel_to_decoder_directions(&mut grads)?;
        self.optimizer.step(&grads)?;
        if self.sae.cfg().normalize_sae_decoder {
            self.sae.set_decoder_norm_to_unit_norm()?;
        }

        self.n_training_steps += 1;
        self.n_training_tokens += sae_in.dims2()?.0;
        self.build_metrics(&output, sae_in)
    }

    /// Train against a streamed activation source.
    ///
    /// Halts with an error the first time a step produces a non-finite
    /// loss; there is no auto-recovery for NaN/Inf propagation.
    pub fn fit<S: ActivationSource + ?Sized>(
        &mut self,
        source: &mut S,
        batch_size: usize,
        total_steps: usize,
    ) -> Result<Vec<TrainStepMetrics>> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(
            source.d_in() == self.sae.d_in(),
            "activation source width {} does not match d_in {}",
            source.d_in(),
            self.sae.d_in()
        );
        info!(
            "Training for {total_steps} steps: batch_size={batch_size}, d_in={}, d_sae={}",
            self.sae.d_in(),
            self.sae.d_sae()
        );

        let mut history = Vec::with_capacity(total_steps);
        for _ in 0..total_steps {
            let batch = source.next_batch(batch_size)?;
            let metrics = self.train_step(&batch)?;
            anyhow::ensure!(
                metrics.loss.is_finite(),
                "non-finite loss at step {}: {}",
                metrics.step,
                metrics.loss
            );

            if metrics.step % 100 == 0 {
                info!(
                    "step {}: loss={:.5} (mse={:.5}, l1={:.5}, ghost={:.5}), l0={:.1}, dead={}",
                    metrics.step,
                    metrics.loss,
                    metrics.mse_loss,
                    metrics.l1_loss,
                    metrics.ghost_grad_loss,
                    metrics.l0,
                    metrics.n_dead_features
                );
            } else {
                debug!("step {}: loss={:.5}", metrics.step, metrics.loss);
            }
            self.maybe_log_feature_sparsity();

            if self.trainer_cfg.checkpoint_every > 0
                && metrics.step % self.trainer_cfg.checkpoint_every == 0
            {
                if let Some(save) = self.save_checkpoint.as_mut() {
                    save(metrics.step, &self.sae)?;
                }
            }
            history.push(metrics);
        }
        Ok(history)
    }

    fn warmup_lr(&self) -> f64 {
        let warmup = self.trainer_cfg.lr_warmup_steps;
        if warmup == 0 || self.n_training_steps >= warmup {
            self.trainer_cfg.learning_rate
        } else {
            self.trainer_cfg.learning_rate * (self.n_training_steps + 1) as f64 / warmup as f64
        }
    }

    fn build_metrics(&self, output: &TrainStepOutput, sae_in: &Tensor) -> Result<TrainStepMetrics> {
        let l0 = output
            .feature_acts
            .gt(0f32)?
            .to_dtype(DType::F32)?
            .sum(D::Minus1)?
            .mean_all()?
            .to_scalar::<f32>()?;

        let sae_out = output.sae_out.detach();
        let per_token_l2 = (&sae_out - sae_in)?.sqr()?.sum(D::Minus1)?;
        let centered = sae_in.broadcast_sub(&sae_in.mean_keepdim(0)?)?;
        let total_variance = (centered.sqr()?.sum(D::Minus1)? + NORM_EPS)?;
        let ratio = (per_token_l2 / total_variance)?;
        let explained_variance = 1.0 - ratio.mean_all()?.to_scalar::<f32>()?;

        Ok(TrainStepMetrics {
            step: self.n_training_steps,
            loss: output.loss_value()?,
            mse_loss: output.mse_loss_value()?,
            l1_loss: output.l1_loss_value()?,
            ghost_grad_loss: output.ghost_grad_loss_value()?,
            l0,
            explained_variance,
            n_dead_features: self.tracker.n_dead(),
            learning_rate: self.optimizer.learning_rate(),
            n_training_tokens: self.n_training_tokens,
        })
    }

    fn accumulate_firing_window(&mut self, feature_acts: &Tensor) -> Result<()> {
        if self.trainer_cfg.feature_sampling_window == 0 {
            return Ok(());
        }
        let fired = feature_acts
            .gt(0f32)?
            .to_dtype(DType::F32)?
            .sum(0)?
            .to_vec1::<f32>()?;
        for (count, f) in self.window_fired.iter_mut().zip(fired) {
            if f > 0.0 {
                *count += 1;
            }
        }
        self.window_steps += 1;
        Ok(())
    }

    fn maybe_log_feature_sparsity(&mut self) {
        let window = self.trainer_cfg.feature_sampling_window;
        if window == 0 || self.window_steps < window {
            return;
        }
        let steps = self.window_steps as f64;
        let freqs: Vec<f64> = self
            .window_fired
            .iter()
            .map(|&c| c as f64 / steps)
            .collect();
        let mean = freqs.iter().sum::<f64>() / freqs.len() as f64;
        let rare = freqs.iter().filter(|&&f| f < 1e-4).count();
        info!(
            "Feature firing over last {} steps: mean frequency {:.5}, {} features below 1e-4",
            self.window_steps, mean, rare
        );
        self.window_fired.fill(0);
        self.window_steps = 0;
    }
}
