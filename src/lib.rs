// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, n, f standard in math
#![allow(clippy::similar_names)] // related variables like `w_enc`/`b_enc`
#![allow(clippy::module_name_repetitions)] // SaeTrainer in trainer.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns

//! sae-rs: sparse autoencoder training over transformer activations
//!
//! Trains SAEs on streamed residual-stream activations from a pretrained
//! transformer: a dictionary of sparse features learned to reconstruct the
//! activations at one hook point under an L1 penalty, with ghost gradients
//! resurrecting features that stop firing.
//!
//! ## Architecture
//!
//! - `config`: SAE configuration and loss-normalization modes
//! - `sae`: the model: encoder/decoder weights, forward pass, decoder
//!   unit-norm maintenance and gradient projection
//! - `loss`: reconstruction, sparsity, and ghost-gradient loss terms
//! - `dead_features`: per-feature "steps since last fired" counters
//! - `trainer`: the step pipeline and streaming fit loop
//! - `store`: activation sources (the real buffering pipeline is external)
//!
//! The activation store and the base model are external collaborators; the
//! trainer consumes whatever rank-2 batches an [`ActivationSource`] yields.

pub mod config;
pub mod dead_features;
pub mod loss;
pub mod sae;
pub mod store;
pub mod trainer;

pub use config::{MseLossNormalization, SparseAutoencoderConfig};
pub use dead_features::DeadFeatureTracker;
pub use loss::{ghost_grad_loss, l1_loss, mse_loss, per_item_mse_loss, NORM_EPS};
pub use sae::SparseAutoencoder;
pub use store::{ActivationSource, GaussianActivationStore, InMemoryActivationStore};
pub use trainer::{
    SaeTrainer, SaveCheckpointFn, TrainStepMetrics, TrainStepOutput, TrainerConfig,
};
