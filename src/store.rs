//! Activation sources feeding the trainer.
//!
//! The real tokenize-and-buffer pipeline lives outside this crate; the
//! trainer only ever sees a materialized `(batch, d_in)` tensor pulled
//! through [`ActivationSource`].

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;

/// Supplier of activation batches.
pub trait ActivationSource {
    /// Produce the next `(batch_size, d_in)` activation batch.
    fn next_batch(&mut self, batch_size: usize) -> Result<Tensor>;

    /// Width of the activation vectors this source yields.
    fn d_in(&self) -> usize;
}

/// A preloaded activation matrix, served in order and cycled endlessly.
pub struct InMemoryActivationStore {
    activations: Tensor,
    cursor: usize,
}

impl InMemoryActivationStore {
    /// Wrap an `(n, d_in)` activation matrix.
    pub fn new(activations: Tensor) -> Result<Self> {
        let (n, _d_in) = activations
            .dims2()
            .context("activation store expects a rank-2 tensor")?;
        anyhow::ensure!(n > 0, "activation store is empty");
        Ok(Self {
            activations: activations.to_dtype(DType::F32)?,
            cursor: 0,
        })
    }

    /// Load a named tensor from a safetensors file.
    pub fn from_safetensors<P: AsRef<Path>>(path: P, key: &str, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), device).with_context(|| {
            format!("Failed to load activations from {}", path.as_ref().display())
        })?;
        let activations = tensors
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Tensor '{key}' not found in activation file"))?;
        Self::new(activations.clone())
    }

    /// Number of stored activation rows.
    pub fn len(&self) -> usize {
        self.activations.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ActivationSource for InMemoryActivationStore {
    fn next_batch(&mut self, batch_size: usize) -> Result<Tensor> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let n = self.len();
        let mut parts = Vec::new();
        let mut remaining = batch_size;
        while remaining > 0 {
            let take = remaining.min(n - self.cursor);
            parts.push(self.activations.narrow(0, self.cursor, take)?);
            self.cursor = (self.cursor + take) % n;
            remaining -= take;
        }
        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(Tensor::cat(&parts, 0)?)
        }
    }

    fn d_in(&self) -> usize {
        self.activations.dims()[1]
    }
}

/// Synthetic standard-normal activations.
///
/// Stands in for a model + store pair in demos and tests; deterministic for
/// a given seed.
pub struct GaussianActivationStore {
    d_in: usize,
    device: Device,
    rng: StdRng,
    unit_normal: Normal,
}

impl GaussianActivationStore {
    pub fn new(d_in: usize, seed: u64, device: &Device) -> Result<Self> {
        anyhow::ensure!(d_in > 0, "d_in must be positive");
        let unit_normal = Normal::new(0.0, 1.0)
            .map_err(|e| anyhow::anyhow!("failed to construct unit normal: {e}"))?;
        Ok(Self {
            d_in,
            device: device.clone(),
            rng: StdRng::seed_from_u64(seed),
            unit_normal,
        })
    }
}

impl ActivationSource for GaussianActivationStore {
    fn next_batch(&mut self, batch_size: usize) -> Result<Tensor> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let data: Vec<f32> = (0..batch_size * self.d_in)
            .map(|_| self.unit_normal.sample(&mut self.rng) as f32)
            .collect();
        Ok(Tensor::from_vec(data, (batch_size, self.d_in), &self.device)?)
    }

    fn d_in(&self) -> usize {
        self.d_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_cycles() {
        let device = Device::Cpu;
        let data = Tensor::from_vec(vec![0f32, 1.0, 2.0], (3, 1), &device).unwrap();
        let mut store = InMemoryActivationStore::new(data).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.d_in(), 1);

        let b1 = store.next_batch(2).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(b1, vec![vec![0.0], vec![1.0]]);

        // Wraps around the end of the buffer.
        let b2 = store.next_batch(2).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(b2, vec![vec![2.0], vec![0.0]]);
    }

    #[test]
    fn test_batch_larger_than_store_repeats_rows() {
        let device = Device::Cpu;
        let data = Tensor::from_vec(vec![0f32, 1.0], (2, 1), &device).unwrap();
        let mut store = InMemoryActivationStore::new(data).unwrap();
        let b = store.next_batch(5).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(b, vec![vec![0.0], vec![1.0], vec![0.0], vec![1.0], vec![0.0]]);
    }

    #[test]
    fn test_empty_store_rejected() {
        let device = Device::Cpu;
        let data = Tensor::zeros((0, 4), DType::F32, &device).unwrap();
        assert!(InMemoryActivationStore::new(data).is_err());
    }

    #[test]
    fn test_gaussian_store_is_seeded() {
        let device = Device::Cpu;
        let mut a = GaussianActivationStore::new(4, 9, &device).unwrap();
        let mut b = GaussianActivationStore::new(4, 9, &device).unwrap();
        let ba = a.next_batch(3).unwrap().to_vec2::<f32>().unwrap();
        let bb = b.next_batch(3).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(ba, bb);
    }

    #[test]
    fn test_safetensors_round_trip() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acts.safetensors");

        let acts = Tensor::randn(0f32, 1f32, (8, 4), &device).unwrap();
        let map: std::collections::HashMap<String, Tensor> =
            [("activations".to_string(), acts.clone())].into_iter().collect();
        candle_core::safetensors::save(&map, &path).unwrap();

        let mut store =
            InMemoryActivationStore::from_safetensors(&path, "activations", &device).unwrap();
        assert_eq!(store.len(), 8);
        assert_eq!(store.d_in(), 4);
        let batch = store.next_batch(8).unwrap();
        assert_eq!(
            batch.to_vec2::<f32>().unwrap(),
            acts.to_vec2::<f32>().unwrap()
        );

        assert!(InMemoryActivationStore::from_safetensors(&path, "missing", &device).is_err());
    }
}
