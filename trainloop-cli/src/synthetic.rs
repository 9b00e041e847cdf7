//! Synthetic regression data for config-only runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use trainloop_core::data::{LoaderSet, TensorLoader};
use trainloop_core::{Result, Tensor};

/// The `[data]` section of a run file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub features: usize,
    pub train_samples: usize,
    pub valid_samples: usize,
    pub batch_size: usize,
    /// Half-width of the uniform noise added to targets.
    pub noise: f32,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            features: 1,
            train_samples: 256,
            valid_samples: 64,
            batch_size: 32,
            noise: 0.05,
            seed: 0,
        }
    }
}

/// Samples of `y = x . w + b + noise` with `x` uniform in `[-1, 1)`.
pub struct Regression {
    config: DataConfig,
    weights: Vec<f32>,
    bias: f32,
}

impl Regression {
    pub fn new(config: DataConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let weights: Vec<f32> = (0..config.features).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let bias: f32 = rng.gen_range(-1.0..1.0);
        Self {
            config,
            weights,
            bias,
        }
    }

    fn split(&self, samples: usize, rng: &mut StdRng) -> Result<TensorLoader> {
        let d = self.config.features;
        let mut x = Vec::with_capacity(samples * d);
        let mut y = Vec::with_capacity(samples);
        for _ in 0..samples {
            let row: Vec<f32> = (0..d).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let mut target = self.bias + row.iter().zip(&self.weights).map(|(a, w)| a * w).sum::<f32>();
            if self.config.noise > 0.0 {
                target += rng.gen_range(-self.config.noise..self.config.noise);
            }
            x.extend(row);
            y.push(target);
        }
        TensorLoader::new(
            Tensor::from_vec(vec![samples, d], x)?,
            Tensor::from_vec(vec![samples, 1], y)?,
            self.config.batch_size,
        )
    }

    /// `train` and `valid` loaders. Every stage sees the same samples.
    pub fn loaders(&self) -> Result<LoaderSet> {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));
        let train = self.split(self.config.train_samples, &mut rng)?;
        let valid = self.split(self.config.valid_samples, &mut rng)?;
        LoaderSet::new().with("train", train)?.with("valid", valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trainloop_core::Loader;

    #[test]
    fn test_loaders_are_deterministic_per_seed() {
        let config = DataConfig {
            features: 3,
            train_samples: 10,
            valid_samples: 4,
            batch_size: 4,
            ..DataConfig::default()
        };
        let (a, b) = (Regression::new(config.clone()), Regression::new(config));
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.bias, b.bias);

        let loaders = a.loaders().unwrap();
        assert_eq!(loaders.keys(), vec!["train", "valid"]);
        assert_eq!(loaders.get("train").unwrap().len(), Some(3));
        assert_eq!(loaders.get("valid").unwrap().len(), Some(1));
    }
}
