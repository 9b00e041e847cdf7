//! Model and criterion interfaces consumed by the runner, with reference implementations.

use crate::device::Device;
use crate::error::{Result, RunnerError};
use crate::tensor::{DType, Tensor};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Named model state, ordered by parameter name.
pub type StateDict = BTreeMap<String, Tensor>;

/// A named tensor with an optional accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub grad: Option<Tensor>,
    /// `false` for buffers (running statistics and the like) that optimizers skip.
    pub trainable: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
            trainable: true,
        }
    }

    pub fn buffer(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            trainable: false,
            ..Self::new(name, value)
        }
    }

    /// Add `grad` into the accumulated gradient.
    pub fn accumulate_grad(&mut self, grad: Tensor) -> Result<()> {
        match &mut self.grad {
            Some(existing) => existing.add_assign(&grad),
            None => {
                self.grad = Some(grad);
                Ok(())
            }
        }
    }
}

/// A trainable model. Numeric internals are opaque to the runner.
pub trait Model: Send {
    fn name(&self) -> &str;

    /// Compute outputs for `input`, remembering whatever `backward` needs.
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Accumulate parameter gradients given dLoss/dOutput of the last forward pass.
    fn backward(&mut self, grad_output: &Tensor) -> Result<()>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Switch between training and evaluation behaviour.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn to_device(&mut self, device: Device) {
        for p in self.parameters_mut() {
            p.value.set_device(device);
        }
    }

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.grad = None;
        }
    }

    fn state_dict(&self) -> StateDict {
        self.parameters()
            .into_iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }

    /// Replace every parameter value from `state`, keeping each parameter's device and
    /// dtype. Missing or mis-shaped entries are rejected before anything is modified.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        for p in self.parameters() {
            let saved = state.get(&p.name).ok_or_else(|| {
                RunnerError::state_not_found(format!("parameter '{}' missing from state", p.name))
            })?;
            if saved.shape() != p.value.shape() {
                return Err(RunnerError::state_not_found(format!(
                    "parameter '{}' has shape {:?} in state, expected {:?}",
                    p.name,
                    saved.shape(),
                    p.value.shape()
                )));
            }
        }
        for p in self.parameters_mut() {
            if let Some(saved) = state.get(&p.name) {
                let (device, dtype) = (p.value.device(), p.value.dtype());
                p.value = saved.clone().to_device(device).to_dtype(dtype);
                p.grad = None;
            }
        }
        Ok(())
    }

    /// Working precision of the trainable parameters.
    fn dtype(&self) -> DType {
        self.parameters()
            .into_iter()
            .find(|p| p.trainable)
            .map(|p| p.value.dtype())
            .unwrap_or_default()
    }
}

/// Fully connected layer `y = x W^T + b`, the reference model.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
    training: bool,
    last_input: Option<Tensor>,
}

impl Linear {
    /// Uniform(-1/sqrt(in), 1/sqrt(in)) initialisation from a seeded generator.
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn((out_features, in_features), |_| {
            rng.gen_range(-bound..=bound)
        });
        let bias = Array1::from_shape_fn(out_features, |_| rng.gen_range(-bound..=bound));
        Self {
            weight: Parameter::new("weight", Tensor::matrix(weight)),
            bias: Parameter::new("bias", Tensor::vector(bias)),
            training: true,
            last_input: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.cols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.rows()
    }
}

impl Model for Linear {
    fn name(&self) -> &str {
        "Linear"
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if input.cols() != self.in_features() {
            return Err(RunnerError::tensor(format!(
                "Linear expects {} input features, got {}",
                self.in_features(),
                input.cols()
            )));
        }
        let weight = self.weight.value.as_matrix()?;
        let mut out = input.as_matrix()?.dot(&weight.t());
        out += &self.bias.value.as_vector()?;
        let out = Tensor::matrix(out)
            .to_device(input.device())
            .to_dtype(input.dtype());
        if self.training {
            self.last_input = Some(input.clone());
        }
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<()> {
        let input = self
            .last_input
            .as_ref()
            .ok_or_else(|| RunnerError::tensor("Linear::backward called before forward"))?;
        // dW = g^T x, db = sum over batch of g; accumulated in f32.
        let g = grad_output.clone().to_dtype(DType::F32);
        let x = input.clone().to_dtype(DType::F32);
        let (g, x) = (g.as_matrix()?, x.as_matrix()?);
        if g.nrows() != x.nrows() || g.ncols() != self.out_features() {
            return Err(RunnerError::tensor(format!(
                "Linear::backward got gradient of shape {:?} for input of shape {:?}",
                g.shape(),
                x.shape()
            )));
        }
        let device = grad_output.device();
        let grad_w = Tensor::matrix(g.t().dot(&x)).to_device(device);
        let grad_b = Tensor::vector(g.sum_axis(Axis(0))).to_device(device);
        self.weight.accumulate_grad(grad_w)?;
        self.bias.accumulate_grad(grad_b)?;
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.last_input = None;
        }
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// A scalar loss and its gradient with respect to the prediction it was computed from.
#[derive(Debug, Clone)]
pub struct Loss {
    pub value: f64,
    pub grad: Tensor,
}

/// Computes a loss from a prediction and a target.
pub trait Criterion: Send {
    fn name(&self) -> &str;

    fn compute(&self, prediction: &Tensor, target: &Tensor) -> Result<Loss>;
}

/// Mean squared error averaged over every element.
#[derive(Debug, Clone, Copy, Default)]
pub struct MseLoss;

impl Criterion for MseLoss {
    fn name(&self) -> &str {
        "MseLoss"
    }

    fn compute(&self, prediction: &Tensor, target: &Tensor) -> Result<Loss> {
        let pred = prediction.clone().to_dtype(DType::F32);
        let diff = pred.sub(target)?;
        let n = diff.len().max(1) as f32;
        let value = diff.array().iter().map(|d| f64::from(d * d)).sum::<f64>() / f64::from(n);
        Ok(Loss {
            value,
            grad: diff.scale(2.0 / n),
        })
    }
}
