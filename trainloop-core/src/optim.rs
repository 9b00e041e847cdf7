//! Optimizer and learning-rate scheduler interfaces, with reference implementations.

use crate::error::{Result, RunnerError};
use crate::nn::{Parameter, StateDict};
use crate::tensor::Tensor;
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serializable optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: String,
    pub lr: f64,
    pub step: u64,
    #[serde(default)]
    pub hyper: BTreeMap<String, f64>,
    /// Per-parameter buffers keyed `<buffer>.<parameter>`.
    #[serde(default)]
    pub buffers: StateDict,
}

/// Updates parameters from their accumulated gradients.
pub trait Optimizer: Send {
    fn name(&self) -> &str;

    /// Apply one update to every trainable parameter that has a gradient.
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()>;

    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);

    fn state_dict(&self) -> OptimizerState;

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()>;
}

fn check_kind(expected: &str, state: &OptimizerState) -> Result<()> {
    if state.kind != expected {
        return Err(RunnerError::state_not_found(format!(
            "optimizer state is for '{}', expected '{expected}'",
            state.kind
        )));
    }
    Ok(())
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    step: u64,
    velocity: StateDict,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum,
            step: 0,
            velocity: StateDict::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "Sgd"
    }

    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        self.step += 1;
        let lr = self.lr as f32;
        let momentum = self.momentum as f32;
        for p in params.iter_mut().filter(|p| p.trainable) {
            let Some(grad) = p.grad.as_ref() else {
                continue;
            };
            p.value.ensure_same_shape(grad, "Sgd update")?;
            if momentum > 0.0 {
                let v = self
                    .velocity
                    .entry(p.name.clone())
                    .or_insert_with(|| Tensor::zeros_like(grad));
                v.ensure_same_shape(grad, "Sgd momentum")?;
                Zip::from(v.array_mut())
                    .and(grad.array())
                    .for_each(|vi, &gi| *vi = momentum * *vi + gi);
                p.value.array_mut().scaled_add(-lr, v.array());
            } else {
                p.value.array_mut().scaled_add(-lr, grad.array());
            }
            p.value.requantize();
        }
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            kind: self.name().to_string(),
            lr: self.lr,
            step: self.step,
            hyper: BTreeMap::from([("momentum".to_string(), self.momentum)]),
            buffers: self
                .velocity
                .iter()
                .map(|(k, v)| (format!("velocity.{k}"), v.clone()))
                .collect(),
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        check_kind(self.name(), state)?;
        self.lr = state.lr;
        self.step = state.step;
        if let Some(m) = state.hyper.get("momentum") {
            self.momentum = *m;
        }
        self.velocity = state
            .buffers
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("velocity.").map(|n| (n.to_string(), v.clone())))
            .collect();
        Ok(())
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: u64,
    m: StateDict,
    v: StateDict,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self::with_betas(lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(lr: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            step: 0,
            m: StateDict::new(),
            v: StateDict::new(),
        }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "Adam"
    }

    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        self.step += 1;
        let t = self.step as i32;
        let lr_t = self.lr * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));
        let (b1, b2, eps, lr_t) = (
            self.beta1 as f32,
            self.beta2 as f32,
            self.eps as f32,
            lr_t as f32,
        );
        for p in params.iter_mut().filter(|p| p.trainable) {
            let Some(grad) = p.grad.as_ref() else {
                continue;
            };
            let m = self
                .m
                .entry(p.name.clone())
                .or_insert_with(|| Tensor::zeros_like(grad));
            let v = self
                .v
                .entry(p.name.clone())
                .or_insert_with(|| Tensor::zeros_like(grad));
            if m.shape() != grad.shape() || v.shape() != grad.shape() {
                return Err(RunnerError::tensor(format!(
                    "Adam state for '{}' does not match its gradient shape",
                    p.name
                )));
            }
            p.value.ensure_same_shape(grad, "Adam update")?;
            Zip::from(p.value.array_mut())
                .and(m.array_mut())
                .and(v.array_mut())
                .and(grad.array())
                .for_each(|w, mi, vi, &g| {
                    *mi = b1 * *mi + (1.0 - b1) * g;
                    *vi = b2 * *vi + (1.0 - b2) * g * g;
                    *w -= lr_t * *mi / (vi.sqrt() + eps);
                });
            p.value.requantize();
        }
        Ok(())
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state_dict(&self) -> OptimizerState {
        let buffers = self
            .m
            .iter()
            .map(|(k, t)| (format!("m.{k}"), t.clone()))
            .chain(self.v.iter().map(|(k, t)| (format!("v.{k}"), t.clone())))
            .collect();
        OptimizerState {
            kind: self.name().to_string(),
            lr: self.lr,
            step: self.step,
            hyper: BTreeMap::from([
                ("beta1".to_string(), self.beta1),
                ("beta2".to_string(), self.beta2),
                ("eps".to_string(), self.eps),
            ]),
            buffers,
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        check_kind(self.name(), state)?;
        self.lr = state.lr;
        self.step = state.step;
        self.beta1 = state.hyper.get("beta1").copied().unwrap_or(self.beta1);
        self.beta2 = state.hyper.get("beta2").copied().unwrap_or(self.beta2);
        self.eps = state.hyper.get("eps").copied().unwrap_or(self.eps);
        self.m.clear();
        self.v.clear();
        for (key, tensor) in &state.buffers {
            if let Some(name) = key.strip_prefix("m.") {
                self.m.insert(name.to_string(), tensor.clone());
            } else if let Some(name) = key.strip_prefix("v.") {
                self.v.insert(name.to_string(), tensor.clone());
            }
        }
        Ok(())
    }
}

/// Serializable scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: String,
    pub last_epoch: u64,
    pub base_lr: f64,
    #[serde(default)]
    pub hyper: BTreeMap<String, f64>,
}

/// Adjusts an optimizer's learning rate over time.
pub trait Scheduler: Send {
    fn name(&self) -> &str;

    /// Advance one scheduling step. `metric` is provided for metric-driven schedules.
    fn step(&mut self, optimizer: &mut dyn Optimizer, metric: Option<f64>);

    fn state_dict(&self) -> SchedulerState;

    fn load_state_dict(&mut self, state: &SchedulerState) -> Result<()>;
}

/// Multiply the learning rate by `gamma` every `step_size` steps.
#[derive(Debug, Clone)]
pub struct StepLr {
    step_size: u64,
    gamma: f64,
    base_lr: f64,
    last_epoch: u64,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: u64, gamma: f64) -> Self {
        Self {
            step_size: step_size.max(1),
            gamma,
            base_lr,
            last_epoch: 0,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.gamma.powi((self.last_epoch / self.step_size) as i32)
    }
}

impl Scheduler for StepLr {
    fn name(&self) -> &str {
        "StepLr"
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer, _metric: Option<f64>) {
        self.last_epoch += 1;
        optimizer.set_lr(self.current_lr());
    }

    fn state_dict(&self) -> SchedulerState {
        SchedulerState {
            kind: self.name().to_string(),
            last_epoch: self.last_epoch,
            base_lr: self.base_lr,
            hyper: BTreeMap::from([
                ("step_size".to_string(), self.step_size as f64),
                ("gamma".to_string(), self.gamma),
            ]),
        }
    }

    fn load_state_dict(&mut self, state: &SchedulerState) -> Result<()> {
        if state.kind != self.name() {
            return Err(RunnerError::state_not_found(format!(
                "scheduler state is for '{}', expected 'StepLr'",
                state.kind
            )));
        }
        self.last_epoch = state.last_epoch;
        self.base_lr = state.base_lr;
        if let Some(s) = state.hyper.get("step_size") {
            self.step_size = (*s as u64).max(1);
        }
        if let Some(g) = state.hyper.get("gamma") {
            self.gamma = *g;
        }
        Ok(())
    }
}
