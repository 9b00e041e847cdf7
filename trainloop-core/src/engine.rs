//! Device and numeric-precision engine.
//!
//! An [`Engine`] binds one [`Device`] and one [`PrecisionMode`] for the lifetime of a
//! run. It moves data onto its device, casts model weights and activations to the
//! mode's working precision, and performs the precision-correct update sequence:
//! scaled backward, overflow check, unscale, optimizer step on FP32 master weights
//! where the mode keeps them, and loss-scale adjustment. All of that state is owned
//! here rather than attached to the model or optimizer.

use crate::data::Batch;
use crate::device::{Device, DeviceCapabilities};
use crate::error::{Result, RunnerError};
use crate::nn::{Loss, Model, Parameter, StateDict};
use crate::optim::Optimizer;
use crate::state::StageComponents;
use crate::tensor::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Closed set of numeric precision modes.
///
/// `O0`..`O3` follow the usual mixed-precision opt levels: `O0` is FP32 under the
/// mixed-precision engine, `O1` autocasts activations, `O2` keeps FP16 weights with
/// FP32 master copies, `O3` is pure FP16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrecisionMode {
    #[default]
    Full,
    O0,
    O1,
    O2,
    O3,
}

impl PrecisionMode {
    pub const ALL: [PrecisionMode; 5] = [
        PrecisionMode::Full,
        PrecisionMode::O0,
        PrecisionMode::O1,
        PrecisionMode::O2,
        PrecisionMode::O3,
    ];

    /// Every mode except `Full` needs an accelerator device.
    pub fn requires_accelerator(&self) -> bool {
        !matches!(self, PrecisionMode::Full)
    }

    pub fn policy(&self) -> PrecisionPolicy {
        match self {
            PrecisionMode::Full => PrecisionPolicy {
                weight_dtype: DType::F32,
                activation_dtype: DType::F32,
                loss_scaling: LossScaling::None,
                master_weights: false,
                upcast_buffers: false,
            },
            PrecisionMode::O0 => PrecisionPolicy {
                weight_dtype: DType::F32,
                activation_dtype: DType::F32,
                loss_scaling: LossScaling::Static(1.0),
                master_weights: false,
                upcast_buffers: false,
            },
            PrecisionMode::O1 => PrecisionPolicy {
                weight_dtype: DType::F32,
                activation_dtype: DType::F16,
                loss_scaling: LossScaling::Dynamic,
                master_weights: false,
                upcast_buffers: false,
            },
            PrecisionMode::O2 => PrecisionPolicy {
                weight_dtype: DType::F16,
                activation_dtype: DType::F16,
                loss_scaling: LossScaling::Dynamic,
                master_weights: true,
                upcast_buffers: true,
            },
            PrecisionMode::O3 => PrecisionPolicy {
                weight_dtype: DType::F16,
                activation_dtype: DType::F16,
                loss_scaling: LossScaling::Static(1.0),
                master_weights: false,
                upcast_buffers: false,
            },
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrecisionMode::Full => "full",
            PrecisionMode::O0 => "O0",
            PrecisionMode::O1 => "O1",
            PrecisionMode::O2 => "O2",
            PrecisionMode::O3 => "O3",
        };
        f.write_str(name)
    }
}

impl FromStr for PrecisionMode {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FULL" | "FP32" => Ok(PrecisionMode::Full),
            "O0" => Ok(PrecisionMode::O0),
            "O1" => Ok(PrecisionMode::O1),
            "O2" => Ok(PrecisionMode::O2),
            "O3" => Ok(PrecisionMode::O3),
            other => Err(RunnerError::configuration(format!(
                "unknown precision mode '{other}'"
            ))),
        }
    }
}

/// How a precision mode scales the loss before backward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LossScaling {
    None,
    Static(f32),
    Dynamic,
}

/// What a precision mode fixes about weights, activations and gradients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrecisionPolicy {
    pub weight_dtype: DType,
    pub activation_dtype: DType,
    pub loss_scaling: LossScaling,
    /// Keep FP32 copies of reduced-precision weights and step those.
    pub master_weights: bool,
    /// Keep non-trainable buffers in FP32 even when weights are reduced.
    pub upcast_buffers: bool,
}

/// Default initial scale for dynamic loss scaling.
pub const DEFAULT_INIT_SCALE: f32 = 65536.0;
/// Default number of clean steps before the dynamic scale grows.
pub const DEFAULT_GROWTH_INTERVAL: u64 = 2000;

/// Loss scaler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LossScaler {
    None,
    Static {
        scale: f32,
    },
    Dynamic {
        scale: f32,
        growth_factor: f32,
        backoff_factor: f32,
        growth_interval: u64,
        steps_since_overflow: u64,
    },
}

impl LossScaler {
    pub fn for_policy(policy: &PrecisionPolicy) -> Self {
        match policy.loss_scaling {
            LossScaling::None => LossScaler::None,
            LossScaling::Static(scale) => LossScaler::Static { scale },
            LossScaling::Dynamic => LossScaler::dynamic(DEFAULT_INIT_SCALE, 2.0, DEFAULT_GROWTH_INTERVAL),
        }
    }

    pub fn dynamic(initial_scale: f32, growth_factor: f32, growth_interval: u64) -> Self {
        LossScaler::Dynamic {
            scale: initial_scale,
            growth_factor,
            backoff_factor: 0.5,
            growth_interval,
            steps_since_overflow: 0,
        }
    }

    pub fn scale(&self) -> f32 {
        match self {
            LossScaler::None => 1.0,
            LossScaler::Static { scale } | LossScaler::Dynamic { scale, .. } => *scale,
        }
    }

    /// Record the outcome of a step. Returns `true` if the optimizer step should proceed.
    pub fn update(&mut self, overflow: bool) -> bool {
        match self {
            LossScaler::Dynamic {
                scale,
                growth_factor,
                backoff_factor,
                growth_interval,
                steps_since_overflow,
            } => {
                if overflow {
                    *scale = (*scale * *backoff_factor).max(1.0);
                    *steps_since_overflow = 0;
                    false
                } else {
                    *steps_since_overflow += 1;
                    if *steps_since_overflow >= *growth_interval {
                        *scale *= *growth_factor;
                        *steps_since_overflow = 0;
                    }
                    true
                }
            }
            _ => !overflow,
        }
    }
}

/// Step counters kept by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub backward_calls: u64,
    pub optimizer_steps: u64,
    pub skipped_steps: u64,
}

/// Engine state persisted alongside model state in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub precision: PrecisionMode,
    pub scaler: LossScaler,
    #[serde(default)]
    pub master_weights: Option<StateDict>,
    #[serde(default)]
    pub stats: EngineStats,
}

/// Device/precision binding for one run.
#[derive(Debug)]
pub struct Engine {
    name: String,
    device: Device,
    precision: PrecisionMode,
    policy: PrecisionPolicy,
    scaler: LossScaler,
    master_weights: Option<Vec<Parameter>>,
    stats: EngineStats,
}

impl Engine {
    /// Bind `device` and `precision`, failing fast if the host cannot provide them.
    pub fn new(
        device: Device,
        precision: PrecisionMode,
        capabilities: &DeviceCapabilities,
    ) -> Result<Self> {
        capabilities.check(&device)?;
        if precision.requires_accelerator() && !device.is_accelerator() {
            return Err(RunnerError::configuration(format!(
                "precision mode {precision} requires an accelerator device, got {device}"
            )));
        }
        let policy = precision.policy();
        let name = if precision == PrecisionMode::Full {
            "DeviceEngine"
        } else {
            "AmpEngine"
        };
        Ok(Self {
            name: name.to_string(),
            device,
            precision,
            policy,
            scaler: LossScaler::for_policy(&policy),
            master_weights: None,
            stats: EngineStats::default(),
        })
    }

    /// Full-precision engine on `device`.
    pub fn device_engine(device: Device, capabilities: &DeviceCapabilities) -> Result<Self> {
        Self::new(device, PrecisionMode::Full, capabilities)
    }

    /// Full precision on the CPU; always available.
    pub fn cpu() -> Self {
        let policy = PrecisionMode::Full.policy();
        Self {
            name: "DeviceEngine".to_string(),
            device: Device::Cpu,
            precision: PrecisionMode::Full,
            policy,
            scaler: LossScaler::None,
            master_weights: None,
            stats: EngineStats::default(),
        }
    }

    /// Replace the loss scaler, e.g. to tune dynamic scaling constants.
    pub fn with_scaler(mut self, scaler: LossScaler) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.scale()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Adapt the stage's components to this engine's device and precision.
    pub fn prepare(&mut self, components: &mut StageComponents) -> Result<()> {
        let model = components.model_mut()?;
        self.prepare_model(model);
        debug!(
            engine = %self.name,
            device = %self.device,
            precision = %self.precision,
            "Prepared stage components"
        );
        Ok(())
    }

    fn prepare_model(&mut self, model: &mut dyn Model) {
        model.to_device(self.device);
        let policy = self.policy;
        for p in model.parameters_mut() {
            let dtype = if !p.trainable && policy.upcast_buffers {
                DType::F32
            } else {
                policy.weight_dtype
            };
            p.value.cast_in_place(dtype);
            p.grad = None;
        }
        self.master_weights = if policy.master_weights {
            match self.master_weights.take() {
                Some(masters) if masters_track(&masters, model) => {
                    debug!("Keeping FP32 master weights of the carried-over model");
                    Some(masters)
                }
                _ => Some(snapshot_master_weights(model)),
            }
        } else {
            None
        };
    }

    /// Move a tensor onto the bound device.
    pub fn sync_device(&self, tensor: Tensor) -> Tensor {
        tensor.to_device(self.device)
    }

    /// Move every tensor of a batch onto the bound device.
    pub fn sync_batch(&self, batch: Batch) -> Batch {
        batch.into_device(self.device)
    }

    /// Run the model forward under this engine's autocast policy.
    pub fn forward(&self, model: &mut dyn Model, input: &Tensor) -> Result<Tensor> {
        let input = input
            .clone()
            .to_device(self.device)
            .to_dtype(self.policy.activation_dtype);
        let output = model.forward(&input)?;
        Ok(output.to_dtype(self.policy.activation_dtype))
    }

    /// Backpropagate a scaled loss into the model's gradients.
    pub fn backward(&mut self, model: &mut dyn Model, loss: &Loss) -> Result<()> {
        self.stats.backward_calls += 1;
        let scaled = loss
            .grad
            .scale(self.scaler.scale())
            .to_dtype(self.policy.activation_dtype);
        model.backward(&scaled)
    }

    /// Unscale, check for overflow and step the optimizer.
    ///
    /// Returns `false` when the step was skipped because gradients overflowed.
    pub fn optimizer_step(
        &mut self,
        model: &mut dyn Model,
        optimizer: &mut dyn Optimizer,
    ) -> Result<bool> {
        let overflow = model
            .parameters()
            .iter()
            .filter_map(|p| p.grad.as_ref())
            .any(|g| !g.all_finite());

        let scale = self.scaler.scale();
        if !self.scaler.update(overflow) {
            self.stats.skipped_steps += 1;
            model.zero_grad();
            warn!(
                scale = self.scaler.scale(),
                "Gradient overflow, skipping optimizer step"
            );
            return Ok(false);
        }

        let inv_scale = 1.0 / scale;
        if let Some(masters) = self.master_weights.as_mut() {
            for (master, p) in masters.iter_mut().zip(model.parameters()) {
                master.grad = p.grad.as_ref().map(|g| g.scale(inv_scale).to_dtype(DType::F32));
            }
            let mut refs: Vec<&mut Parameter> = masters.iter_mut().collect();
            optimizer.step(&mut refs)?;
            for (master, p) in masters.iter().zip(model.parameters_mut()) {
                if p.trainable {
                    let dtype = p.value.dtype();
                    let device = p.value.device();
                    p.value = master.value.clone().to_dtype(dtype).to_device(device);
                }
            }
        } else {
            let mut params = model.parameters_mut();
            if inv_scale != 1.0 {
                for p in params.iter_mut() {
                    if let Some(g) = p.grad.as_mut() {
                        *g = g.scale(inv_scale);
                    }
                }
            }
            optimizer.step(&mut params)?;
        }
        self.stats.optimizer_steps += 1;
        Ok(true)
    }

    pub fn zero_grad(&mut self, model: &mut dyn Model) {
        model.zero_grad();
        if let Some(masters) = self.master_weights.as_mut() {
            for m in masters {
                m.grad = None;
            }
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState {
            precision: self.precision,
            scaler: self.scaler.clone(),
            master_weights: self.master_weights.as_ref().map(|masters| {
                masters
                    .iter()
                    .map(|m| (m.name.clone(), m.value.clone()))
                    .collect()
            }),
            stats: self.stats.clone(),
        }
    }

    /// Restore scaler and master weights after `model` has been loaded.
    ///
    /// Master weights missing from `state` are rebuilt from the model. Step counters
    /// stay cumulative for the run.
    pub fn load_state(&mut self, state: Option<&EngineState>, model: &dyn Model) -> Result<()> {
        if let Some(state) = state {
            if state.precision == self.precision {
                self.scaler = state.scaler.clone();
            } else {
                debug!(
                    saved = %state.precision,
                    current = %self.precision,
                    "Checkpoint precision differs from engine; keeping current scaler"
                );
            }
        }
        if !self.policy.master_weights {
            self.master_weights = None;
            return Ok(());
        }
        let mut masters = snapshot_master_weights(model);
        if let Some(saved) = state.and_then(|s| s.master_weights.as_ref()) {
            for m in &mut masters {
                let value = saved.get(&m.name).ok_or_else(|| {
                    RunnerError::state_not_found(format!("master weight '{}' missing", m.name))
                })?;
                m.value = value.clone();
            }
        }
        self.master_weights = Some(masters);
        Ok(())
    }
}

/// Whether `masters` are the FP32 copies behind `model`'s current weights: same
/// names and shapes, and each model weight is its master rounded to the weight dtype.
fn masters_track(masters: &[Parameter], model: &dyn Model) -> bool {
    let params = model.parameters();
    masters.len() == params.len()
        && masters.iter().zip(params).all(|(master, p)| {
            master.name == p.name
                && master.value.shape() == p.value.shape()
                && master
                    .value
                    .clone()
                    .to_dtype(p.value.dtype())
                    .to_device(p.value.device())
                    .bit_eq(&p.value)
        })
}

fn snapshot_master_weights(model: &dyn Model) -> Vec<Parameter> {
    model
        .parameters()
        .into_iter()
        .map(|p| {
            let mut master = p.clone();
            master.value = master.value.to_dtype(DType::F32);
            master.grad = None;
            master
        })
        .collect()
}
