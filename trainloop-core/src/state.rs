//! Run state shared with callbacks, and the context the runner hands them.

use crate::data::TRAIN_LOADER;
use crate::engine::Engine;
use crate::error::{Result, RunnerError};
use crate::metrics::Metrics;
use crate::nn::{Criterion, Loss, Model};
use crate::optim::{Optimizer, Scheduler};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where the runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    ExperimentStart,
    StageStart,
    EpochStart,
    LoaderStart,
    BatchIter,
    LoaderEnd,
    EpochEnd,
    StageEnd,
    ExperimentEnd,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cooperative termination requests, checked between units of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopFlags {
    /// Finish the current batch, then end the loader.
    pub stop_loader: bool,
    /// Finish the current loader, then end the stage.
    pub stop_stage: bool,
    /// Finish the current epoch's loaders, then end the run.
    pub stop_run: bool,
}

/// Best metric value seen in a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    pub stage: String,
    pub epoch: usize,
    pub loader_key: String,
    pub metric_key: String,
    pub value: f64,
}

/// Hyperparameter trial the run belongs to, if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Mutable record of the current run position and data.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub run_id: String,
    pub phase: Phase,
    pub trial: Option<Trial>,

    pub stage_key: String,
    pub stage_index: usize,
    pub stage_len: usize,
    /// 1-based epoch within the current stage.
    pub epoch: usize,

    pub loader_key: String,
    pub is_train_loader: bool,
    pub loader_len: Option<usize>,
    /// 1-based batch index within the current loader pass.
    pub loader_batch_step: usize,

    pub global_epoch_step: u64,
    pub global_batch_step: u64,
    pub global_sample_step: u64,

    /// Tensors of the current batch, plus whatever the batch handler writes.
    pub batch: BTreeMap<String, Tensor>,
    pub batch_size: usize,
    pub batch_metrics: Metrics,
    pub batch_losses: BTreeMap<String, Loss>,

    pub loader_metrics: Metrics,
    /// Loader metrics of the current epoch, keyed by loader.
    pub epoch_metrics: BTreeMap<String, Metrics>,

    pub stage_best: Option<BestRecord>,
    /// Whether the last loader end produced a new stage best.
    pub is_best: bool,

    pub stop: StopFlags,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn is_first_stage(&self) -> bool {
        self.stage_index == 0
    }

    pub fn is_train(loader_key: &str) -> bool {
        loader_key == TRAIN_LOADER
    }

    pub fn request_stop_loader(&mut self) {
        self.stop.stop_loader = true;
    }

    pub fn request_stop_stage(&mut self) {
        self.stop.stop_stage = true;
    }

    pub fn request_stop_run(&mut self) {
        self.stop.stop_run = true;
    }

    /// Read a tensor the batch handler or loader put into the batch.
    pub fn batch_tensor(&self, key: &str) -> Result<&Tensor> {
        self.batch.get(key).ok_or_else(|| {
            RunnerError::data(format!(
                "batch key '{key}' not populated in loader '{}'",
                self.loader_key
            ))
        })
    }

    /// A loader-level metric, falling back to the epoch record of another loader.
    pub fn metric(&self, loader_key: &str, metric_key: &str) -> Option<f64> {
        if self.loader_key == loader_key {
            if let Some(v) = self.loader_metrics.get(metric_key) {
                return Some(*v);
            }
        }
        self.epoch_metrics
            .get(loader_key)
            .and_then(|m| m.get(metric_key))
            .copied()
    }

    pub(crate) fn reset_batch(&mut self) {
        self.batch.clear();
        self.batch_size = 0;
        self.batch_metrics.clear();
        self.batch_losses.clear();
    }
}

/// Model, criterion, optimizer and scheduler of the current stage.
#[derive(Default)]
pub struct StageComponents {
    pub model: Option<Box<dyn Model>>,
    pub criterion: Option<Box<dyn Criterion>>,
    pub optimizer: Option<Box<dyn Optimizer>>,
    pub scheduler: Option<Box<dyn Scheduler>>,
}

impl StageComponents {
    pub fn model(&self) -> Result<&dyn Model> {
        self.model
            .as_deref()
            .ok_or_else(|| RunnerError::configuration("no model resolved for this stage"))
    }

    pub fn model_mut(&mut self) -> Result<&mut (dyn Model + 'static)> {
        self.model
            .as_deref_mut()
            .ok_or_else(|| RunnerError::configuration("no model resolved for this stage"))
    }

    pub fn criterion(&self) -> Result<&dyn Criterion> {
        self.criterion
            .as_deref()
            .ok_or_else(|| RunnerError::configuration("no criterion resolved for this stage"))
    }

    pub fn optimizer_mut(&mut self) -> Result<&mut (dyn Optimizer + 'static)> {
        self.optimizer
            .as_deref_mut()
            .ok_or_else(|| RunnerError::configuration("no optimizer resolved for this stage"))
    }

    /// Model and optimizer together, for the update step.
    pub fn model_and_optimizer(
        &mut self,
    ) -> Result<(&mut (dyn Model + 'static), &mut (dyn Optimizer + 'static))> {
        let model = self
            .model
            .as_deref_mut()
            .ok_or_else(|| RunnerError::configuration("no model resolved for this stage"))?;
        let optimizer = self
            .optimizer
            .as_deref_mut()
            .ok_or_else(|| RunnerError::configuration("no optimizer resolved for this stage"))?;
        Ok((model, optimizer))
    }

    /// Optimizer and scheduler together, for a learning-rate step.
    pub fn optimizer_and_scheduler(
        &mut self,
    ) -> Option<(&mut (dyn Optimizer + 'static), &mut (dyn Scheduler + 'static))> {
        match (self.optimizer.as_deref_mut(), self.scheduler.as_deref_mut()) {
            (Some(o), Some(s)) => Some((o, s)),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Debug for StageComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageComponents")
            .field("model", &self.model.as_ref().map(|m| m.name().to_string()))
            .field("criterion", &self.criterion.as_ref().map(|c| c.name().to_string()))
            .field("optimizer", &self.optimizer.as_ref().map(|o| o.name().to_string()))
            .field("scheduler", &self.scheduler.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

/// Everything a callback or batch handler may touch during its invocation.
#[derive(Debug, Default)]
pub struct RunContext {
    pub state: RunState,
    pub engine: Option<Engine>,
    pub components: StageComponents,
}

impl RunContext {
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            engine: None,
            components: StageComponents::default(),
        }
    }

    pub fn engine(&self) -> Result<&Engine> {
        self.engine
            .as_ref()
            .ok_or_else(|| RunnerError::configuration("engine not resolved"))
    }

    pub fn engine_mut(&mut self) -> Result<&mut Engine> {
        self.engine
            .as_mut()
            .ok_or_else(|| RunnerError::configuration("engine not resolved"))
    }

    /// Run the stage model on `input` through the engine's autocast policy.
    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| RunnerError::configuration("engine not resolved"))?;
        let model = self.components.model_mut()?;
        engine.forward(model, input)
    }

    /// Backpropagate the loss stored under `loss_key` by a criterion callback.
    pub fn backward(&mut self, loss_key: &str) -> Result<()> {
        let loss = self.state.batch_losses.get(loss_key).ok_or_else(|| {
            RunnerError::configuration(format!(
                "loss '{loss_key}' not computed before backward; register its criterion callback earlier"
            ))
        })?;
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| RunnerError::configuration("engine not resolved"))?;
        let model = self.components.model_mut()?;
        engine.backward(model, loss)
    }

    /// Precision-correct optimizer step. Returns `false` if the engine skipped it.
    pub fn optimizer_step(&mut self) -> Result<bool> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| RunnerError::configuration("engine not resolved"))?;
        let (model, optimizer) = self.components.model_and_optimizer()?;
        engine.optimizer_step(model, optimizer)
    }

    pub fn zero_grad(&mut self) -> Result<()> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| RunnerError::configuration("engine not resolved"))?;
        let model = self.components.model_mut()?;
        engine.zero_grad(model);
        Ok(())
    }
}
