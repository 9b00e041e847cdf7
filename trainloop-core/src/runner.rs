//! The experiment runner.
//!
//! [`Runner::run`] drives the nested loop
//!
//! ```text
//! ExperimentStart
//!   StageStart                        (per stage, declaration order)
//!     EpochStart                      (stage_len times)
//!       LoaderStart                   (per loader, declaration order)
//!         BatchStart .. BatchEnd      (per batch, loader order)
//!       LoaderEnd
//!     EpochEnd
//!   StageEnd
//! ExperimentEnd
//! ```
//!
//! dispatching callbacks at every transition. Run-level callbacks fire before
//! stage-level ones. Stop flags set by callbacks are checked only between units of
//! work: `stop_loader` ends the batch loop, `stop_stage` skips the remaining
//! loaders and epochs of the stage once the current loader is drained, and
//! `stop_run` lets the current epoch's loaders finish, then ends the stage and
//! skips all later stages.

use crate::callbacks::{CallbackList, Hook};
use crate::data::{Batch, Loader, LoaderSet};
use crate::device::{Device, DeviceCapabilities};
use crate::engine::Engine;
use crate::error::{Result, RunnerError};
use crate::loggers::{LogScope, LoggerSet};
use crate::metrics::{MeterSet, MetricHistory, Metrics, RunSummary, StageSummary};
use crate::nn::{Criterion, Model};
use crate::optim::{Optimizer, Scheduler};
use crate::state::{Phase, RunContext, RunState, Trial};
use futures::StreamExt;
use std::time::Instant;
use tracing::{Instrument, debug, info, info_span};

/// User-supplied description of what to run.
///
/// `stages`, `stage_len`, `loaders`, `model` and `handle_batch` are required; every
/// other component is optional.
pub trait Experiment: Send {
    /// Stage names, in execution order.
    fn stages(&self) -> Vec<String>;

    /// Number of epochs for `stage`.
    fn stage_len(&self, stage: &str) -> usize;

    /// Resolved once per run, before anything else. Defaults to full precision on CPU.
    fn engine(&mut self, capabilities: &DeviceCapabilities) -> Result<Engine> {
        Engine::device_engine(Device::Cpu, capabilities)
    }

    fn trial(&mut self) -> Option<Trial> {
        None
    }

    fn loggers(&mut self) -> Result<LoggerSet> {
        Ok(LoggerSet::new())
    }

    /// Callbacks that live for the whole run.
    fn run_callbacks(&mut self) -> Result<CallbackList> {
        Ok(CallbackList::new())
    }

    fn loaders(&mut self, stage: &str) -> Result<LoaderSet>;

    /// The stage model. `current` is the previous stage's model, if any.
    fn model(&mut self, stage: &str, current: Option<Box<dyn Model>>) -> Result<Box<dyn Model>>;

    fn criterion(&mut self, _stage: &str) -> Result<Option<Box<dyn Criterion>>> {
        Ok(None)
    }

    fn optimizer(&mut self, _stage: &str, _model: &dyn Model) -> Result<Option<Box<dyn Optimizer>>> {
        Ok(None)
    }

    fn scheduler(
        &mut self,
        _stage: &str,
        _optimizer: &dyn Optimizer,
    ) -> Result<Option<Box<dyn Scheduler>>> {
        Ok(None)
    }

    /// Callbacks that live for one stage.
    fn callbacks(&mut self, _stage: &str) -> Result<CallbackList> {
        Ok(CallbackList::new())
    }

    /// Compute outputs for `ctx.state.batch` and write them back into it.
    fn handle_batch(&mut self, ctx: &mut RunContext) -> Result<()>;
}

/// Drives an [`Experiment`].
pub struct Runner<E: Experiment> {
    experiment: E,
    capabilities: DeviceCapabilities,
    ctx: RunContext,
    run_callbacks: CallbackList,
    stage_callbacks: CallbackList,
    loggers: LoggerSet,
    meters: MeterSet,
    history: MetricHistory,
    stages: Vec<StageSummary>,
}

impl<E: Experiment> Runner<E> {
    pub fn new(experiment: E, capabilities: DeviceCapabilities) -> Self {
        Self {
            experiment,
            capabilities,
            ctx: RunContext::default(),
            run_callbacks: CallbackList::new(),
            stage_callbacks: CallbackList::new(),
            loggers: LoggerSet::new(),
            meters: MeterSet::default(),
            history: MetricHistory::default(),
            stages: Vec::new(),
        }
    }

    pub fn experiment(&self) -> &E {
        &self.experiment
    }

    pub fn into_experiment(self) -> E {
        self.experiment
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RunContext {
        &mut self.ctx
    }

    pub fn resolve_model(&mut self, stage: &str) -> Result<()> {
        let current = self.ctx.components.model.take();
        let model = self.experiment.model(stage, current)?;
        self.ctx.components.model = Some(model);
        Ok(())
    }

    pub fn resolve_criterion(&mut self, stage: &str) -> Result<()> {
        self.ctx.components.criterion = self.experiment.criterion(stage)?;
        Ok(())
    }

    /// Requires the stage model to be resolved first.
    pub fn resolve_optimizer(&mut self, stage: &str) -> Result<()> {
        let model = self.ctx.components.model.as_deref().ok_or_else(|| {
            RunnerError::configuration(format!(
                "optimizer for stage '{stage}' requested before its model was resolved"
            ))
        })?;
        self.ctx.components.optimizer = self.experiment.optimizer(stage, model)?;
        Ok(())
    }

    /// Requires the stage optimizer to be resolved first.
    pub fn resolve_scheduler(&mut self, stage: &str) -> Result<()> {
        let optimizer = self.ctx.components.optimizer.as_deref().ok_or_else(|| {
            RunnerError::configuration(format!(
                "scheduler for stage '{stage}' requested before its optimizer was resolved"
            ))
        })?;
        self.ctx.components.scheduler = self.experiment.scheduler(stage, optimizer)?;
        Ok(())
    }

    /// Execute every stage and return what happened.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        self.ctx = RunContext::new(RunState::new(uuid::Uuid::new_v4().to_string()));
        self.history = MetricHistory::default();
        self.stages.clear();

        let run_id = self.ctx.state.run_id.clone();
        let result = self
            .run_experiment()
            .instrument(info_span!("run", run_id = %run_id))
            .await;
        self.loggers.flush();
        self.ctx.state.phase = Phase::Idle;
        result?;

        let summary = RunSummary {
            run_id,
            stages: self.stages.clone(),
            history: self.history.clone(),
            engine: self
                .ctx
                .engine
                .as_ref()
                .map(|e| e.stats().clone())
                .unwrap_or_default(),
            global_batch_step: self.ctx.state.global_batch_step,
            stopped_early: self.ctx.state.stop.stop_run || self.stages.iter().any(|s| s.stopped_early),
            total_time_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            stages = summary.stages.len(),
            batches = summary.global_batch_step,
            secs = summary.total_time_secs,
            "Run finished"
        );
        Ok(summary)
    }

    async fn run_experiment(&mut self) -> Result<()> {
        self.ctx.state.phase = Phase::ExperimentStart;
        // Engine first: an unavailable device must fail before anything is created.
        let engine = self.experiment.engine(&self.capabilities)?;
        info!(
            engine = engine.name(),
            device = %engine.device(),
            precision = %engine.precision(),
            "Engine resolved"
        );
        self.ctx.engine = Some(engine);
        self.ctx.state.trial = self.experiment.trial();
        self.loggers = self.experiment.loggers()?;
        self.run_callbacks = self.experiment.run_callbacks()?;
        self.run_callbacks.validate()?;
        self.stage_callbacks = CallbackList::new();

        let stages = self.experiment.stages();
        if stages.is_empty() {
            return Err(RunnerError::configuration("experiment declares no stages"));
        }
        self.dispatch(Hook::ExperimentStart)?;

        for (index, stage) in stages.iter().enumerate() {
            self.run_stage(index, stage)
                .instrument(info_span!("stage", stage = %stage))
                .await?;
            if self.ctx.state.stop.stop_run {
                if index + 1 < stages.len() {
                    info!(skipped = stages.len() - index - 1, "Run stop requested, skipping remaining stages");
                }
                break;
            }
        }

        self.ctx.state.phase = Phase::ExperimentEnd;
        self.dispatch(Hook::ExperimentEnd)
    }

    async fn run_stage(&mut self, index: usize, stage: &str) -> Result<()> {
        let stage_len = self.experiment.stage_len(stage);
        if stage_len == 0 {
            return Err(RunnerError::configuration(format!(
                "stage '{stage}' has length 0"
            )));
        }
        {
            let state = &mut self.ctx.state;
            state.phase = Phase::StageStart;
            state.stage_key = stage.to_string();
            state.stage_index = index;
            state.stage_len = stage_len;
            state.epoch = 0;
            state.stage_best = None;
            state.is_best = false;
            state.stop.stop_stage = false;
            state.stop.stop_loader = false;
        }

        self.resolve_model(stage)?;
        self.resolve_criterion(stage)?;
        self.resolve_optimizer(stage)?;
        if self.ctx.components.optimizer.is_some() {
            self.resolve_scheduler(stage)?;
        }
        let loaders = self.experiment.loaders(stage)?;
        if loaders.is_empty() {
            return Err(RunnerError::configuration(format!(
                "stage '{stage}' has no loaders"
            )));
        }
        self.stage_callbacks = self.experiment.callbacks(stage)?;
        self.stage_callbacks.validate()?;
        let ctx = &mut self.ctx;
        ctx.engine
            .as_mut()
            .ok_or_else(|| RunnerError::configuration("engine not resolved"))?
            .prepare(&mut ctx.components)?;

        self.dispatch(Hook::StageStart)?;
        info!(
            epochs = stage_len,
            loaders = ?loaders.keys(),
            callbacks = ?self.stage_callbacks.names(),
            "Stage started"
        );

        let mut epochs_completed = 0;
        for epoch in 1..=stage_len {
            self.run_epoch(epoch, &loaders).await?;
            epochs_completed = epoch;
            let stop = self.ctx.state.stop;
            if stop.stop_stage || stop.stop_run {
                debug!(epoch, ?stop, "Stage stopping early");
                break;
            }
        }

        self.ctx.state.phase = Phase::StageEnd;
        self.dispatch(Hook::StageEnd)?;

        let best = self.ctx.state.stage_best.clone();
        if let Some(best) = &best {
            let metrics = Metrics::from([(best.metric_key.clone(), best.value)]);
            self.loggers
                .log_metrics(LogScope::Stage, &metrics, &self.ctx.state);
        }
        info!(epochs_completed, stage_len, "Stage finished");
        self.stages.push(StageSummary {
            name: stage.to_string(),
            epochs_completed,
            stopped_early: epochs_completed < stage_len,
            best,
        });

        // The model carries over to the next stage; everything else is per stage.
        self.stage_callbacks = CallbackList::new();
        self.ctx.components.criterion = None;
        self.ctx.components.optimizer = None;
        self.ctx.components.scheduler = None;
        Ok(())
    }

    async fn run_epoch(&mut self, epoch: usize, loaders: &LoaderSet) -> Result<()> {
        {
            let state = &mut self.ctx.state;
            state.phase = Phase::EpochStart;
            state.epoch = epoch;
            state.global_epoch_step += 1;
            state.epoch_metrics.clear();
        }
        self.dispatch(Hook::EpochStart)?;

        for (key, loader) in loaders.iter() {
            self.run_loader(key, loader)
                .instrument(info_span!("loader", loader = %key, epoch))
                .await?;
            if self.ctx.state.stop.stop_stage {
                break;
            }
        }

        self.ctx.state.phase = Phase::EpochEnd;
        self.dispatch(Hook::EpochEnd)?;

        let epoch_metrics = self.ctx.state.epoch_metrics.clone();
        let flat: Metrics = epoch_metrics
            .iter()
            .flat_map(|(loader, m)| m.iter().map(move |(k, v)| (format!("{loader}/{k}"), *v)))
            .collect();
        self.history
            .record_epoch(&self.ctx.state.stage_key, epoch, epoch_metrics);
        self.loggers.log_metrics(LogScope::Epoch, &flat, &self.ctx.state);
        Ok(())
    }

    async fn run_loader(&mut self, key: &str, loader: &dyn Loader) -> Result<()> {
        let is_train = RunState::is_train(key);
        {
            let state = &mut self.ctx.state;
            state.phase = Phase::LoaderStart;
            state.loader_key = key.to_string();
            state.is_train_loader = is_train;
            state.loader_len = loader.len();
            state.loader_batch_step = 0;
            state.loader_metrics.clear();
            state.stop.stop_loader = false;
        }
        self.ctx.components.model_mut()?.set_training(is_train);
        self.meters.reset();
        self.dispatch(Hook::LoaderStart)?;

        let mut batches = loader.batches();
        while let Some(next) = batches.next().await {
            let batch = next?;
            self.run_batch(batch)?;
            if self.ctx.state.stop.stop_loader {
                debug!(
                    batch = self.ctx.state.loader_batch_step,
                    "Loader stop requested"
                );
                break;
            }
        }
        drop(batches);

        self.ctx.state.phase = Phase::LoaderEnd;
        self.ctx.state.loader_metrics = self.meters.compute();
        self.ctx.state.reset_batch();
        self.dispatch(Hook::LoaderEnd)?;

        let metrics = self.ctx.state.loader_metrics.clone();
        self.ctx
            .state
            .epoch_metrics
            .insert(key.to_string(), metrics.clone());
        self.loggers
            .log_metrics(LogScope::Loader, &metrics, &self.ctx.state);
        Ok(())
    }

    fn run_batch(&mut self, batch: Batch) -> Result<()> {
        let batch = self.ctx.engine()?.sync_batch(batch);
        {
            let state = &mut self.ctx.state;
            state.reset_batch();
            state.phase = Phase::BatchIter;
            state.loader_batch_step += 1;
            state.batch_size = batch.batch_size();
            state.batch = batch.into_inner();
        }
        self.dispatch(Hook::BatchStart)?;

        self.experiment.handle_batch(&mut self.ctx)?;
        let state = &mut self.ctx.state;
        state.global_batch_step += 1;
        state.global_sample_step += state.batch_size as u64;

        self.dispatch(Hook::BatchEnd)?;

        let state = &self.ctx.state;
        self.meters.update(&state.batch_metrics, state.batch_size);
        self.loggers
            .log_metrics(LogScope::Batch, &state.batch_metrics, state);
        Ok(())
    }

    fn dispatch(&mut self, hook: Hook) -> Result<()> {
        self.run_callbacks.dispatch(hook, &mut self.ctx)?;
        self.stage_callbacks.dispatch(hook, &mut self.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TensorLoader;
    use crate::nn::Linear;
    use crate::optim::Sgd;
    use crate::tensor::Tensor;

    struct Minimal;

    impl Experiment for Minimal {
        fn stages(&self) -> Vec<String> {
            vec!["train".into()]
        }

        fn stage_len(&self, _: &str) -> usize {
            1
        }

        fn loaders(&mut self, _: &str) -> Result<LoaderSet> {
            let x = Tensor::from_vec(vec![2, 1], vec![1.0, 2.0])?;
            LoaderSet::new().with("train", TensorLoader::new(x.clone(), x, 1)?)
        }

        fn model(&mut self, _: &str, _: Option<Box<dyn Model>>) -> Result<Box<dyn Model>> {
            Ok(Box::new(Linear::new(1, 1, 0)))
        }

        fn optimizer(&mut self, _: &str, _: &dyn Model) -> Result<Option<Box<dyn Optimizer>>> {
            Ok(Some(Box::new(Sgd::new(0.1, 0.0))))
        }

        fn handle_batch(&mut self, ctx: &mut RunContext) -> Result<()> {
            let x = ctx.state.batch_tensor("features")?.clone();
            let y = ctx.forward(&x)?;
            ctx.state.batch.insert("logits".into(), y);
            Ok(())
        }
    }

    #[test]
    fn test_optimizer_before_model_is_configuration_error() {
        let mut runner = Runner::new(Minimal, DeviceCapabilities::cpu_only());
        let err = runner.resolve_optimizer("train").unwrap_err();
        assert!(matches!(err, RunnerError::Configuration(_)));
        let err = runner.resolve_scheduler("train").unwrap_err();
        assert!(matches!(err, RunnerError::Configuration(_)));

        runner.resolve_model("train").unwrap();
        runner.resolve_optimizer("train").unwrap();
        assert!(runner.context().components.optimizer.is_some());
    }

    #[tokio::test]
    async fn test_minimal_run_counts_steps() {
        let mut runner = Runner::new(Minimal, DeviceCapabilities::cpu_only());
        let summary = runner.run().await.unwrap();
        assert_eq!(summary.global_batch_step, 2);
        assert_eq!(summary.stages[0].epochs_completed, 1);
        assert!(!summary.stopped_early);
        assert_eq!(runner.context().state.phase, Phase::Idle);
    }
}
