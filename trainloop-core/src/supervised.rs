//! Config-driven supervised experiment.

use crate::callbacks::CallbackList;
use crate::config::{NamedSpec, RunnerConfig, StageConfig};
use crate::data::LoaderSet;
use crate::device::DeviceCapabilities;
use crate::engine::Engine;
use crate::error::{Result, RunnerError};
use crate::loggers::{ConsoleLogger, CsvLogger, LoggerSet};
use crate::nn::{Criterion, Model};
use crate::optim::{Optimizer, Scheduler};
use crate::registry::{BuildContext, Registries};
use crate::runner::Experiment;
use crate::state::{RunContext, Trial};

type LoaderProvider = Box<dyn FnMut(&str) -> Result<LoaderSet> + Send>;

/// Runs the stages of a [`RunnerConfig`], resolving every component through
/// [`Registries`]. The batch handler feeds `input_key` through the stage model and
/// stores the prediction under `output_key`.
pub struct SupervisedExperiment {
    config: RunnerConfig,
    registries: Registries,
    loaders: LoaderProvider,
    capabilities: DeviceCapabilities,
    trial: Option<Trial>,
    input_key: String,
    output_key: String,
}

impl SupervisedExperiment {
    /// `loaders` is called at every stage start with the stage name.
    pub fn new<F>(config: RunnerConfig, loaders: F) -> Result<Self>
    where
        F: FnMut(&str) -> Result<LoaderSet> + Send + 'static,
    {
        config.validate()?;
        if let Some(stage) = config
            .stages
            .iter()
            .find(|s| s.scheduler.is_some() && s.optimizer.is_none())
        {
            return Err(RunnerError::configuration(format!(
                "stage '{}' declares a scheduler without an optimizer",
                stage.name
            )));
        }
        Ok(Self {
            config,
            registries: Registries::builtin()?,
            loaders: Box::new(loaders),
            capabilities: DeviceCapabilities::cpu_only(),
            trial: None,
            input_key: "features".to_string(),
            output_key: "logits".to_string(),
        })
    }

    /// Replace the built-in registries, e.g. to add custom components.
    pub fn with_registries(mut self, registries: Registries) -> Self {
        self.registries = registries;
        self
    }

    pub fn with_keys(mut self, input_key: impl Into<String>, output_key: impl Into<String>) -> Self {
        self.input_key = input_key.into();
        self.output_key = output_key.into();
        self
    }

    pub fn with_trial(mut self, trial: Trial) -> Self {
        self.trial = Some(trial);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn stage_config(&self, stage: &str) -> Result<&StageConfig> {
        self.config
            .stage(stage)
            .ok_or_else(|| RunnerError::configuration(format!("unknown stage '{stage}'")))
    }

    fn build_context(&self, base_lr: Option<f64>) -> BuildContext<'_> {
        BuildContext {
            logdir: &self.config.logdir,
            capabilities: &self.capabilities,
            seed: self.config.seed,
            base_lr,
        }
    }

    fn build_callbacks(&self, specs: &[NamedSpec]) -> Result<CallbackList> {
        let ctx = self.build_context(None);
        let mut list = CallbackList::new();
        for named in specs {
            let callback = self.registries.callbacks.build(&named.spec, &ctx)?;
            list.add_boxed(named.name.clone(), callback)?;
        }
        Ok(list)
    }
}

impl Experiment for SupervisedExperiment {
    fn stages(&self) -> Vec<String> {
        self.config.stages.iter().map(|s| s.name.clone()).collect()
    }

    fn stage_len(&self, stage: &str) -> usize {
        self.config.stage(stage).map(|s| s.num_epochs).unwrap_or(0)
    }

    fn engine(&mut self, capabilities: &DeviceCapabilities) -> Result<Engine> {
        self.capabilities = *capabilities;
        self.registries
            .engines
            .build(&self.config.engine, &self.build_context(None))
    }

    fn trial(&mut self) -> Option<Trial> {
        self.trial.clone()
    }

    fn loggers(&mut self) -> Result<LoggerSet> {
        let mut loggers = LoggerSet::new();
        if self.config.loggers.console {
            loggers.add(ConsoleLogger {
                log_batch: self.config.loggers.log_batch,
            });
        }
        if self.config.loggers.csv {
            loggers.add(CsvLogger::new(&self.config.logdir));
        }
        Ok(loggers)
    }

    fn run_callbacks(&mut self) -> Result<CallbackList> {
        self.build_callbacks(&self.config.callbacks)
    }

    fn loaders(&mut self, stage: &str) -> Result<LoaderSet> {
        (self.loaders)(stage)
    }

    fn model(&mut self, stage: &str, current: Option<Box<dyn Model>>) -> Result<Box<dyn Model>> {
        match &self.stage_config(stage)?.model {
            Some(spec) => self.registries.models.build(spec, &self.build_context(None)),
            None => current.ok_or_else(|| {
                RunnerError::configuration(format!(
                    "stage '{stage}' declares no model and there is none to carry over"
                ))
            }),
        }
    }

    fn criterion(&mut self, stage: &str) -> Result<Option<Box<dyn Criterion>>> {
        self.stage_config(stage)?
            .criterion
            .as_ref()
            .map(|spec| self.registries.criteria.build(spec, &self.build_context(None)))
            .transpose()
    }

    fn optimizer(&mut self, stage: &str, _model: &dyn Model) -> Result<Option<Box<dyn Optimizer>>> {
        self.stage_config(stage)?
            .optimizer
            .as_ref()
            .map(|spec| self.registries.optimizers.build(spec, &self.build_context(None)))
            .transpose()
    }

    fn scheduler(
        &mut self,
        stage: &str,
        optimizer: &dyn Optimizer,
    ) -> Result<Option<Box<dyn Scheduler>>> {
        let ctx = self.build_context(Some(optimizer.lr()));
        self.stage_config(stage)?
            .scheduler
            .as_ref()
            .map(|spec| self.registries.schedulers.build(spec, &ctx))
            .transpose()
    }

    fn callbacks(&mut self, stage: &str) -> Result<CallbackList> {
        let specs = &self.stage_config(stage)?.callbacks;
        self.build_callbacks(specs)
    }

    fn handle_batch(&mut self, ctx: &mut RunContext) -> Result<()> {
        let input = ctx.state.batch_tensor(&self.input_key)?.clone();
        let output = ctx.forward(&input)?;
        ctx.state.batch.insert(self.output_key.clone(), output);
        Ok(())
    }
}

impl std::fmt::Debug for SupervisedExperiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedExperiment")
            .field("stages", &self.stages())
            .field("input_key", &self.input_key)
            .field("output_key", &self.output_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CHECKPOINT_DIR, MANIFEST_FILE};
    use crate::config::StageConfig;
    use crate::data::TensorLoader;
    use crate::registry::ComponentSpec;
    use crate::runner::Runner;
    use crate::tensor::Tensor;
    use tempfile::TempDir;

    fn line(n: usize) -> Result<TensorLoader> {
        let x: Vec<f32> = (0..n).map(|i| i as f32 / n as f32).collect();
        let y: Vec<f32> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        TensorLoader::new(
            Tensor::from_vec(vec![n, 1], x)?,
            Tensor::from_vec(vec![n, 1], y)?,
            4,
        )
    }

    fn loaders(_: &str) -> Result<LoaderSet> {
        LoaderSet::new().with("train", line(8)?)?.with("valid", line(4)?)
    }

    fn two_stage_config(logdir: &std::path::Path) -> RunnerConfig {
        let mut config = RunnerConfig {
            logdir: logdir.to_path_buf(),
            ..RunnerConfig::default()
        };
        config.stages[0].name = "pretrain".into();
        config.stages[0].num_epochs = 2;
        config.stages.push(StageConfig {
            name: "finetune".into(),
            num_epochs: 1,
            model: None,
            criterion: Some(ComponentSpec::new("MseLoss")),
            optimizer: Some(ComponentSpec::new("Adam").param("lr", 0.001)),
            scheduler: Some(ComponentSpec::new("StepLr").param("step_size", 1)),
            callbacks: config.stages[0].callbacks.clone(),
        });
        config.callbacks.push(NamedSpec::new(
            "checkpoint",
            ComponentSpec::new("CheckpointCallback").param("save_n_best", 2),
        ));
        config
    }

    #[tokio::test]
    async fn test_config_experiment_runs_all_stages() {
        let dir = TempDir::new().unwrap();
        let experiment = SupervisedExperiment::new(two_stage_config(dir.path()), loaders).unwrap();
        let mut runner = Runner::new(experiment, DeviceCapabilities::cpu_only());
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.stages.len(), 2);
        // 3 epochs of 2 train + 1 valid batches
        assert_eq!(summary.global_batch_step, 9);
        assert_eq!(summary.history.epochs_in_stage("pretrain"), 2);
        assert!(summary.stage("finetune").unwrap().best.is_some());

        assert!(dir.path().join("logs").join("train.csv").exists());
        assert!(dir.path().join("logs").join("valid.csv").exists());
        assert!(dir.path().join(CHECKPOINT_DIR).join(MANIFEST_FILE).exists());
    }

    #[test]
    fn test_scheduler_without_optimizer_rejected() {
        let mut config = RunnerConfig::default();
        config.stages[0].optimizer = None;
        config.stages[0].scheduler = Some(ComponentSpec::new("StepLr").param("step_size", 1));
        let err = SupervisedExperiment::new(config, loaders).unwrap_err();
        assert!(matches!(err, RunnerError::Configuration(_)));
    }

    #[test]
    fn test_stage_without_model_reuses_current() {
        let dir = TempDir::new().unwrap();
        let mut experiment =
            SupervisedExperiment::new(two_stage_config(dir.path()), loaders).unwrap();
        assert!(experiment.model("finetune", None).is_err());
        let model = experiment.model("pretrain", None).unwrap();
        let carried = experiment.model("finetune", Some(model)).unwrap();
        assert_eq!(carried.name(), "Linear");
    }
}
