use super::Callback;
use crate::checkpoint::{
    Checkpoint, CheckpointManager, CheckpointMetadata, CheckpointPayload, LoadTarget,
};
use crate::engine::Engine;
use crate::error::{Result, RunnerError};
use crate::state::{BestRecord, RunContext};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

fn default_loader_key() -> String {
    "valid".to_string()
}

fn default_metric_key() -> String {
    "loss".to_string()
}

fn default_true() -> bool {
    true
}

fn default_save_n_best() -> usize {
    1
}

/// Settings for [`CheckpointCallback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub logdir: PathBuf,
    #[serde(default = "default_loader_key")]
    pub loader_key: String,
    #[serde(default = "default_metric_key")]
    pub metric_key: String,
    #[serde(default = "default_true")]
    pub minimize: bool,
    #[serde(default = "default_save_n_best")]
    pub save_n_best: usize,
    #[serde(default)]
    pub load_on_stage_start: Option<LoadTarget>,
    #[serde(default)]
    pub load_on_stage_end: Option<LoadTarget>,
    #[serde(default)]
    pub save_last: bool,
}

impl CheckpointConfig {
    pub fn new(logdir: impl Into<PathBuf>) -> Self {
        Self {
            logdir: logdir.into(),
            loader_key: default_loader_key(),
            metric_key: default_metric_key(),
            minimize: true,
            save_n_best: default_save_n_best(),
            load_on_stage_start: None,
            load_on_stage_end: None,
            save_last: false,
        }
    }
}

/// Saves ranked checkpoints at the end of one loader and restores them at stage
/// boundaries.
///
/// Also tracks the stage's best value, published as `RunState::stage_best` and
/// `RunState::is_best`.
#[derive(Debug, Clone)]
pub struct CheckpointCallback {
    config: CheckpointConfig,
    store: CheckpointManager,
}

impl CheckpointCallback {
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        let store = CheckpointManager::new(&config.logdir, config.save_n_best, config.minimize)?;
        Ok(Self { config, store })
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointManager {
        &self.store
    }

    fn restore(&self, ctx: &mut RunContext, target: LoadTarget) -> Result<()> {
        let checkpoint = self.store.load(target)?;
        apply_checkpoint(ctx, &checkpoint)?;
        info!(
            stage = %ctx.state.stage_key,
            %target,
            from_stage = %checkpoint.metadata.stage,
            from_epoch = checkpoint.metadata.epoch,
            value = checkpoint.metadata.metric_value,
            "Restored checkpoint"
        );
        Ok(())
    }

    fn nothing_saved_yet(&self, target: LoadTarget) -> bool {
        match target {
            LoadTarget::Last => !self.store.dir().join(crate::checkpoint::LAST_FILE).exists(),
            _ => !self.store.has_manifest(),
        }
    }
}

/// Capture the current component state.
pub(crate) fn capture_payload(ctx: &RunContext) -> Result<CheckpointPayload> {
    Ok(CheckpointPayload {
        model: ctx.components.model()?.state_dict(),
        optimizer: ctx.components.optimizer.as_ref().map(|o| o.state_dict()),
        scheduler: ctx.components.scheduler.as_ref().map(|s| s.state_dict()),
        engine: ctx.engine.as_ref().map(Engine::state),
    })
}

/// Load `checkpoint` into the stage components and engine.
pub(crate) fn apply_checkpoint(ctx: &mut RunContext, checkpoint: &Checkpoint) -> Result<()> {
    let payload = &checkpoint.payload;
    ctx.components.model_mut()?.load_state_dict(&payload.model)?;
    if let (Some(state), Some(optimizer)) =
        (&payload.optimizer, ctx.components.optimizer.as_deref_mut())
    {
        optimizer.load_state_dict(state)?;
    }
    if let (Some(state), Some(scheduler)) =
        (&payload.scheduler, ctx.components.scheduler.as_deref_mut())
    {
        scheduler.load_state_dict(state)?;
    }
    if let Some(engine) = ctx.engine.as_mut() {
        let model = ctx.components.model()?;
        engine.load_state(payload.engine.as_ref(), model)?;
    }
    Ok(())
}

impl Callback for CheckpointCallback {
    fn on_stage_start(&mut self, ctx: &mut RunContext) -> Result<()> {
        let Some(target) = self.config.load_on_stage_start else {
            return Ok(());
        };
        if ctx.state.is_first_stage() && self.nothing_saved_yet(target) {
            debug!(%target, "No checkpoints yet, nothing to restore at first stage");
            return Ok(());
        }
        self.restore(ctx, target)
    }

    fn on_loader_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        if ctx.state.loader_key != self.config.loader_key || ctx.state.loader_metrics.is_empty() {
            return Ok(());
        }
        let value = *ctx
            .state
            .loader_metrics
            .get(&self.config.metric_key)
            .ok_or_else(|| {
                RunnerError::configuration(format!(
                    "loader '{}' produced no '{}' metric to checkpoint on",
                    self.config.loader_key, self.config.metric_key
                ))
            })?;

        let improved = value.is_finite()
            && ctx
                .state
                .stage_best
                .as_ref()
                .is_none_or(|best| self.store.is_better(value, best.value));
        ctx.state.is_best = improved;
        if improved {
            ctx.state.stage_best = Some(BestRecord {
                stage: ctx.state.stage_key.clone(),
                epoch: ctx.state.epoch,
                loader_key: self.config.loader_key.clone(),
                metric_key: self.config.metric_key.clone(),
                value,
            });
        }

        let metadata = CheckpointMetadata {
            run_id: ctx.state.run_id.clone(),
            stage: ctx.state.stage_key.clone(),
            epoch: ctx.state.epoch,
            global_batch_step: ctx.state.global_batch_step,
            loader_key: self.config.loader_key.clone(),
            metric_key: self.config.metric_key.clone(),
            metric_value: value,
            rank: None,
            created_at: Utc::now(),
        };
        let payload = capture_payload(ctx)?;
        if self.config.save_last {
            self.store.save_last(metadata.clone(), payload.clone())?;
        }
        self.store.save(metadata, payload)?;
        Ok(())
    }

    fn on_stage_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        match self.config.load_on_stage_end {
            Some(target) => self.restore(ctx, target),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Linear;
    use crate::optim::Sgd;
    use crate::state::RunState;
    use tempfile::TempDir;

    fn context(stage_index: usize) -> RunContext {
        let mut state = RunState::new("run");
        state.stage_key = "train".into();
        state.stage_index = stage_index;
        state.loader_key = "valid".into();
        let mut ctx = RunContext::new(state);
        ctx.engine = Some(Engine::cpu());
        ctx.components.model = Some(Box::new(Linear::new(2, 1, 0)));
        ctx.components.optimizer = Some(Box::new(Sgd::new(0.1, 0.9)));
        ctx
    }

    #[test]
    fn test_first_stage_without_checkpoints_skips_restore() {
        let dir = TempDir::new().unwrap();
        let mut config = CheckpointConfig::new(dir.path());
        config.load_on_stage_start = Some(LoadTarget::Best);
        let mut cb = CheckpointCallback::new(config).unwrap();

        assert!(cb.on_stage_start(&mut context(0)).is_ok());
        let err = cb.on_stage_start(&mut context(1)).unwrap_err();
        assert!(matches!(err, RunnerError::StateNotFound(_)));
    }

    #[test]
    fn test_tracks_stage_best() {
        let dir = TempDir::new().unwrap();
        let mut cb = CheckpointCallback::new(CheckpointConfig::new(dir.path())).unwrap();
        let mut ctx = context(0);
        for (epoch, loss) in [(1, 0.4), (2, 0.6), (3, 0.2)] {
            ctx.state.epoch = epoch;
            ctx.state.loader_metrics.insert("loss".into(), loss);
            cb.on_loader_end(&mut ctx).unwrap();
            assert_eq!(ctx.state.is_best, epoch != 2);
        }
        let best = ctx.state.stage_best.unwrap();
        assert_eq!((best.epoch, best.value), (3, 0.2));
    }

    #[test]
    fn test_non_finite_value_never_becomes_stage_best() {
        let dir = TempDir::new().unwrap();
        let mut config = CheckpointConfig::new(dir.path());
        config.save_n_best = 3;
        let mut cb = CheckpointCallback::new(config).unwrap();
        let mut ctx = context(0);
        for (epoch, loss, best) in [(1, f64::NAN, false), (2, 0.5, true), (3, 0.1, true)] {
            ctx.state.epoch = epoch;
            ctx.state.loader_metrics.insert("loss".into(), loss);
            cb.on_loader_end(&mut ctx).unwrap();
            assert_eq!(ctx.state.is_best, best, "epoch {epoch}");
        }

        let best = ctx.state.stage_best.unwrap();
        assert_eq!((best.epoch, best.value), (3, 0.1));
        let pointer = cb.store.best_pointer().unwrap().unwrap();
        assert_eq!((pointer.epoch, pointer.metric_value), (best.epoch, best.value));
    }

    #[test]
    fn test_missing_metric_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let mut cb = CheckpointCallback::new(CheckpointConfig::new(dir.path())).unwrap();
        let mut ctx = context(0);
        ctx.state.loader_metrics.insert("accuracy".into(), 0.5);
        assert!(matches!(
            cb.on_loader_end(&mut ctx).unwrap_err(),
            RunnerError::Configuration(_)
        ));
    }

    #[test]
    fn test_restore_on_stage_end_reloads_best_weights() {
        let dir = TempDir::new().unwrap();
        let mut config = CheckpointConfig::new(dir.path());
        config.load_on_stage_end = Some(LoadTarget::Best);
        let mut cb = CheckpointCallback::new(config).unwrap();
        let mut ctx = context(0);
        ctx.state.epoch = 1;
        ctx.state.loader_metrics.insert("loss".into(), 0.1);
        cb.on_loader_end(&mut ctx).unwrap();
        let saved = ctx.components.model().unwrap().state_dict();

        ctx.components.model = Some(Box::new(Linear::new(2, 1, 42)));
        cb.on_stage_end(&mut ctx).unwrap();
        let restored = ctx.components.model().unwrap().state_dict();
        for (name, tensor) in &saved {
            assert!(tensor.bit_eq(&restored[name]));
        }
    }
}
