use super::Callback;
use crate::error::{Result, RunnerError};
use crate::state::RunContext;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// When the scheduler steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    #[default]
    Epoch,
    Batch,
}

impl FromStr for SchedulerMode {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epoch" => Ok(SchedulerMode::Epoch),
            "batch" => Ok(SchedulerMode::Batch),
            other => Err(RunnerError::configuration(format!(
                "unknown scheduler mode '{other}', expected 'epoch' or 'batch'"
            ))),
        }
    }
}

/// Steps the stage scheduler once per epoch or once per train batch.
///
/// In epoch mode the scheduler receives `metric_key` from `loader_key`'s epoch
/// metrics, for metric-driven schedules.
#[derive(Debug, Clone)]
pub struct SchedulerCallback {
    pub loader_key: String,
    pub metric_key: String,
    pub mode: SchedulerMode,
}

impl SchedulerCallback {
    pub fn new(loader_key: impl Into<String>, metric_key: impl Into<String>, mode: SchedulerMode) -> Self {
        Self {
            loader_key: loader_key.into(),
            metric_key: metric_key.into(),
            mode,
        }
    }
}

impl Default for SchedulerCallback {
    fn default() -> Self {
        Self::new("valid", "loss", SchedulerMode::Epoch)
    }
}

impl Callback for SchedulerCallback {
    fn on_batch_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        if self.mode != SchedulerMode::Batch || !ctx.state.is_train_loader {
            return Ok(());
        }
        if let Some((optimizer, scheduler)) = ctx.components.optimizer_and_scheduler() {
            scheduler.step(optimizer, None);
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        if self.mode != SchedulerMode::Epoch {
            return Ok(());
        }
        let metric = ctx.state.metric(&self.loader_key, &self.metric_key);
        if let Some((optimizer, scheduler)) = ctx.components.optimizer_and_scheduler() {
            scheduler.step(optimizer, metric);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{Sgd, StepLr};
    use crate::state::RunState;

    fn context() -> RunContext {
        let mut ctx = RunContext::new(RunState::new("run"));
        ctx.components.optimizer = Some(Box::new(Sgd::new(1.0, 0.0)));
        ctx.components.scheduler = Some(Box::new(StepLr::new(1.0, 1, 0.5)));
        ctx
    }

    #[test]
    fn test_epoch_mode_steps_at_epoch_end_only() {
        let mut ctx = context();
        ctx.state.is_train_loader = true;
        let mut cb = SchedulerCallback::default();
        cb.on_batch_end(&mut ctx).unwrap();
        assert_eq!(ctx.components.optimizer_mut().unwrap().lr(), 1.0);
        cb.on_epoch_end(&mut ctx).unwrap();
        assert_eq!(ctx.components.optimizer_mut().unwrap().lr(), 0.5);
    }

    #[test]
    fn test_batch_mode_steps_on_train_batches() {
        let mut ctx = context();
        let mut cb = SchedulerCallback::new("valid", "loss", SchedulerMode::Batch);
        cb.on_batch_end(&mut ctx).unwrap();
        assert_eq!(ctx.components.optimizer_mut().unwrap().lr(), 1.0);
        ctx.state.is_train_loader = true;
        cb.on_batch_end(&mut ctx).unwrap();
        cb.on_epoch_end(&mut ctx).unwrap();
        assert_eq!(ctx.components.optimizer_mut().unwrap().lr(), 0.5);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("batch".parse::<SchedulerMode>().unwrap(), SchedulerMode::Batch);
        assert!("step".parse::<SchedulerMode>().is_err());
    }
}
