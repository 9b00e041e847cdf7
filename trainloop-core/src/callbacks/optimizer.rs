use super::Callback;
use crate::error::Result;
use crate::state::RunContext;
use tracing::debug;

/// Backpropagates a criterion loss and steps the optimizer on train loaders.
///
/// Gradients accumulate over `accumulation_steps` batches; the last partial window
/// of a loader is flushed at loader end. The current learning rate is recorded
/// as the `lr` batch metric.
#[derive(Debug, Clone)]
pub struct OptimizerCallback {
    pub metric_key: String,
    pub accumulation_steps: usize,
    pending: usize,
}

impl OptimizerCallback {
    pub fn new(metric_key: impl Into<String>, accumulation_steps: usize) -> Self {
        Self {
            metric_key: metric_key.into(),
            accumulation_steps: accumulation_steps.max(1),
            pending: 0,
        }
    }

    fn step(&mut self, ctx: &mut RunContext) -> Result<()> {
        let applied = ctx.optimizer_step()?;
        ctx.zero_grad()?;
        self.pending = 0;
        if !applied {
            debug!(
                step = ctx.state.global_batch_step,
                "Optimizer step skipped by engine"
            );
        }
        Ok(())
    }
}

impl Default for OptimizerCallback {
    fn default() -> Self {
        Self::new("loss", 1)
    }
}

impl Callback for OptimizerCallback {
    fn provides(&self) -> Vec<String> {
        vec!["lr".to_string()]
    }

    fn requires(&self) -> Vec<String> {
        vec![self.metric_key.clone()]
    }

    fn on_loader_start(&mut self, ctx: &mut RunContext) -> Result<()> {
        self.pending = 0;
        if ctx.state.is_train_loader {
            ctx.zero_grad()?;
        }
        Ok(())
    }

    fn on_batch_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        if !ctx.state.is_train_loader {
            return Ok(());
        }
        ctx.backward(&self.metric_key)?;
        self.pending += 1;
        if self.pending >= self.accumulation_steps {
            self.step(ctx)?;
        }
        let lr = ctx.components.optimizer_mut()?.lr();
        ctx.state.batch_metrics.insert("lr".to_string(), lr);
        Ok(())
    }

    fn on_loader_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        if ctx.state.is_train_loader && self.pending > 0 {
            self.step(ctx)?;
        }
        Ok(())
    }
}
