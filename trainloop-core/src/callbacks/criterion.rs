use super::Callback;
use crate::error::Result;
use crate::state::RunContext;

/// Computes the stage criterion on two batch entries.
///
/// The scalar goes to `batch_metrics[metric_key]`; the loss with its gradient goes
/// to `batch_losses[metric_key]` for a later optimizer callback.
#[derive(Debug, Clone)]
pub struct CriterionCallback {
    pub metric_key: String,
    pub input_key: String,
    pub target_key: String,
}

impl CriterionCallback {
    pub fn new(
        metric_key: impl Into<String>,
        input_key: impl Into<String>,
        target_key: impl Into<String>,
    ) -> Self {
        Self {
            metric_key: metric_key.into(),
            input_key: input_key.into(),
            target_key: target_key.into(),
        }
    }
}

impl Default for CriterionCallback {
    fn default() -> Self {
        Self::new("loss", "logits", "targets")
    }
}

impl Callback for CriterionCallback {
    fn provides(&self) -> Vec<String> {
        vec![self.metric_key.clone()]
    }

    fn on_batch_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        let criterion = ctx.components.criterion()?;
        let loss = criterion.compute(
            ctx.state.batch_tensor(&self.input_key)?,
            ctx.state.batch_tensor(&self.target_key)?,
        )?;
        ctx.state
            .batch_metrics
            .insert(self.metric_key.clone(), loss.value);
        ctx.state.batch_losses.insert(self.metric_key.clone(), loss);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;
    use crate::nn::MseLoss;
    use crate::state::RunState;
    use crate::tensor::Tensor;

    #[test]
    fn test_writes_metric_and_loss() {
        let mut ctx = RunContext::new(RunState::new("run"));
        ctx.components.criterion = Some(Box::new(MseLoss));
        let t = |v: Vec<f32>| Tensor::from_vec(vec![2, 1], v).unwrap();
        ctx.state.batch.insert("logits".into(), t(vec![1.0, 1.0]));
        ctx.state.batch.insert("targets".into(), t(vec![0.0, 1.0]));

        CriterionCallback::default().on_batch_end(&mut ctx).unwrap();
        assert_eq!(ctx.state.batch_metrics["loss"], 0.5);
        assert!(ctx.state.batch_losses.contains_key("loss"));
    }

    #[test]
    fn test_missing_batch_key_is_data_error() {
        let mut ctx = RunContext::new(RunState::new("run"));
        ctx.components.criterion = Some(Box::new(MseLoss));
        let err = CriterionCallback::default().on_batch_end(&mut ctx).unwrap_err();
        assert!(matches!(err, RunnerError::Data(_)));
    }
}
