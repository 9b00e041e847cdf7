//! Early stopping on a loader metric plateau.

use super::Callback;
use crate::error::Result;
use crate::state::RunContext;
use tracing::info;

/// Requests a stage stop after `patience` epochs without improvement.
#[derive(Debug, Clone)]
pub struct EarlyStoppingCallback {
    pub loader_key: String,
    pub metric_key: String,
    pub minimize: bool,
    pub patience: usize,
    pub min_delta: f64,
    counter: usize,
    best: Option<f64>,
}

impl EarlyStoppingCallback {
    pub fn new(loader_key: impl Into<String>, metric_key: impl Into<String>, patience: usize) -> Self {
        Self {
            loader_key: loader_key.into(),
            metric_key: metric_key.into(),
            minimize: true,
            patience: patience.max(1),
            min_delta: 0.0,
            counter: 0,
            best: None,
        }
    }

    pub fn minimize(mut self, minimize: bool) -> Self {
        self.minimize = minimize;
        self
    }

    pub fn min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    fn improved(&self, value: f64, best: f64) -> bool {
        if self.minimize {
            value < best - self.min_delta
        } else {
            value > best + self.min_delta
        }
    }

    /// Feed one epoch's value. Returns `true` when patience is exhausted.
    pub fn observe(&mut self, value: f64) -> bool {
        match self.best {
            Some(best) if !self.improved(value, best) => {
                self.counter += 1;
                self.counter >= self.patience
            }
            _ => {
                self.best = Some(value);
                self.counter = 0;
                false
            }
        }
    }
}

impl Callback for EarlyStoppingCallback {
    fn on_stage_start(&mut self, _ctx: &mut RunContext) -> Result<()> {
        self.counter = 0;
        self.best = None;
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        let Some(value) = ctx.state.metric(&self.loader_key, &self.metric_key) else {
            return Ok(());
        };
        if self.observe(value) {
            info!(
                stage = %ctx.state.stage_key,
                epoch = ctx.state.epoch,
                metric = %self.metric_key,
                patience = self.patience,
                "Early stopping"
            );
            ctx.state.request_stop_stage();
        }
        Ok(())
    }
}
