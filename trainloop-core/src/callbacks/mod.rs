//! Lifecycle callbacks and their ordered dispatcher.
//!
//! A [`Callback`] implements any subset of the lifecycle hooks. A [`CallbackList`]
//! holds named callbacks in registration order and invokes one hook on all of them
//! in that order. A callback asks the runner to stop by setting a flag on
//! [`RunState`](crate::state::RunState); the runner only looks at the flags after
//! the whole hook has been dispatched.
//!
//! Ordering between callbacks that feed each other (a criterion writing a loss that
//! an optimizer callback consumes) is declared with [`Callback::provides`] and
//! [`Callback::requires`], and checked by [`CallbackList::validate`].

mod checkpoint;
mod criterion;
mod early_stopping;
mod optimizer;
mod scheduler;

pub use checkpoint::{CheckpointCallback, CheckpointConfig};
pub use criterion::CriterionCallback;
pub use early_stopping::EarlyStoppingCallback;
pub use optimizer::OptimizerCallback;
pub use scheduler::{SchedulerCallback, SchedulerMode};

use crate::error::{Result, RunnerError};
use crate::state::RunContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::trace;

/// Lifecycle hook identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    ExperimentStart,
    StageStart,
    EpochStart,
    LoaderStart,
    BatchStart,
    BatchEnd,
    LoaderEnd,
    EpochEnd,
    StageEnd,
    ExperimentEnd,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::ExperimentStart => "on_experiment_start",
            Hook::StageStart => "on_stage_start",
            Hook::EpochStart => "on_epoch_start",
            Hook::LoaderStart => "on_loader_start",
            Hook::BatchStart => "on_batch_start",
            Hook::BatchEnd => "on_batch_end",
            Hook::LoaderEnd => "on_loader_end",
            Hook::EpochEnd => "on_epoch_end",
            Hook::StageEnd => "on_stage_end",
            Hook::ExperimentEnd => "on_experiment_end",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit reacting to lifecycle hooks. Every hook defaults to a no-op.
pub trait Callback: Send {
    /// Metric or loss keys this callback writes into the run state.
    fn provides(&self) -> Vec<String> {
        Vec::new()
    }

    /// Keys this callback reads that another callback must write first.
    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_experiment_start(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_stage_start(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_loader_start(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_batch_start(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_batch_end(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_loader_end(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_stage_end(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn on_experiment_end(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    /// Invoke the method for `hook`.
    fn call(&mut self, hook: Hook, ctx: &mut RunContext) -> Result<()> {
        match hook {
            Hook::ExperimentStart => self.on_experiment_start(ctx),
            Hook::StageStart => self.on_stage_start(ctx),
            Hook::EpochStart => self.on_epoch_start(ctx),
            Hook::LoaderStart => self.on_loader_start(ctx),
            Hook::BatchStart => self.on_batch_start(ctx),
            Hook::BatchEnd => self.on_batch_end(ctx),
            Hook::LoaderEnd => self.on_loader_end(ctx),
            Hook::EpochEnd => self.on_epoch_end(ctx),
            Hook::StageEnd => self.on_stage_end(ctx),
            Hook::ExperimentEnd => self.on_experiment_end(ctx),
        }
    }
}

/// Named callbacks in registration order.
#[derive(Default)]
pub struct CallbackList {
    entries: Vec<(String, Box<dyn Callback>)>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name`. Names are unique within a list.
    pub fn add(&mut self, name: impl Into<String>, callback: impl Callback + 'static) -> Result<()> {
        self.add_boxed(name, Box::new(callback))
    }

    pub fn add_boxed(&mut self, name: impl Into<String>, callback: Box<dyn Callback>) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(RunnerError::configuration(format!(
                "duplicate callback name '{name}'"
            )));
        }
        self.entries.push((name, callback));
        Ok(())
    }

    pub fn with(mut self, name: impl Into<String>, callback: impl Callback + 'static) -> Result<Self> {
        self.add(name, callback)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that every required key is provided by an earlier callback, if any
    /// callback provides it at all. Keys nobody provides are left to the batch handler.
    pub fn validate(&self) -> Result<()> {
        let mut provider: HashMap<String, usize> = HashMap::new();
        for (index, (_, cb)) in self.entries.iter().enumerate() {
            for key in cb.provides() {
                provider.entry(key).or_insert(index);
            }
        }
        for (index, (name, cb)) in self.entries.iter().enumerate() {
            for key in cb.requires() {
                if let Some(&at) = provider.get(&key) {
                    if at > index {
                        return Err(RunnerError::configuration(format!(
                            "callback '{name}' requires '{key}', which is provided by '{}' registered after it",
                            self.entries[at].0
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Invoke `hook` on every callback in order, stopping at the first failure.
    pub fn dispatch(&mut self, hook: Hook, ctx: &mut RunContext) -> Result<()> {
        for (name, cb) in &mut self.entries {
            trace!(callback = %name, %hook, "Dispatching");
            cb.call(hook, ctx)
                .map_err(|e| RunnerError::callback(name.clone(), hook, e))?;
        }
        Ok(())
    }
}

impl fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
