//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use trainloop_core::callbacks::{Callback, CallbackList, Hook};
use trainloop_core::data::{LoaderSet, TensorLoader};
use trainloop_core::nn::{Criterion, Linear, Model, MseLoss};
use trainloop_core::optim::{Optimizer, Sgd};
use trainloop_core::{Experiment, Result, RunContext, Tensor};

pub type EventLog = Arc<Mutex<Vec<String>>>;

/// `n` points on `y = 2x + 1`, `batch_size` rows per batch.
pub fn line_loader(n: usize, batch_size: usize) -> TensorLoader {
    let x: Vec<f32> = (0..n).map(|i| i as f32 / n as f32).collect();
    let y: Vec<f32> = x.iter().map(|v| 2.0 * v + 1.0).collect();
    TensorLoader::new(
        Tensor::from_vec(vec![n, 1], x).unwrap(),
        Tensor::from_vec(vec![n, 1], y).unwrap(),
        batch_size,
    )
    .unwrap()
}

/// Appends `<tag>:<hook>[:<loader>]` for every hook it sees.
pub struct Recorder {
    pub tag: &'static str,
    pub log: EventLog,
}

impl Recorder {
    fn push(&self, hook: Hook, ctx: &RunContext) -> Result<()> {
        let entry = match hook {
            Hook::LoaderStart | Hook::LoaderEnd | Hook::BatchStart | Hook::BatchEnd => {
                format!("{}:{}:{}", self.tag, hook, ctx.state.loader_key)
            }
            _ => format!("{}:{}", self.tag, hook),
        };
        self.log.lock().unwrap().push(entry);
        Ok(())
    }
}

impl Callback for Recorder {
    fn call(&mut self, hook: Hook, ctx: &mut RunContext) -> Result<()> {
        self.push(hook, ctx)
    }
}

pub type StageCallbacks = fn(&str, &EventLog) -> Result<CallbackList>;

/// Experiment with fixed stages and loaders, recording every hook.
///
/// Each loader is `(key, samples)` with two samples per batch.
pub struct Scripted {
    pub stages: Vec<(&'static str, usize)>,
    pub loaders: Vec<(&'static str, usize)>,
    pub log: EventLog,
    pub extra: StageCallbacks,
    /// Resolve an MSE criterion and an SGD optimizer for every stage.
    pub trainable: bool,
}

impl Scripted {
    pub fn new(stages: Vec<(&'static str, usize)>, loaders: Vec<(&'static str, usize)>) -> Self {
        Self {
            stages,
            loaders,
            log: EventLog::default(),
            extra: |_, _| Ok(CallbackList::new()),
            trainable: false,
        }
    }

    pub fn trainable(mut self) -> Self {
        self.trainable = true;
        self
    }

    pub fn with_extra(mut self, extra: StageCallbacks) -> Self {
        self.extra = extra;
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == event)
            .count()
    }
}

impl Experiment for Scripted {
    fn stages(&self) -> Vec<String> {
        self.stages.iter().map(|(s, _)| s.to_string()).collect()
    }

    fn stage_len(&self, stage: &str) -> usize {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    fn run_callbacks(&mut self) -> Result<CallbackList> {
        CallbackList::new().with(
            "run-recorder",
            Recorder {
                tag: "run",
                log: self.log.clone(),
            },
        )
    }

    fn loaders(&mut self, _stage: &str) -> Result<LoaderSet> {
        let mut set = LoaderSet::new();
        for (key, n) in &self.loaders {
            set.insert(*key, line_loader(*n, 2))?;
        }
        Ok(set)
    }

    fn model(&mut self, _stage: &str, current: Option<Box<dyn Model>>) -> Result<Box<dyn Model>> {
        Ok(current.unwrap_or_else(|| Box::new(Linear::new(1, 1, 7))))
    }

    fn criterion(&mut self, _stage: &str) -> Result<Option<Box<dyn Criterion>>> {
        Ok(self.trainable.then(|| Box::new(MseLoss) as Box<dyn Criterion>))
    }

    fn optimizer(&mut self, _stage: &str, _model: &dyn Model) -> Result<Option<Box<dyn Optimizer>>> {
        Ok(self
            .trainable
            .then(|| Box::new(Sgd::new(0.1, 0.0)) as Box<dyn Optimizer>))
    }

    fn callbacks(&mut self, stage: &str) -> Result<CallbackList> {
        let mut list = (self.extra)(stage, &self.log)?;
        list.add(
            "stage-recorder",
            Recorder {
                tag: "stage",
                log: self.log.clone(),
            },
        )?;
        Ok(list)
    }

    fn handle_batch(&mut self, ctx: &mut RunContext) -> Result<()> {
        let x = ctx.state.batch_tensor("features")?.clone();
        let y = ctx.forward(&x)?;
        ctx.state.batch.insert("logits".to_string(), y);
        Ok(())
    }
}
