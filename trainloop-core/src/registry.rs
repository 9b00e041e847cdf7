//! Name → factory registries for config-defined components.
//!
//! A component is declared as a mapping with a `_target_` naming a registered
//! factory, plus that factory's parameters:
//!
//! ```toml
//! [stages.optimizer]
//! _target_ = "Adam"
//! lr = 0.001
//! ```
//!
//! Each factory declares its required parameters; [`Registry::build`] checks them
//! before invoking the factory.

use crate::callbacks::{
    Callback, CheckpointCallback, CheckpointConfig, CriterionCallback, EarlyStoppingCallback,
    OptimizerCallback, SchedulerCallback, SchedulerMode,
};
use crate::device::{Device, DeviceCapabilities};
use crate::engine::{Engine, PrecisionMode};
use crate::error::{Result, RunnerError};
use crate::nn::{Criterion, Linear, Model, MseLoss};
use crate::optim::{Adam, Optimizer, Scheduler, Sgd, StepLr};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// A `{ "_target_": name, ...params }` component declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(rename = "_target_")]
    pub target: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl ComponentSpec {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Typed access to a component's parameters.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    target: &'a str,
    values: &'a BTreeMap<String, Value>,
}

impl<'a> Params<'a> {
    pub fn new(target: &'a str, values: &'a BTreeMap<String, Value>) -> Self {
        Self { target, values }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Deserialize `key` if present.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| {
                    RunnerError::configuration(format!(
                        "{}: invalid parameter '{key}': {e}",
                        self.target
                    ))
                })
            })
            .transpose()
    }

    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get(key)?.ok_or_else(|| {
            RunnerError::configuration(format!("{}: missing parameter '{key}'", self.target))
        })
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// All parameters as one JSON object, for factories that deserialize a config struct.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone().into_iter().collect())
    }
}

/// Ambient values factories may draw on.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub logdir: &'a Path,
    pub capabilities: &'a DeviceCapabilities,
    pub seed: u64,
    /// Learning rate of the stage optimizer, once resolved.
    pub base_lr: Option<f64>,
}

type Factory<T> = Box<dyn Fn(Params<'_>, &BuildContext<'_>) -> Result<T> + Send + Sync>;

struct Entry<T> {
    required: Vec<String>,
    factory: Factory<T>,
}

/// Factories for one kind of component.
pub struct Registry<T> {
    kind: &'static str,
    entries: BTreeMap<String, Entry<T>>,
}

impl<T> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Register a factory. Returns an error if `name` is already registered.
    pub fn register<F>(&mut self, name: &str, required: &[&str], factory: F) -> Result<()>
    where
        F: Fn(Params<'_>, &BuildContext<'_>) -> Result<T> + Send + Sync + 'static,
    {
        if self.entries.contains_key(name) {
            return Err(RunnerError::configuration(format!(
                "{} '{name}' is already registered",
                self.kind
            )));
        }
        debug!(kind = self.kind, name, "Registering factory");
        self.entries.insert(
            name.to_string(),
            Entry {
                required: required.iter().map(|s| s.to_string()).collect(),
                factory: Box::new(factory),
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn required_params(&self, name: &str) -> Option<&[String]> {
        self.entries.get(name).map(|e| e.required.as_slice())
    }

    /// Validate `spec` against the factory's required parameters, then build.
    pub fn build(&self, spec: &ComponentSpec, ctx: &BuildContext<'_>) -> Result<T> {
        let entry = self.entries.get(&spec.target).ok_or_else(|| {
            RunnerError::configuration(format!(
                "unknown {} '{}' (registered: {})",
                self.kind,
                spec.target,
                self.names().join(", ")
            ))
        })?;
        let missing: Vec<&str> = entry
            .required
            .iter()
            .filter(|r| !spec.params.contains_key(*r))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(RunnerError::configuration(format!(
                "{} '{}' is missing required parameter(s): {}",
                self.kind,
                spec.target,
                missing.join(", ")
            )));
        }
        (entry.factory)(Params::new(&spec.target, &spec.params), ctx)
    }
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

/// Every registry the config-driven experiment resolves through.
#[derive(Debug)]
pub struct Registries {
    pub callbacks: Registry<Box<dyn Callback>>,
    pub engines: Registry<Engine>,
    pub models: Registry<Box<dyn Model>>,
    pub criteria: Registry<Box<dyn Criterion>>,
    pub optimizers: Registry<Box<dyn Optimizer>>,
    pub schedulers: Registry<Box<dyn Scheduler>>,
}

impl Registries {
    /// Registries with no factories.
    pub fn empty() -> Self {
        Self {
            callbacks: Registry::new("callback"),
            engines: Registry::new("engine"),
            models: Registry::new("model"),
            criteria: Registry::new("criterion"),
            optimizers: Registry::new("optimizer"),
            schedulers: Registry::new("scheduler"),
        }
    }

    /// Registries with every built-in component.
    pub fn builtin() -> Result<Self> {
        let mut r = Self::empty();

        r.callbacks.register("CriterionCallback", &[], |p, _| {
            Ok(Box::new(CriterionCallback::new(
                p.get_or("metric_key", "loss".to_string())?,
                p.get_or("input_key", "logits".to_string())?,
                p.get_or("target_key", "targets".to_string())?,
            )) as Box<dyn Callback>)
        })?;
        r.callbacks.register("OptimizerCallback", &[], |p, _| {
            Ok(Box::new(OptimizerCallback::new(
                p.get_or("metric_key", "loss".to_string())?,
                p.get_or("accumulation_steps", 1usize)?,
            )) as Box<dyn Callback>)
        })?;
        r.callbacks.register("SchedulerCallback", &[], |p, _| {
            let mode: String = p.get_or("mode", "epoch".to_string())?;
            Ok(Box::new(SchedulerCallback::new(
                p.get_or("loader_key", "valid".to_string())?,
                p.get_or("metric_key", "loss".to_string())?,
                mode.parse::<SchedulerMode>()?,
            )) as Box<dyn Callback>)
        })?;
        r.callbacks.register("CheckpointCallback", &[], |p, ctx| {
            let mut value = p.to_value();
            if let Value::Object(map) = &mut value {
                map.entry("logdir")
                    .or_insert_with(|| Value::String(ctx.logdir.to_string_lossy().into_owned()));
            }
            let config: CheckpointConfig = serde_json::from_value(value).map_err(|e| {
                RunnerError::configuration(format!("CheckpointCallback: {e}"))
            })?;
            Ok(Box::new(CheckpointCallback::new(config)?) as Box<dyn Callback>)
        })?;
        r.callbacks.register("EarlyStoppingCallback", &["patience"], |p, _| {
            Ok(Box::new(
                EarlyStoppingCallback::new(
                    p.get_or("loader_key", "valid".to_string())?,
                    p.get_or("metric_key", "loss".to_string())?,
                    p.require("patience")?,
                )
                .minimize(p.get_or("minimize", true)?)
                .min_delta(p.get_or("min_delta", 0.0)?),
            ) as Box<dyn Callback>)
        })?;

        r.engines.register("DeviceEngine", &[], |p, ctx| {
            let device: Device = p.get_or("device", Device::Cpu)?;
            Engine::device_engine(device, ctx.capabilities)
        })?;
        r.engines.register("AmpEngine", &["precision"], |p, ctx| {
            let device: Device = p.get_or("device", Device::Cuda(0))?;
            let precision: String = p.require("precision")?;
            Engine::new(device, precision.parse::<PrecisionMode>()?, ctx.capabilities)
        })?;

        r.models.register("Linear", &["in_features", "out_features"], |p, ctx| {
            Ok(Box::new(Linear::new(
                p.require("in_features")?,
                p.require("out_features")?,
                p.get_or("seed", ctx.seed)?,
            )) as Box<dyn Model>)
        })?;

        r.criteria
            .register("MseLoss", &[], |_, _| Ok(Box::new(MseLoss) as Box<dyn Criterion>))?;

        r.optimizers.register("Sgd", &["lr"], |p, _| {
            Ok(Box::new(Sgd::new(p.require("lr")?, p.get_or("momentum", 0.0)?))
                as Box<dyn Optimizer>)
        })?;
        r.optimizers.register("Adam", &["lr"], |p, _| {
            Ok(Box::new(Adam::with_betas(
                p.require("lr")?,
                p.get_or("beta1", 0.9)?,
                p.get_or("beta2", 0.999)?,
                p.get_or("eps", 1e-8)?,
            )) as Box<dyn Optimizer>)
        })?;

        r.schedulers.register("StepLr", &["step_size"], |p, ctx| {
            let base_lr = match p.get::<f64>("base_lr")?.or(ctx.base_lr) {
                Some(lr) => lr,
                None => {
                    return Err(RunnerError::configuration(
                        "StepLr: no base_lr given and no optimizer resolved",
                    ));
                }
            };
            Ok(Box::new(StepLr::new(
                base_lr,
                p.require("step_size")?,
                p.get_or("gamma", 0.1)?,
            )) as Box<dyn Scheduler>)
        })?;

        Ok(r)
    }
}
