//! Run configuration.
//!
//! Uses `figment` for layered configuration: built-in defaults -> TOML file ->
//! environment (`TRAINLOOP_` prefix, `__` for nesting) -> explicit overrides.

use crate::error::{Result, RunnerError};
use crate::registry::ComponentSpec;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Prefix of environment variables read by [`load_config`].
pub const ENV_PREFIX: &str = "TRAINLOOP_";

/// A callback declaration: a unique name plus its component spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSpec {
    pub name: String,
    #[serde(flatten)]
    pub spec: ComponentSpec,
}

impl NamedSpec {
    pub fn new(name: impl Into<String>, spec: ComponentSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }
}

/// One stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub num_epochs: usize,
    /// Omit to carry the previous stage's model over.
    #[serde(default)]
    pub model: Option<ComponentSpec>,
    #[serde(default)]
    pub criterion: Option<ComponentSpec>,
    #[serde(default)]
    pub optimizer: Option<ComponentSpec>,
    #[serde(default)]
    pub scheduler: Option<ComponentSpec>,
    /// Stage-level callbacks, dispatched in this order.
    #[serde(default)]
    pub callbacks: Vec<NamedSpec>,
}

/// Which built-in metric sinks are enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub console: bool,
    pub csv: bool,
    /// Also report every batch to the console sink.
    pub log_batch: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            console: true,
            csv: true,
            log_batch: false,
        }
    }
}

/// Top-level run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub logdir: PathBuf,
    pub seed: u64,
    /// Overrides accelerator detection when set.
    #[serde(default)]
    pub num_accelerators: Option<usize>,
    pub engine: ComponentSpec,
    #[serde(default)]
    pub loggers: LoggerConfig,
    /// Run-level callbacks, dispatched before stage-level ones at every hook.
    #[serde(default)]
    pub callbacks: Vec<NamedSpec>,
    pub stages: Vec<StageConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            logdir: PathBuf::from("logs"),
            seed: 42,
            num_accelerators: None,
            engine: ComponentSpec::new("DeviceEngine"),
            loggers: LoggerConfig::default(),
            callbacks: Vec::new(),
            stages: vec![StageConfig {
                name: "train".to_string(),
                num_epochs: 1,
                model: Some(
                    ComponentSpec::new("Linear")
                        .param("in_features", 1)
                        .param("out_features", 1),
                ),
                criterion: Some(ComponentSpec::new("MseLoss")),
                optimizer: Some(ComponentSpec::new("Sgd").param("lr", 0.01)),
                scheduler: None,
                callbacks: vec![
                    NamedSpec::new("criterion", ComponentSpec::new("CriterionCallback")),
                    NamedSpec::new("optimizer", ComponentSpec::new("OptimizerCallback")),
                ],
            }],
        }
    }
}

impl RunnerConfig {
    /// Structural checks that do not need the registries.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(RunnerError::configuration("at least one stage is required"));
        }
        let mut names = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if !names.insert(stage.name.as_str()) {
                return Err(RunnerError::configuration(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.num_epochs == 0 {
                return Err(RunnerError::configuration(format!(
                    "stage '{}' must run at least one epoch",
                    stage.name
                )));
            }
            if index == 0 && stage.model.is_none() {
                return Err(RunnerError::configuration(format!(
                    "first stage '{}' must declare a model",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RunnerError::configuration(format!("cannot render config: {e}")))
    }
}

/// The layered figment behind [`load_config`], for callers that extract extra sections.
pub fn config_figment(path: Option<&Path>, overrides: &[(&str, serde_json::Value)]) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(RunnerConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(key, value.clone()));
    }
    figment
}

/// Load and validate configuration.
///
/// A `path` that does not exist is an error; `None` skips the file layer.
pub fn load_config(path: Option<&Path>, overrides: &[(&str, serde_json::Value)]) -> Result<RunnerConfig> {
    if let Some(path) = path {
        if !path.exists() {
            return Err(RunnerError::configuration(format!(
                "config file {} not found",
                path.display()
            )));
        }
    }
    let config: RunnerConfig = config_figment(path, overrides)
        .extract()
        .map_err(|e| RunnerError::configuration(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serde_json::json;

    #[test]
    fn test_load_config_defaults() {
        Jail::expect_with(|_| {
            let config = load_config(None, &[]).map_err(|e| e.to_string())?;
            assert_eq!(config, RunnerConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = RunnerConfig::default();
        let rendered = config.to_toml().unwrap();
        let back: RunnerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_load_config_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "trainloop.toml",
                r#"
                logdir = "runs/a"
                seed = 1

                [engine]
                _target_ = "AmpEngine"
                precision = "O1"

                [[stages]]
                name = "warmup"
                num_epochs = 2
                model = { _target_ = "Linear", in_features = 3, out_features = 1 }
                optimizer = { _target_ = "Adam", lr = 0.001 }

                [[stages.callbacks]]
                name = "criterion"
                _target_ = "CriterionCallback"

                [[stages]]
                name = "finetune"
                num_epochs = 1
                "#,
            )?;
            jail.set_env("TRAINLOOP_SEED", "7");
            jail.set_env("TRAINLOOP_LOGGERS__CSV", "false");

            let config = load_config(
                Some(Path::new("trainloop.toml")),
                &[("logdir", json!("runs/b"))],
            )
            .map_err(|e| e.to_string())?;

            assert_eq!(config.seed, 7);
            assert_eq!(config.logdir, PathBuf::from("runs/b"));
            assert!(!config.loggers.csv);
            assert_eq!(config.engine.target, "AmpEngine");
            assert_eq!(config.stages.len(), 2);
            assert_eq!(config.stages[0].callbacks[0].spec.target, "CriterionCallback");
            assert!(config.stages[1].model.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_bad_stages() {
        let mut config = RunnerConfig::default();
        config.stages.push(config.stages[0].clone());
        assert!(config.validate().is_err());

        let mut config = RunnerConfig::default();
        config.stages[0].num_epochs = 0;
        assert!(config.validate().is_err());

        let mut config = RunnerConfig::default();
        config.stages[0].model = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_config(Some(Path::new("/nonexistent/trainloop.toml")), &[]).is_err());
    }
}
