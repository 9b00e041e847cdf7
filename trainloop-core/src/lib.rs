//! # trainloop-core
//!
//! A staged training-loop runner. An [`Experiment`] describes stages, loaders and
//! components; the [`Runner`] walks stage -> epoch -> loader -> batch, dispatches
//! [`Callback`]s at every transition, delegates device placement and mixed
//! precision to an [`Engine`], and checkpoints the best-N states through
//! [`CheckpointManager`].

// Numeric substrate
pub mod device;
pub mod nn;
pub mod optim;
pub mod tensor;

// Runner
pub mod callbacks;
pub mod data;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod runner;
pub mod state;

// Persistence & reporting
pub mod checkpoint;
pub mod loggers;
pub mod persistence;

// Configuration
pub mod config;
pub mod registry;
pub mod supervised;

// Re-exports
pub use callbacks::{Callback, CallbackList, Hook};
pub use checkpoint::{CheckpointManager, LoadTarget};
pub use config::{RunnerConfig, load_config};
pub use data::{Batch, Loader, LoaderSet, TensorLoader};
pub use device::{Device, DeviceCapabilities};
pub use engine::{Engine, PrecisionMode};
pub use error::{ErrorKind, Result, RunnerError};
pub use metrics::{Metrics, RunSummary};
pub use registry::{ComponentSpec, Registries};
pub use runner::{Experiment, Runner};
pub use state::{RunContext, RunState};
pub use supervised::SupervisedExperiment;
pub use tensor::{DType, Tensor};
