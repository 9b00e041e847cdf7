//! Metric accumulation and run history.

use crate::engine::EngineStats;
use crate::state::BestRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scalar metrics keyed by name.
pub type Metrics = BTreeMap<String, f64>;

/// Sample-weighted running mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdditiveMeter {
    sum: f64,
    count: usize,
}

impl AdditiveMeter {
    pub fn add(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// One meter per metric key, reset at every loader start.
#[derive(Debug, Clone, Default)]
pub struct MeterSet {
    meters: BTreeMap<String, AdditiveMeter>,
}

impl MeterSet {
    /// Fold a batch's metrics in, weighted by `batch_size`.
    pub fn update(&mut self, metrics: &Metrics, batch_size: usize) {
        let n = batch_size.max(1);
        for (key, value) in metrics {
            self.meters.entry(key.clone()).or_default().add(*value, n);
        }
    }

    pub fn compute(&self) -> Metrics {
        self.meters
            .iter()
            .filter_map(|(k, m)| m.mean().map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn reset(&mut self) {
        self.meters.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }
}

/// Metrics of one completed epoch, keyed by loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub stage: String,
    pub epoch: usize,
    pub loaders: BTreeMap<String, Metrics>,
}

/// Every epoch's metrics over the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    pub epochs: Vec<EpochRecord>,
}

impl MetricHistory {
    pub fn record_epoch(&mut self, stage: &str, epoch: usize, loaders: BTreeMap<String, Metrics>) {
        self.epochs.push(EpochRecord {
            stage: stage.to_string(),
            epoch,
            loaders,
        });
    }

    /// Values of `key` on `loader` for every epoch of `stage`, in order.
    pub fn series(&self, stage: &str, loader: &str, key: &str) -> Vec<f64> {
        self.epochs
            .iter()
            .filter(|r| r.stage == stage)
            .filter_map(|r| r.loaders.get(loader).and_then(|m| m.get(key)).copied())
            .collect()
    }

    pub fn epochs_in_stage(&self, stage: &str) -> usize {
        self.epochs.iter().filter(|r| r.stage == stage).count()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub name: String,
    pub epochs_completed: usize,
    pub stopped_early: bool,
    pub best: Option<BestRecord>,
}

/// What [`crate::Runner::run`] returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub stages: Vec<StageSummary>,
    pub history: MetricHistory,
    pub engine: EngineStats,
    pub global_batch_step: u64,
    pub stopped_early: bool,
    pub total_time_secs: f64,
}

impl RunSummary {
    pub fn stage(&self, name: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.name == name)
    }
}
