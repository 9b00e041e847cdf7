//! Best-N checkpoint store.
//!
//! Layout under `<logdir>/checkpoints/`:
//!
//! - `_manifest.json`: the ranked best-N set, best first. It is the only
//!   authority on which entries exist; files it does not reference are never
//!   restored.
//! - `<stage>.<epoch>.json`: one file per retained entry.
//! - `best.json`: pointer to the current best entry.
//! - `last.json`: optional full checkpoint of the most recent save request.
//!
//! A save writes the entry file, then the manifest, then the best pointer, and
//! only then deletes evicted files. Each write is atomic, so a crash at any point
//! leaves the manifest describing complete files.

use crate::engine::EngineState;
use crate::error::{Result, RunnerError};
use crate::nn::StateDict;
use crate::optim::{OptimizerState, SchedulerState};
use crate::persistence::{atomic_write_json, load_json, remove_if_exists};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const MANIFEST_FILE: &str = "_manifest.json";
pub const BEST_FILE: &str = "best.json";
pub const LAST_FILE: &str = "last.json";

/// Which persisted entry to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LoadTarget {
    Best,
    Last,
    /// 1-based rank in the best-N set.
    Rank(usize),
}

impl fmt::Display for LoadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadTarget::Best => f.write_str("best"),
            LoadTarget::Last => f.write_str("last"),
            LoadTarget::Rank(k) => write!(f, "rank:{k}"),
        }
    }
}

impl FromStr for LoadTarget {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "best" => Ok(LoadTarget::Best),
            "last" => Ok(LoadTarget::Last),
            other => other
                .strip_prefix("rank:")
                .and_then(|k| k.parse::<usize>().ok())
                .filter(|k| *k >= 1)
                .map(LoadTarget::Rank)
                .ok_or_else(|| {
                    RunnerError::configuration(format!(
                        "invalid load target '{other}', expected 'best', 'last' or 'rank:K'"
                    ))
                }),
        }
    }
}

impl TryFrom<String> for LoadTarget {
    type Error = RunnerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LoadTarget> for String {
    fn from(target: LoadTarget) -> Self {
        target.to_string()
    }
}

/// Where and when a checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub run_id: String,
    pub stage: String,
    pub epoch: usize,
    pub global_batch_step: u64,
    pub loader_key: String,
    pub metric_key: String,
    pub metric_value: f64,
    /// Rank at save time. The manifest holds the current rank.
    pub rank: Option<usize>,
    pub created_at: DateTime<Utc>,
}

/// Resolvable state of the stage components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub model: StateDict,
    #[serde(default)]
    pub optimizer: Option<OptimizerState>,
    #[serde(default)]
    pub scheduler: Option<SchedulerState>,
    #[serde(default)]
    pub engine: Option<EngineState>,
}

impl CheckpointPayload {
    /// SHA-256 of the canonical JSON encoding.
    pub fn checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

/// One checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub checksum: String,
    pub payload: CheckpointPayload,
}

impl Checkpoint {
    pub fn new(metadata: CheckpointMetadata, payload: CheckpointPayload) -> Result<Self> {
        Ok(Self {
            checksum: payload.checksum()?,
            metadata,
            payload,
        })
    }

    fn verify(&self, file: &str) -> Result<()> {
        if self.payload.checksum()? != self.checksum {
            return Err(RunnerError::state_not_found(format!(
                "checkpoint '{file}' failed checksum verification"
            )));
        }
        Ok(())
    }
}

/// A retained entry of the best-N set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub stage: String,
    pub epoch: usize,
    pub metric_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub metric_key: String,
    pub minimize: bool,
    /// Best first.
    pub entries: Vec<ManifestEntry>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestPointer {
    pub file: String,
    pub stage: String,
    pub epoch: usize,
    pub metric_value: f64,
}

/// What a save did to the best-N set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    /// 1-based rank of the new entry, if it was retained.
    pub rank: Option<usize>,
    pub is_best: bool,
    pub evicted: Vec<String>,
}

impl SaveOutcome {
    pub fn accepted(&self) -> bool {
        self.rank.is_some()
    }
}

/// Persists and restores checkpoints, keeping the best `save_n_best` by one metric.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    save_n_best: usize,
    minimize: bool,
}

impl CheckpointManager {
    pub fn new(logdir: impl AsRef<Path>, save_n_best: usize, minimize: bool) -> Result<Self> {
        if save_n_best == 0 {
            return Err(RunnerError::configuration("save_n_best must be at least 1"));
        }
        Ok(Self {
            dir: logdir.as_ref().join(CHECKPOINT_DIR),
            save_n_best,
            minimize,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_n_best(&self) -> usize {
        self.save_n_best
    }

    /// Whether `a` ranks strictly ahead of `b`.
    pub fn is_better(&self, a: f64, b: f64) -> bool {
        if self.minimize { a < b } else { a > b }
    }

    pub fn manifest(&self) -> Result<Option<Manifest>> {
        load_json(&self.dir.join(MANIFEST_FILE)).map_err(|e| {
            RunnerError::state_not_found(format!("checkpoint manifest unreadable: {e}"))
        })
    }

    pub fn has_manifest(&self) -> bool {
        self.dir.join(MANIFEST_FILE).exists()
    }

    /// Retained entries, best first.
    pub fn entries(&self) -> Result<Vec<ManifestEntry>> {
        Ok(self.manifest()?.map(|m| m.entries).unwrap_or_default())
    }

    pub fn best_pointer(&self) -> Result<Option<BestPointer>> {
        load_json(&self.dir.join(BEST_FILE)).map_err(|e| {
            RunnerError::state_not_found(format!("best pointer unreadable: {e}"))
        })
    }

    /// Offer a checkpoint to the best-N set.
    ///
    /// The value is retained if fewer than `save_n_best` entries exist or it beats
    /// the worst one; the best pointer moves only when it ranks first.
    pub fn save(&self, metadata: CheckpointMetadata, payload: CheckpointPayload) -> Result<SaveOutcome> {
        let value = metadata.metric_value;
        if !value.is_finite() {
            debug!(value, "Non-finite metric, checkpoint not ranked");
            return Ok(SaveOutcome::default());
        }
        let mut manifest = self.manifest()?.unwrap_or_else(|| Manifest {
            metric_key: metadata.metric_key.clone(),
            minimize: self.minimize,
            entries: Vec::new(),
            updated_at: Utc::now(),
        });
        if manifest.metric_key != metadata.metric_key || manifest.minimize != self.minimize {
            return Err(RunnerError::configuration(format!(
                "checkpoint store at {} ranks by '{}' (minimize={}), not '{}' (minimize={})",
                self.dir.display(),
                manifest.metric_key,
                manifest.minimize,
                metadata.metric_key,
                self.minimize
            )));
        }

        let file = entry_file_name(&metadata.stage, metadata.epoch);
        manifest.entries.retain(|e| e.file != file);

        let qualifies = manifest.entries.len() < self.save_n_best
            || manifest
                .entries
                .last()
                .is_some_and(|worst| self.is_better(value, worst.metric_value));
        if !qualifies {
            return Ok(SaveOutcome::default());
        }

        let position = manifest
            .entries
            .iter()
            .position(|e| self.is_better(value, e.metric_value))
            .unwrap_or(manifest.entries.len());
        manifest.entries.insert(
            position,
            ManifestEntry {
                file: file.clone(),
                stage: metadata.stage.clone(),
                epoch: metadata.epoch,
                metric_value: value,
            },
        );
        let evicted: Vec<String> = if manifest.entries.len() > self.save_n_best {
            manifest
                .entries
                .split_off(self.save_n_best)
                .into_iter()
                .map(|e| e.file)
                .collect()
        } else {
            Vec::new()
        };
        let rank = position + 1;
        manifest.updated_at = Utc::now();

        let checkpoint = Checkpoint::new(
            CheckpointMetadata {
                rank: Some(rank),
                ..metadata
            },
            payload,
        )?;
        atomic_write_json(&self.dir.join(&file), &checkpoint).map_err(persistence)?;
        atomic_write_json(&self.dir.join(MANIFEST_FILE), &manifest).map_err(persistence)?;

        let is_best = rank == 1;
        if is_best {
            let pointer = BestPointer {
                file: file.clone(),
                stage: checkpoint.metadata.stage.clone(),
                epoch: checkpoint.metadata.epoch,
                metric_value: value,
            };
            atomic_write_json(&self.dir.join(BEST_FILE), &pointer).map_err(persistence)?;
        }
        for old in evicted.iter().filter(|old| **old != file) {
            remove_if_exists(&self.dir.join(old)).map_err(persistence)?;
        }

        info!(
            file = %file,
            rank,
            value,
            is_best,
            evicted = evicted.len(),
            "Checkpoint saved"
        );
        Ok(SaveOutcome {
            rank: Some(rank),
            is_best,
            evicted,
        })
    }

    /// Overwrite `last.json` with a full checkpoint.
    pub fn save_last(&self, metadata: CheckpointMetadata, payload: CheckpointPayload) -> Result<()> {
        let checkpoint = Checkpoint::new(CheckpointMetadata { rank: None, ..metadata }, payload)?;
        atomic_write_json(&self.dir.join(LAST_FILE), &checkpoint).map_err(persistence)?;
        debug!(dir = %self.dir.display(), "Last checkpoint saved");
        Ok(())
    }

    /// Resolve `target` and read its verified checkpoint.
    pub fn load(&self, target: LoadTarget) -> Result<Checkpoint> {
        let file = match target {
            LoadTarget::Last => LAST_FILE.to_string(),
            LoadTarget::Best | LoadTarget::Rank(_) => {
                let rank = match target {
                    LoadTarget::Rank(k) => k,
                    _ => 1,
                };
                let entries = self.entries()?;
                entries
                    .get(rank.saturating_sub(1))
                    .map(|e| e.file.clone())
                    .ok_or_else(|| {
                        RunnerError::state_not_found(format!(
                            "no checkpoint at {target} in {} ({} retained)",
                            self.dir.display(),
                            entries.len()
                        ))
                    })?
            }
        };
        self.load_file(&file)
    }

    fn load_file(&self, file: &str) -> Result<Checkpoint> {
        let checkpoint: Checkpoint = load_json(&self.dir.join(file))
            .map_err(|e| {
                RunnerError::state_not_found(format!("checkpoint '{file}' is corrupt: {e}"))
            })?
            .ok_or_else(|| RunnerError::state_not_found(format!("checkpoint '{file}' is missing")))?;
        checkpoint.verify(file)?;
        debug!(file, epoch = checkpoint.metadata.epoch, "Checkpoint loaded");
        Ok(checkpoint)
    }
}

fn entry_file_name(stage: &str, epoch: usize) -> String {
    let stage: String = stage
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{stage}.{epoch}.json")
}

fn persistence(e: io::Error) -> RunnerError {
    RunnerError::persistence(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use tempfile::TempDir;

    fn metadata(epoch: usize, value: f64) -> CheckpointMetadata {
        CheckpointMetadata {
            run_id: "run".into(),
            stage: "train".into(),
            epoch,
            global_batch_step: epoch as u64 * 10,
            loader_key: "valid".into(),
            metric_key: "loss".into(),
            metric_value: value,
            rank: None,
            created_at: Utc::now(),
        }
    }

    fn payload(fill: f32) -> CheckpointPayload {
        CheckpointPayload {
            model: StateDict::from([(
                "weight".to_string(),
                Tensor::from_vec(vec![2], vec![fill, -fill]).unwrap(),
            )]),
            optimizer: None,
            scheduler: None,
            engine: None,
        }
    }

    #[test]
    fn test_load_target_parsing() {
        assert_eq!("best".parse::<LoadTarget>().unwrap(), LoadTarget::Best);
        assert_eq!("rank:2".parse::<LoadTarget>().unwrap(), LoadTarget::Rank(2));
        assert!("rank:0".parse::<LoadTarget>().is_err());
        assert!("latest".parse::<LoadTarget>().is_err());
    }

    #[test]
    fn test_keeps_best_n_sorted() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointManager::new(dir.path(), 2, true).unwrap();
        for (epoch, value) in [(1, 0.5), (2, 0.7), (3, 0.3), (4, 0.9)] {
            store.save(metadata(epoch, value), payload(value as f32)).unwrap();
        }
        let values: Vec<f64> = store.entries().unwrap().iter().map(|e| e.metric_value).collect();
        assert_eq!(values, vec![0.3, 0.5]);
        assert!(!store.dir().join("train.2.json").exists());
        assert_eq!(store.best_pointer().unwrap().unwrap().file, "train.3.json");
    }

    #[test]
    fn test_non_qualifying_value_is_not_written() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointManager::new(dir.path(), 1, false).unwrap();
        assert!(store.save(metadata(1, 0.8), payload(1.0)).unwrap().is_best);
        let outcome = store.save(metadata(2, 0.4), payload(2.0)).unwrap();
        assert!(!outcome.accepted());
        assert!(!store.dir().join("train.2.json").exists());
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointManager::new(dir.path(), 1, true).unwrap();
        store.save(metadata(1, 0.5), payload(1.0)).unwrap();

        let path = store.dir().join("train.1.json");
        let mut checkpoint: Checkpoint = load_json(&path).unwrap().unwrap();
        checkpoint.payload = payload(2.0);
        atomic_write_json(&path, &checkpoint).unwrap();

        let err = store.load(LoadTarget::Best).unwrap_err();
        assert!(matches!(err, RunnerError::StateNotFound(_)));
    }

    #[test]
    fn test_missing_targets_are_state_not_found() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointManager::new(dir.path(), 3, true).unwrap();
        assert!(matches!(store.load(LoadTarget::Best), Err(RunnerError::StateNotFound(_))));
        assert!(matches!(store.load(LoadTarget::Last), Err(RunnerError::StateNotFound(_))));
        store.save(metadata(1, 0.5), payload(1.0)).unwrap();
        assert!(matches!(store.load(LoadTarget::Rank(2)), Err(RunnerError::StateNotFound(_))));
    }

    #[test]
    fn test_unreferenced_file_is_never_restored() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointManager::new(dir.path(), 3, true).unwrap();
        // An entry file written before a crash, without its manifest update.
        let orphan = Checkpoint::new(metadata(7, 0.01), payload(7.0)).unwrap();
        atomic_write_json(&store.dir().join("train.7.json"), &orphan).unwrap();
        store.save(metadata(1, 0.5), payload(1.0)).unwrap();

        let best = store.load(LoadTarget::Best).unwrap();
        assert_eq!(best.metadata.epoch, 1);
    }

    #[test]
    fn test_mismatched_metric_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        CheckpointManager::new(dir.path(), 3, true)
            .unwrap()
            .save(metadata(1, 0.5), payload(1.0))
            .unwrap();
        let other = CheckpointManager::new(dir.path(), 3, false).unwrap();
        assert!(matches!(
            other.save(metadata(2, 0.5), payload(1.0)),
            Err(RunnerError::Configuration(_))
        ));
    }
}
