//! Batches and loaders.
//!
//! A [`Loader`] is a finite, restartable sequence of batches exposed as a
//! `futures` stream; fetching the next batch is the runner's only suspension
//! point. Loaders for a stage are grouped in a [`LoaderSet`] that preserves
//! declaration order.

use crate::device::Device;
use crate::error::{Result, RunnerError};
use crate::tensor::Tensor;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::BTreeMap;

/// Loader key that enables gradient updates.
pub const TRAIN_LOADER: &str = "train";

/// A named mapping of tensors produced by a loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    tensors: BTreeMap<String, Tensor>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(key, tensor);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key.into(), tensor)
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Like [`Batch::get`], but a missing key is a data error.
    pub fn require(&self, key: &str) -> Result<&Tensor> {
        self.tensors
            .get(key)
            .ok_or_else(|| RunnerError::data(format!("batch has no '{key}' entry")))
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.tensors.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Number of samples, taken from the leading dimension of the first tensor.
    pub fn batch_size(&self) -> usize {
        self.tensors.values().next().map(Tensor::rows).unwrap_or(0)
    }

    pub fn into_device(self, device: Device) -> Self {
        Self {
            tensors: self
                .tensors
                .into_iter()
                .map(|(k, t)| (k, t.to_device(device)))
                .collect(),
        }
    }

    pub fn into_inner(self) -> BTreeMap<String, Tensor> {
        self.tensors
    }
}

impl From<BTreeMap<String, Tensor>> for Batch {
    fn from(tensors: BTreeMap<String, Tensor>) -> Self {
        Self { tensors }
    }
}

/// A finite, restartable source of batches.
pub trait Loader: Send + Sync {
    /// A fresh pass over the data, in the loader's own order.
    fn batches(&self) -> BoxStream<'_, Result<Batch>>;

    /// Number of batches per pass, when known up front.
    fn len(&self) -> Option<usize> {
        None
    }
}

/// In-memory dataset split into fixed-size batches.
#[derive(Debug, Clone)]
pub struct TensorLoader {
    columns: Vec<(String, Tensor)>,
    batch_size: usize,
    drop_last: bool,
}

impl TensorLoader {
    /// `features` and `targets` must have the same number of rows.
    pub fn new(features: Tensor, targets: Tensor, batch_size: usize) -> Result<Self> {
        Self::from_columns(
            vec![
                ("features".to_string(), features),
                ("targets".to_string(), targets),
            ],
            batch_size,
        )
    }

    pub fn from_columns(columns: Vec<(String, Tensor)>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(RunnerError::configuration("batch_size must be positive"));
        }
        let rows = columns.first().map(|(_, t)| t.rows()).unwrap_or(0);
        if let Some((key, t)) = columns.iter().find(|(_, t)| t.rows() != rows) {
            return Err(RunnerError::data(format!(
                "column '{key}' has {} rows, expected {rows}",
                t.rows()
            )));
        }
        Ok(Self {
            columns,
            batch_size,
            drop_last: false,
        })
    }

    /// Skip a trailing batch smaller than `batch_size`.
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn num_samples(&self) -> usize {
        self.columns.first().map(|(_, t)| t.rows()).unwrap_or(0)
    }

    fn num_batches(&self) -> usize {
        let n = self.num_samples();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    fn batch_at(&self, index: usize) -> Result<Batch> {
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.num_samples());
        let mut batch = Batch::new();
        for (key, column) in &self.columns {
            batch.insert(key.clone(), column.slice_rows(start, end)?);
        }
        Ok(batch)
    }
}

impl Loader for TensorLoader {
    fn batches(&self) -> BoxStream<'_, Result<Batch>> {
        stream::iter(0..self.num_batches())
            .map(move |i| self.batch_at(i))
            .boxed()
    }

    fn len(&self) -> Option<usize> {
        Some(self.num_batches())
    }
}

/// Loaders of one stage, in declaration order.
#[derive(Default)]
pub struct LoaderSet {
    loaders: Vec<(String, Box<dyn Loader>)>,
}

impl LoaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a loader. Keys must be unique within the set.
    pub fn insert(&mut self, key: impl Into<String>, loader: impl Loader + 'static) -> Result<()> {
        let key = key.into();
        if self.loaders.iter().any(|(k, _)| *k == key) {
            return Err(RunnerError::configuration(format!(
                "duplicate loader key '{key}'"
            )));
        }
        self.loaders.push((key, Box::new(loader)));
        Ok(())
    }

    pub fn with(mut self, key: impl Into<String>, loader: impl Loader + 'static) -> Result<Self> {
        self.insert(key, loader)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&dyn Loader> {
        self.loaders
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, l)| l.as_ref())
    }

    pub fn keys(&self) -> Vec<String> {
        self.loaders.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn Loader)> {
        self.loaders.iter().map(|(k, l)| (k.as_str(), l.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl std::fmt::Debug for LoaderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderSet").field("keys", &self.keys()).finish()
    }
}
