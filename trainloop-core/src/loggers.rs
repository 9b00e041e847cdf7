//! Metric sinks.
//!
//! The runner reports metrics at batch, loader, epoch and stage boundaries to a
//! [`LoggerSet`]. Sinks are isolated from each other: a failing sink is reported
//! with `warn!` and the remaining sinks still receive the call.

use crate::error::Result;
use crate::metrics::Metrics;
use crate::state::RunState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Granularity of a metrics report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogScope {
    Batch,
    Loader,
    Epoch,
    Stage,
}

impl fmt::Display for LogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogScope::Batch => "batch",
            LogScope::Loader => "loader",
            LogScope::Epoch => "epoch",
            LogScope::Stage => "stage",
        };
        f.write_str(name)
    }
}

/// A metrics sink.
pub trait Logger: Send {
    fn name(&self) -> &str;

    fn log_metrics(&mut self, scope: LogScope, metrics: &Metrics, state: &RunState) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// All sinks of a run.
#[derive(Default)]
pub struct LoggerSet {
    loggers: Vec<Box<dyn Logger>>,
}

impl LoggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, logger: impl Logger + 'static) {
        self.loggers.push(Box::new(logger));
    }

    pub fn add_boxed(&mut self, logger: Box<dyn Logger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }

    /// Report to every sink. Returns the number of sinks that failed.
    pub fn log_metrics(&mut self, scope: LogScope, metrics: &Metrics, state: &RunState) -> usize {
        let mut failures = 0;
        for logger in &mut self.loggers {
            if let Err(e) = logger.log_metrics(scope, metrics, state) {
                failures += 1;
                warn!(logger = logger.name(), %scope, error = %e, "Logger failed");
            }
        }
        failures
    }

    pub fn flush(&mut self) -> usize {
        let mut failures = 0;
        for logger in &mut self.loggers {
            if let Err(e) = logger.flush() {
                failures += 1;
                warn!(logger = logger.name(), error = %e, "Logger flush failed");
            }
        }
        failures
    }
}

impl fmt::Debug for LoggerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.loggers.iter().map(|l| l.name()))
            .finish()
    }
}

fn format_metrics(metrics: &Metrics) -> String {
    metrics
        .iter()
        .map(|(k, v)| format!("{k}={v:.6}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Emits metrics as `tracing` events. Batch-level reports go to `debug`.
#[derive(Debug, Clone, Default)]
pub struct ConsoleLogger {
    pub log_batch: bool,
}

impl ConsoleLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Logger for ConsoleLogger {
    fn name(&self) -> &str {
        "console"
    }

    fn log_metrics(&mut self, scope: LogScope, metrics: &Metrics, state: &RunState) -> Result<()> {
        let line = format_metrics(metrics);
        match scope {
            LogScope::Batch => {
                if self.log_batch {
                    debug!(
                        stage = %state.stage_key,
                        epoch = state.epoch,
                        loader = %state.loader_key,
                        step = state.global_batch_step,
                        "{line}"
                    );
                }
            }
            LogScope::Loader => info!(
                stage = %state.stage_key,
                epoch = state.epoch,
                loader = %state.loader_key,
                "{line}"
            ),
            LogScope::Epoch | LogScope::Stage => info!(
                stage = %state.stage_key,
                epoch = state.epoch,
                %scope,
                "{line}"
            ),
        }
        Ok(())
    }
}

/// Appends loader-level metrics to `<logdir>/logs/<loader>.csv`.
///
/// Columns are fixed by the first row written to each file.
#[derive(Debug)]
pub struct CsvLogger {
    dir: PathBuf,
    files: HashMap<String, (BufWriter<File>, Vec<String>)>,
}

impl CsvLogger {
    pub fn new(logdir: impl AsRef<Path>) -> Self {
        Self {
            dir: logdir.as_ref().join("logs"),
            files: HashMap::new(),
        }
    }

    pub fn path_for(&self, loader_key: &str) -> PathBuf {
        self.dir.join(format!("{loader_key}.csv"))
    }

    fn open(&self, loader_key: &str, metrics: &Metrics) -> Result<(BufWriter<File>, Vec<String>)> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(loader_key);
        let is_new = !path.exists() || fs::metadata(&path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        let columns: Vec<String> = metrics.keys().cloned().collect();
        if is_new {
            let header: Vec<String> = ["stage", "epoch", "step"]
                .into_iter()
                .map(String::from)
                .chain(columns.iter().map(|c| csv_field(c)))
                .collect();
            writeln!(writer, "{}", header.join(","))?;
        }
        Ok((writer, columns))
    }
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

impl Logger for CsvLogger {
    fn name(&self) -> &str {
        "csv"
    }

    fn log_metrics(&mut self, scope: LogScope, metrics: &Metrics, state: &RunState) -> Result<()> {
        if scope != LogScope::Loader {
            return Ok(());
        }
        if !self.files.contains_key(&state.loader_key) {
            let opened = self.open(&state.loader_key, metrics)?;
            self.files.insert(state.loader_key.clone(), opened);
        }
        if let Some((writer, columns)) = self.files.get_mut(&state.loader_key) {
            let mut row = vec![
                csv_field(&state.stage_key),
                state.epoch.to_string(),
                state.global_batch_step.to_string(),
            ];
            row.extend(
                columns
                    .iter()
                    .map(|c| metrics.get(c).map(|v| v.to_string()).unwrap_or_default()),
            );
            writeln!(writer, "{}", row.join(","))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for (writer, _) in self.files.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunnerError;
    use tempfile::TempDir;

    struct Broken;

    impl Logger for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn log_metrics(&mut self, _: LogScope, _: &Metrics, _: &RunState) -> Result<()> {
            Err(RunnerError::persistence("sink unavailable"))
        }
    }

    #[derive(Default)]
    struct Counting(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl Logger for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn log_metrics(&mut self, _: LogScope, _: &Metrics, _: &RunState) -> Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let counter = Counting::default();
        let calls = std::sync::Arc::clone(&counter.0);
        let mut set = LoggerSet::new();
        set.add(Broken);
        set.add(counter);
        let failures = set.log_metrics(LogScope::Loader, &Metrics::new(), &RunState::default());
        assert_eq!(failures, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_csv_logger_writes_header_once() {
        let dir = TempDir::new().unwrap();
        let mut logger = CsvLogger::new(dir.path());
        let mut state = RunState::new("run");
        state.stage_key = "train".into();
        state.loader_key = "valid".into();
        for epoch in 1..=2 {
            state.epoch = epoch;
            let metrics = Metrics::from([("loss".to_string(), 0.5 / epoch as f64)]);
            logger.log_metrics(LogScope::Loader, &metrics, &state).unwrap();
            logger.log_metrics(LogScope::Batch, &metrics, &state).unwrap();
        }
        logger.flush().unwrap();

        let content = fs::read_to_string(logger.path_for("valid")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["stage,epoch,step,loss", "train,1,0,0.5", "train,2,0,0.25"]);
    }
}
