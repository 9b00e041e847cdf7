//! Integration tests for the stage/epoch/loader/batch loop.

mod common;

use common::{EventLog, Scripted};
use pretty_assertions::assert_eq;
use trainloop_core::callbacks::{Callback, CallbackList, CriterionCallback, OptimizerCallback};
use trainloop_core::error::ErrorKind;
use trainloop_core::{DeviceCapabilities, Hook, Result, RunContext, Runner, RunnerError};

fn runner(experiment: Scripted) -> Runner<Scripted> {
    Runner::new(experiment, DeviceCapabilities::cpu_only())
}

#[tokio::test]
async fn test_four_epochs_dispatch_every_hook_in_order() {
    let mut runner = runner(Scripted::new(vec![("train", 4)], vec![("train", 4)]));
    let summary = runner.run().await.unwrap();
    let exp = runner.experiment();

    assert_eq!(summary.global_batch_step, 8);
    assert_eq!(exp.count("stage:on_batch_start:train"), 8);
    assert_eq!(exp.count("stage:on_batch_end:train"), 8);
    assert_eq!(exp.count("run:on_loader_start:train"), 4);
    assert_eq!(exp.count("run:on_loader_end:train"), 4);
    assert_eq!(exp.count("run:on_epoch_end"), 4);
    assert_eq!(exp.count("run:on_experiment_start"), 1);
    assert_eq!(exp.count("run:on_experiment_end"), 1);

    let events = exp.events();
    assert_eq!(
        &events[..9],
        [
            "run:on_experiment_start",
            "run:on_stage_start",
            "stage:on_stage_start",
            "run:on_epoch_start",
            "stage:on_epoch_start",
            "run:on_loader_start:train",
            "stage:on_loader_start:train",
            "run:on_batch_start:train",
            "stage:on_batch_start:train",
        ]
    );
    assert_eq!(
        &events[events.len() - 3..],
        ["run:on_stage_end", "stage:on_stage_end", "run:on_experiment_end"]
    );
}

#[tokio::test]
async fn test_loaders_run_in_declaration_order_and_metrics_are_kept_per_loader() {
    let experiment = Scripted::new(vec![("fit", 1)], vec![("valid", 2), ("train", 4)])
        .trainable()
        .with_extra(|_, _| {
            CallbackList::new()
                .with("criterion", CriterionCallback::default())?
                .with("optimizer", OptimizerCallback::default())
        });
    let mut runner = runner(experiment);
    let summary = runner.run().await.unwrap();

    let loader_starts: Vec<String> = runner
        .experiment()
        .events()
        .into_iter()
        .filter(|e| e.starts_with("run:on_loader_start"))
        .collect();
    assert_eq!(
        loader_starts,
        ["run:on_loader_start:valid", "run:on_loader_start:train"]
    );

    let record = summary.history.last().unwrap();
    assert!(record.loaders["valid"].contains_key("loss"));
    assert!(!record.loaders["valid"].contains_key("lr"));
    assert!(record.loaders["train"].contains_key("lr"));
    assert_eq!(summary.engine.optimizer_steps, 2);
}

struct StopLoaderAfterFirst;

impl Callback for StopLoaderAfterFirst {
    fn on_batch_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        if ctx.state.is_train_loader && ctx.state.loader_batch_step == 1 {
            ctx.state.request_stop_loader();
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_stop_loader_ends_only_the_current_loader() {
    let experiment = Scripted::new(vec![("fit", 2)], vec![("train", 6), ("valid", 6)])
        .with_extra(|_, _| CallbackList::new().with("stopper", StopLoaderAfterFirst));
    let mut runner = runner(experiment);
    let summary = runner.run().await.unwrap();
    let exp = runner.experiment();

    assert_eq!(exp.count("run:on_batch_start:train"), 2);
    assert_eq!(exp.count("run:on_batch_start:valid"), 6);
    assert_eq!(exp.count("run:on_loader_end:train"), 2);
    assert_eq!(summary.stages[0].epochs_completed, 2);
    assert!(!summary.stages[0].stopped_early);
}

struct StopStageAfterTrain;

impl Callback for StopStageAfterTrain {
    fn on_loader_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        if ctx.state.is_train_loader {
            ctx.state.request_stop_stage();
        }
        Ok(())
    }
}

fn stop_first_stage(stage: &str, _: &EventLog) -> Result<CallbackList> {
    if stage == "warmup" {
        CallbackList::new().with("stopper", StopStageAfterTrain)
    } else {
        Ok(CallbackList::new())
    }
}

#[tokio::test]
async fn test_stop_stage_skips_remaining_loaders_and_epochs_but_not_later_stages() {
    let experiment = Scripted::new(
        vec![("warmup", 3), ("main", 1)],
        vec![("train", 4), ("valid", 2)],
    )
    .with_extra(stop_first_stage);
    let mut runner = runner(experiment);
    let summary = runner.run().await.unwrap();
    let exp = runner.experiment();

    let warmup = summary.stage("warmup").unwrap();
    assert_eq!(warmup.epochs_completed, 1);
    assert!(warmup.stopped_early);
    let main = summary.stage("main").unwrap();
    assert_eq!(main.epochs_completed, 1);
    assert!(!main.stopped_early);

    // valid ran once, in the second stage only
    assert_eq!(exp.count("run:on_loader_start:valid"), 1);
    // epoch end still fires for the interrupted epoch
    assert_eq!(exp.count("run:on_epoch_end"), 2);
    assert_eq!(summary.global_batch_step, 2 + 2 + 1);
}

struct StopRunOnFirstBatch;

impl Callback for StopRunOnFirstBatch {
    fn on_batch_end(&mut self, ctx: &mut RunContext) -> Result<()> {
        ctx.state.request_stop_run();
        Ok(())
    }
}

#[tokio::test]
async fn test_stop_run_finishes_the_epoch_then_skips_later_stages() {
    let experiment = Scripted::new(
        vec![("first", 3), ("second", 2)],
        vec![("train", 4), ("valid", 4)],
    )
    .with_extra(|_, _| CallbackList::new().with("stopper", StopRunOnFirstBatch));
    let mut runner = runner(experiment);
    let summary = runner.run().await.unwrap();
    let exp = runner.experiment();

    assert_eq!(summary.stages.len(), 1);
    assert_eq!(summary.stages[0].epochs_completed, 1);
    assert!(summary.stopped_early);
    assert_eq!(summary.global_batch_step, 4);
    assert_eq!(exp.count("run:on_stage_start"), 1);
    assert_eq!(exp.count("run:on_experiment_end"), 1);
}

struct FailOnEpochStart;

impl Callback for FailOnEpochStart {
    fn on_epoch_start(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Err(RunnerError::data("boom"))
    }
}

#[tokio::test]
async fn test_callback_failure_aborts_the_run_with_context() {
    let experiment = Scripted::new(vec![("fit", 2)], vec![("train", 2)])
        .with_extra(|_, _| CallbackList::new().with("faulty", FailOnEpochStart));
    let mut runner = runner(experiment);
    let err = runner.run().await.unwrap_err();

    match &err {
        RunnerError::Callback { callback, hook, .. } => {
            assert_eq!(callback, "faulty");
            assert_eq!(*hook, Hook::EpochStart);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Data);
    assert_eq!(runner.experiment().count("run:on_batch_start:train"), 0);
}

#[tokio::test]
async fn test_consumer_registered_before_producer_is_rejected() {
    let experiment = Scripted::new(vec![("fit", 1)], vec![("train", 2)])
        .trainable()
        .with_extra(|_, _| {
            CallbackList::new()
                .with("optimizer", OptimizerCallback::default())?
                .with("criterion", CriterionCallback::default())
        });
    let mut runner = runner(experiment);
    let err = runner.run().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(runner.experiment().count("run:on_stage_start"), 0);
}

#[tokio::test]
async fn test_zero_length_stage_is_a_configuration_error() {
    let mut runner = runner(Scripted::new(vec![("fit", 0)], vec![("train", 2)]));
    let err = runner.run().await.unwrap_err();
    assert!(matches!(err, RunnerError::Configuration(_)));
}

#[tokio::test]
async fn test_model_carries_over_between_stages() {
    let mut runner = runner(Scripted::new(
        vec![("a", 1), ("b", 1)],
        vec![("train", 2)],
    ));
    runner.run().await.unwrap();
    let model = runner.context().components.model().unwrap();
    assert_eq!(model.name(), "Linear");
    assert!(runner.context().components.optimizer.is_none());
}
