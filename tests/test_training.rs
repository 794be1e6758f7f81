use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rust_operator::callback::{Callback, EpochLogs};
use rust_operator::dataset::{Dataset, GeneratedDataset, InMemoryDataset, SineBenchmark, TrainingExample};
use rust_operator::function::{FunctionSet, PointCloud};
use rust_operator::loss::{dataset_loss, Derivatives, Objective};
use rust_operator::operator::{DeepOnet, DeepOnetConfig, FourierLayer, FourierLayerConfig, Operator};
use rust_operator::optim::OptimizerConfig;
use rust_operator::tensor::RcTensor;
use rust_operator::trainer::{
    FitReport, LrSchedule, StepRecord, StopReason, Trainer, TrainerConfig, TrainerState, TrainerStateDict,
};
use rust_operator::OperatorError;

const SENSORS: usize = 20;

fn sine_data(functions: usize, seed: u64) -> InMemoryDataset<f64> {
    sine_data_with_sensors(functions, SENSORS, seed)
}

fn sine_data_with_sensors(functions: usize, sensors: usize, seed: u64) -> InMemoryDataset<f64> {
    let bench = SineBenchmark {
        num_functions: functions,
        num_sensors: sensors,
        num_evaluations: 5,
        ..SineBenchmark::default()
    };
    bench.generate(&mut StdRng::seed_from_u64(seed)).unwrap()
}

fn deeponet(seed: u64) -> Box<dyn Operator<f64>> {
    let config = DeepOnetConfig::new(SENSORS, 1, 1, 1)
        .with_branch(20, 2)
        .with_trunk(20, 2)
        .with_basis_functions(8);
    Box::new(DeepOnet::new(config, &mut StdRng::seed_from_u64(seed)).unwrap())
}

fn config(max_epochs: usize) -> TrainerConfig {
    TrainerConfig {
        learning_rate: 3e-3,
        batch_size: 10,
        max_epochs,
        tolerance: 0.0,
        lr_schedule: LrSchedule::Constant,
        ..TrainerConfig::default()
    }
}

#[test]
fn test_held_out_error_drops_after_100_steps() {
    let train = sine_data(10, 1);
    let held_out = sine_data(10, 2);
    let objective = Objective::data();

    // one batch per epoch, so 100 epochs are 100 steps
    let mut trainer = Trainer::new(deeponet(0), config(100)).unwrap();
    let before = dataset_loss(&held_out, trainer.operator(), &objective, 10).unwrap();
    let report = trainer.fit(&train, None).unwrap();
    let after = dataset_loss(&held_out, trainer.operator(), &objective, 10).unwrap();

    assert_eq!(report.steps, 100);
    assert_eq!(report.reason, StopReason::MaxEpochs);
    assert_eq!(
        trainer.state(),
        TrainerState::Converged {
            reason: StopReason::MaxEpochs,
            partial: false
        }
    );
    assert!(after < before, "held-out mse went from {before} to {after}");
}

#[test]
fn test_step_records_reach_the_sink() {
    let (sender, receiver) = channel::unbounded();
    let mut trainer = Trainer::new(deeponet(1), config(3)).unwrap().with_sink(sender);
    trainer.fit(&sine_data(20, 3), None).unwrap();
    let records: Vec<_> = receiver.try_iter().collect();
    assert_eq!(records.len(), 6);
    assert_eq!(records[0].step, 1);
    assert_eq!(records[5].epoch, 2);
    assert!(records.iter().all(|r| r.loss.is_finite() && r.residual_loss.is_none()));
}

#[test]
fn test_cancellation_stops_with_partial_result() {
    let mut trainer = Trainer::new(deeponet(2), config(50)).unwrap();
    trainer.cancel_flag().store(true, Ordering::SeqCst);
    let report = trainer.fit(&sine_data(10, 4), None).unwrap();
    assert_eq!(report.reason, StopReason::Cancelled);
    assert_eq!(report.steps, 0);
    assert_eq!(
        trainer.state(),
        TrainerState::Converged {
            reason: StopReason::Cancelled,
            partial: true
        }
    );
}

#[test]
fn test_tolerance_uses_test_loss() {
    let mut trainer = Trainer::new(
        deeponet(3),
        TrainerConfig {
            tolerance: 1e9,
            ..config(50)
        },
    )
    .unwrap();
    let test = sine_data(5, 6);
    let report = trainer.fit(&sine_data(10, 5), Some(&test as &dyn Dataset<f64>)).unwrap();
    assert_eq!(report.reason, StopReason::Tolerance);
    assert_eq!(report.epochs, 1);
    assert!(report.test_loss.is_some());
}

#[test]
fn test_plateau_stops_training() {
    let mut trainer = Trainer::new(
        deeponet(4),
        TrainerConfig {
            learning_rate: 1e-12,
            optimizer: OptimizerConfig::Sgd { momentum: 0.0 },
            plateau_patience: Some(2),
            plateau_min_delta: 1e-3,
            shuffle: false,
            ..config(50)
        },
    )
    .unwrap();
    let report = trainer.fit(&sine_data(10, 7), None).unwrap();
    assert_eq!(report.reason, StopReason::Plateau);
    assert_eq!(report.epochs, 3);
}

#[test]
fn test_non_finite_loss_fails_and_keeps_parameters() {
    let points = PointCloud::linspace(-1.0, 1.0, SENSORS, 1).unwrap();
    let input = FunctionSet::new(points.clone(), points.coordinates().clone()).unwrap();
    let target_points = PointCloud::linspace(-0.5, 0.5, 5, 1).unwrap();
    let target = FunctionSet::new(target_points, RcTensor::new(vec![f64::NAN; 5], vec![5, 1])).unwrap();
    let data = InMemoryDataset::new(vec![TrainingExample::new(input, target).unwrap()]).unwrap();

    let mut trainer = Trainer::new(deeponet(5), config(5)).unwrap();
    let before = trainer.operator().state_dict();
    let err = trainer.fit(&data, None).unwrap_err();
    assert!(matches!(err, OperatorError::NumericFailure { step: 1, .. }));
    assert!(matches!(trainer.state(), TrainerState::Failed { step: 1, .. }));
    assert_eq!(trainer.operator().state_dict(), before);
    assert_eq!(trainer.step(), 0);

    // never retried
    assert!(matches!(
        trainer.fit(&data, None),
        Err(OperatorError::NumericFailure { .. })
    ));
}

#[test]
fn test_trainer_state_dict_resumes() {
    let data = sine_data(10, 8);
    let mut trainer = Trainer::new(deeponet(6), config(4)).unwrap();
    trainer.fit(&data, None).unwrap();
    let saved = trainer.state_dict();
    let json = serde_json::to_string(&saved).unwrap();

    let parsed: TrainerStateDict = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.step, 4);
    assert_eq!(parsed.operator.tensors.len(), saved.operator.tensors.len());

    let mut restored = Trainer::new(deeponet(7), config(1)).unwrap();
    restored.load_state_dict(&saved).unwrap();
    assert_eq!(restored.epoch(), 4);
    assert_eq!(restored.step(), 4);
    assert_eq!(restored.state(), TrainerState::Initialized);
    assert_eq!(restored.state_dict(), saved);
}

#[test]
fn test_physics_residual_is_trained() {
    // u'' + u = 0 holds for every scaled sine
    let mut trainer = Trainer::new(deeponet(8), config(3))
        .unwrap()
        .with_physics(Box::new(|d: &Derivatives<f64>| &d.second[0] + &d.value));
    let (sender, receiver) = channel::unbounded();
    trainer = trainer.with_sink(sender);
    trainer.fit(&sine_data(10, 9), None).unwrap();
    let records: Vec<_> = receiver.try_iter().collect();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.residual_loss.map_or(false, |loss| loss.is_finite())));
    assert!(records.iter().all(|r| r.loss >= r.data_loss));
}

#[test]
fn test_unbounded_dataset_needs_steps_per_epoch() {
    let template = sine_data(1, 10);
    let example = template.examples()[0].clone();
    let stream = GeneratedDataset::new(0, Box::new(move |_rng: &mut StdRng| example.clone()));

    let mut trainer = Trainer::new(deeponet(9), config(2)).unwrap();
    assert!(matches!(
        trainer.fit(&stream, None),
        Err(OperatorError::InvalidConfig(_))
    ));

    let mut trainer = Trainer::new(
        deeponet(9),
        TrainerConfig {
            steps_per_epoch: Some(3),
            batch_size: 2,
            ..config(2)
        },
    )
    .unwrap();
    let report = trainer.fit(&stream, None).unwrap();
    assert_eq!(report.steps, 6);
}

#[test]
fn test_fit_errors_restore_the_previous_state() {
    let mut trainer = Trainer::new(deeponet(10), config(3)).unwrap();
    let wrong_sensors = sine_data_with_sensors(4, 12, 11);
    assert!(matches!(
        trainer.fit(&wrong_sensors, None),
        Err(OperatorError::Shape(_))
    ));
    assert_eq!(trainer.state(), TrainerState::Initialized);

    let empty = InMemoryDataset::<f64>::new(vec![]).unwrap();
    assert!(matches!(
        trainer.fit(&empty, None),
        Err(OperatorError::InvalidConfig(_))
    ));
    assert_eq!(trainer.state(), TrainerState::Initialized);

    // the test set is only evaluated after the first epoch ran
    let train = sine_data(10, 12);
    assert!(trainer
        .fit(&train, Some(&wrong_sensors as &dyn Dataset<f64>))
        .is_err());
    assert_eq!(trainer.state(), TrainerState::Initialized);

    let report = trainer.fit(&train, None).unwrap();
    assert_eq!(report.reason, StopReason::MaxEpochs);
}

/// Raises the cancel flag once `steps` steps are done.
struct CancelAfter {
    flag: Arc<AtomicBool>,
    steps: usize,
}

impl Callback for CancelAfter {
    fn on_step(&mut self, record: &StepRecord) {
        if record.step == self.steps {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_cancellation_between_steps_keeps_finished_work() {
    let trainer = Trainer::new(deeponet(11), config(50)).unwrap();
    let flag = trainer.cancel_flag();
    let (sender, receiver) = channel::unbounded();
    let mut trainer = trainer
        .with_sink(sender)
        .with_callback(Box::new(CancelAfter { flag, steps: 3 }));

    // two steps per epoch, so the flag goes up inside the second epoch
    let report = trainer.fit(&sine_data(20, 13), None).unwrap();
    assert_eq!(report.reason, StopReason::Cancelled);
    assert_eq!(report.steps, 3);
    assert_eq!(report.epochs, 1);
    assert_eq!(trainer.step(), 3);
    assert_eq!(
        trainer.state(),
        TrainerState::Converged {
            reason: StopReason::Cancelled,
            partial: true
        }
    );
    assert_eq!(receiver.try_iter().count(), 3);
}

#[derive(Clone, Default)]
struct Events(Rc<RefCell<Vec<String>>>);

impl Callback for Events {
    fn on_train_begin(&mut self, num_params: usize) {
        self.0.borrow_mut().push(format!("begin {num_params}"));
    }

    fn on_step(&mut self, record: &StepRecord) {
        self.0.borrow_mut().push(format!("step {}", record.step));
    }

    fn on_epoch_end(&mut self, logs: &EpochLogs) {
        assert!(logs.train_loss.is_finite());
        self.0.borrow_mut().push(format!("epoch {}", logs.epoch));
    }

    fn on_train_end(&mut self, report: &FitReport) {
        self.0.borrow_mut().push(format!("end {:?}", report.reason));
    }
}

#[test]
fn test_callbacks_see_every_hook_in_order() {
    let events = Events::default();
    let operator = deeponet(12);
    let num_params = operator.num_params();
    let mut trainer = Trainer::new(operator, config(2))
        .unwrap()
        .with_callback(Box::new(events.clone()));
    trainer.fit(&sine_data(20, 14), None).unwrap();
    let expected = vec![
        format!("begin {num_params}"),
        "step 1".to_string(),
        "step 2".to_string(),
        "epoch 1".to_string(),
        "step 3".to_string(),
        "step 4".to_string(),
        "epoch 2".to_string(),
        "end MaxEpochs".to_string(),
    ];
    assert_eq!(*events.0.borrow(), expected);
}

#[test]
fn test_rejected_state_dict_changes_nothing() {
    let mut trained = Trainer::new(deeponet(13), config(2)).unwrap();
    trained.fit(&sine_data(10, 15), None).unwrap();
    let good = trained.state_dict();

    let mut fresh = Trainer::new(deeponet(14), config(2)).unwrap();
    let before = fresh.state_dict();

    let mut short_buffer = good.clone();
    short_buffer.optimizer.buffers[0].pop();
    assert!(matches!(
        fresh.load_state_dict(&short_buffer),
        Err(OperatorError::Shape(_))
    ));
    assert_eq!(fresh.state_dict(), before);

    // adam statistics can not be loaded into sgd, the operator must stay as it was
    let mut other_optimizer = good.clone();
    other_optimizer.config.optimizer = OptimizerConfig::Sgd { momentum: 0.0 };
    assert!(matches!(
        fresh.load_state_dict(&other_optimizer),
        Err(OperatorError::InvalidConfig(_))
    ));
    assert_eq!(fresh.state_dict(), before);

    fresh.load_state_dict(&good).unwrap();
    assert_eq!(fresh.state_dict(), good);
}

#[test]
fn test_dataset_loss_does_not_depend_on_batching() {
    let data = sine_data(3, 16);
    let operator = deeponet(15);
    let objective = Objective::data();
    let per_example = dataset_loss(&data, operator.as_ref(), &objective, 1).unwrap();
    for batch_size in [2, 3, 5] {
        let batched = dataset_loss(&data, operator.as_ref(), &objective, batch_size).unwrap();
        assert!(
            (batched - per_example).abs() < 1e-12 * per_example.max(1.0),
            "batch size {batch_size}: {batched} vs {per_example}"
        );
    }
}

#[test]
fn test_fourier_layer_fits_the_identity_on_sine() {
    // sin sampled on 32 periodic grid points, target at 100 others
    let grid = |n: usize| -> Vec<Vec<f64>> { (0..n).map(|j| vec![2.0 * PI * j as f64 / n as f64]).collect() };
    let sine = |points: &[Vec<f64>]| -> Vec<Vec<f64>> { points.iter().map(|x| vec![x[0].sin()]).collect() };
    let (x, y) = (grid(32), grid(100));
    let input = FunctionSet::from_samples(vec![x.clone()], vec![sine(&x[..])]).unwrap();
    let target = FunctionSet::from_samples(vec![y.clone()], vec![sine(&y[..])]).unwrap();
    let data = InMemoryDataset::new(vec![TrainingExample::new(input, target).unwrap()]).unwrap();

    let layer: FourierLayer<f64> =
        FourierLayer::new(FourierLayerConfig::new(1, 1, 1).with_modes(4), &mut StdRng::seed_from_u64(16)).unwrap();
    let mut trainer = Trainer::new(
        Box::new(layer),
        TrainerConfig {
            learning_rate: 5e-2,
            ..config(300)
        },
    )
    .unwrap();
    let before = dataset_loss(&data, trainer.operator(), &Objective::data(), 1).unwrap();
    let report = trainer.fit(&data, None).unwrap();
    let after = report.train_loss.unwrap();
    assert!(after < 0.1 * before, "mse went from {before} to {after}");
}
