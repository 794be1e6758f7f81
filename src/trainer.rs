//! The optimization loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::callback::{Callback, EpochLogs};
use crate::checkpoint::StateDict;
use crate::dataset::{Dataset, TrainingExample};
use crate::error::{OperatorError, Result};
use crate::loss::{dataset_loss, LossWeights, Objective, PhysicsFn};
use crate::operator::Operator;
use crate::optim::{Optimizer, OptimizerConfig, OptimizerState};
use crate::tensor::{Float, RcTensor, TensorList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    Constant,
    /// Decays linearly from the configured rate to zero over `max_epochs`.
    #[default]
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Caps the steps of an epoch; required for unbounded datasets.
    pub steps_per_epoch: Option<usize>,
    /// Stop once the monitored epoch loss drops below this.
    pub tolerance: f64,
    /// Stop after this many epochs without an improvement of `plateau_min_delta`.
    pub plateau_patience: Option<usize>,
    pub plateau_min_delta: f64,
    pub seed: u64,
    pub shuffle: bool,
    pub optimizer: OptimizerConfig,
    pub lr_schedule: LrSchedule,
    pub loss_weights: LossWeights,
    pub finite_difference_step: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 32,
            max_epochs: 1000,
            steps_per_epoch: None,
            tolerance: 1e-5,
            plateau_patience: None,
            plateau_min_delta: 0.0,
            seed: 0,
            shuffle: true,
            optimizer: OptimizerConfig::default(),
            lr_schedule: LrSchedule::default(),
            loss_weights: LossWeights::default(),
            finite_difference_step: 1e-3,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OperatorError::InvalidConfig(msg));
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".to_string());
        }
        if self.max_epochs == 0 {
            return invalid("max_epochs must be positive".to_string());
        }
        if self.steps_per_epoch == Some(0) {
            return invalid("steps_per_epoch must be positive when set".to_string());
        }
        if self.plateau_patience == Some(0) {
            return invalid("plateau_patience must be positive when set".to_string());
        }
        if self.tolerance < 0.0 || self.plateau_min_delta < 0.0 {
            return invalid("tolerance and plateau_min_delta can not be negative".to_string());
        }
        if self.loss_weights.data < 0.0 || self.loss_weights.residual < 0.0 {
            return invalid(format!("loss weights can not be negative: {:?}", self.loss_weights));
        }
        if !(self.finite_difference_step > 0.0) {
            return invalid(format!(
                "finite_difference_step must be positive, got {}",
                self.finite_difference_step
            ));
        }
        self.optimizer.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxEpochs,
    Tolerance,
    Plateau,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainerState {
    Initialized,
    Running,
    /// `partial` marks a run that was cancelled before a regular stop.
    Converged { reason: StopReason, partial: bool },
    Failed { step: usize, loss: f64 },
}

/// Emitted after every successful optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub epoch: usize,
    pub step: usize,
    pub loss: f64,
    pub data_loss: f64,
    pub residual_loss: Option<f64>,
    pub learning_rate: f64,
    /// Wall clock since `fit` started.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub reason: StopReason,
    pub epochs: usize,
    pub steps: usize,
    pub train_loss: Option<f64>,
    pub test_loss: Option<f64>,
}

/// Everything needed to resume training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerStateDict {
    pub config: TrainerConfig,
    pub operator: StateDict,
    pub optimizer: OptimizerState,
    pub epoch: usize,
    pub step: usize,
}

pub struct Trainer<T: Float> {
    config: TrainerConfig,
    operator: Box<dyn Operator<T>>,
    optimizer: Box<dyn Optimizer<T>>,
    objective: Objective<T>,
    state: TrainerState,
    epoch: usize,
    step: usize,
    cancel: Arc<AtomicBool>,
    sink: Option<Sender<StepRecord>>,
    callbacks: Vec<Box<dyn Callback>>,
}

impl<T: Float> Trainer<T> {
    pub fn new(operator: Box<dyn Operator<T>>, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = config.optimizer.build(config.learning_rate);
        let objective = Objective::data()
            .with_weights(config.loss_weights)
            .with_step(config.finite_difference_step);
        Ok(Trainer {
            config,
            operator,
            optimizer,
            objective,
            state: TrainerState::Initialized,
            epoch: 0,
            step: 0,
            cancel: Arc::new(AtomicBool::new(false)),
            sink: None,
            callbacks: Vec::new(),
        })
    }

    /// Adds a physics residual to the data loss.
    pub fn with_physics(mut self, physics: PhysicsFn<T>) -> Self {
        self.objective = self.objective.with_physics(physics);
        self
    }

    /// Step records are also sent on `sink`.
    pub fn with_sink(mut self, sink: Sender<StepRecord>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_callback(mut self, callback: Box<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Setting the flag stops `fit` before its next step.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn operator(&self) -> &dyn Operator<T> {
        self.operator.as_ref()
    }

    pub fn into_operator(self) -> Box<dyn Operator<T>> {
        self.operator
    }

    pub fn objective(&self) -> &Objective<T> {
        &self.objective
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn fit(&mut self, dataset: &dyn Dataset<T>, test_dataset: Option<&dyn Dataset<T>>) -> Result<FitReport> {
        if let TrainerState::Failed { step, loss } = self.state {
            return Err(OperatorError::NumericFailure { step, loss });
        }
        if dataset.len().is_none() && self.config.steps_per_epoch.is_none() {
            return Err(OperatorError::InvalidConfig(
                "steps_per_epoch is required for an unbounded dataset".to_string(),
            ));
        }
        if test_dataset.map_or(false, |test| test.len().is_none()) {
            return Err(OperatorError::InvalidConfig("the test dataset must be finite".to_string()));
        }

        let previous = self.state;
        self.state = TrainerState::Running;
        let result = self.run(dataset, test_dataset);
        if let Err(err) = &result {
            // numeric failures already moved to `Failed`
            if !matches!(err, OperatorError::NumericFailure { .. }) {
                warn!(%err, "fit aborted");
                self.state = previous;
            }
        }
        result
    }

    fn run(&mut self, dataset: &dyn Dataset<T>, test_dataset: Option<&dyn Dataset<T>>) -> Result<FitReport> {
        let started = Instant::now();
        let num_params = self.operator.num_params();
        for callback in &mut self.callbacks {
            callback.on_train_begin(num_params);
        }
        info!(
            num_params,
            operator = self.operator.name(),
            max_epochs = self.config.max_epochs,
            batch_size = self.config.batch_size,
            "fit started"
        );

        let mut best = f64::INFINITY;
        let mut stale_epochs = 0;
        let mut train_loss = None;
        let mut test_loss = None;
        let mut reason = StopReason::MaxEpochs;

        while self.epoch < self.config.max_epochs {
            if let LrSchedule::Linear = self.config.lr_schedule {
                let remaining = 1.0 - self.epoch as f64 / self.config.max_epochs as f64;
                self.optimizer.set_learning_rate(self.config.learning_rate * remaining);
            }
            let Some(mean) = self.run_epoch(dataset, started)? else {
                reason = StopReason::Cancelled;
                break;
            };
            train_loss = Some(mean);
            if let Some(test) = test_dataset {
                test_loss = Some(dataset_loss(test, self.operator(), &self.objective, self.config.batch_size)?);
            }
            self.epoch += 1;
            info!(
                epoch = self.epoch,
                train_loss = mean,
                test_loss = ?test_loss,
                learning_rate = self.optimizer.learning_rate(),
                "epoch finished"
            );
            let logs = EpochLogs {
                epoch: self.epoch,
                max_epochs: self.config.max_epochs,
                step: self.step,
                train_loss: mean,
                test_loss,
                learning_rate: self.optimizer.learning_rate(),
                elapsed: started.elapsed(),
            };
            for callback in &mut self.callbacks {
                callback.on_epoch_end(&logs);
            }

            let monitored = test_loss.unwrap_or(mean);
            if monitored < self.config.tolerance {
                reason = StopReason::Tolerance;
                break;
            }
            if let Some(patience) = self.config.plateau_patience {
                if monitored < best - self.config.plateau_min_delta {
                    best = monitored;
                    stale_epochs = 0;
                } else {
                    stale_epochs += 1;
                    if stale_epochs >= patience {
                        reason = StopReason::Plateau;
                        break;
                    }
                }
            }
        }

        self.state = TrainerState::Converged {
            reason,
            partial: reason == StopReason::Cancelled,
        };
        info!(?reason, epochs = self.epoch, steps = self.step, ?train_loss, ?test_loss, "fit finished");
        let report = FitReport {
            reason,
            epochs: self.epoch,
            steps: self.step,
            train_loss,
            test_loss,
        };
        for callback in &mut self.callbacks {
            callback.on_train_end(&report);
        }
        Ok(report)
    }

    /// Mean training loss of one epoch, `None` when cancelled.
    fn run_epoch(&mut self, dataset: &dyn Dataset<T>, started: Instant) -> Result<Option<f64>> {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(self.epoch as u64));
        let mut examples = if self.config.shuffle {
            dataset.shuffled(&mut rng)
        } else {
            dataset.iter()
        };
        let mut total = 0.0;
        let mut steps = 0;
        loop {
            if self.config.steps_per_epoch.map_or(false, |cap| steps >= cap) {
                break;
            }
            if self.cancel.load(Ordering::SeqCst) {
                warn!(epoch = self.epoch, step = self.step, "fit cancelled");
                return Ok(None);
            }
            let chunk: Vec<TrainingExample<T>> = examples.by_ref().take(self.config.batch_size).collect();
            if chunk.is_empty() {
                break;
            }
            let batch = TrainingExample::collate(&chunk)?;
            let record = self.train_step(&batch, started)?;
            total += record.loss;
            steps += 1;
        }
        if steps == 0 {
            return Err(OperatorError::InvalidConfig("the dataset produced no examples".to_string()));
        }
        Ok(Some(total / steps as f64))
    }

    /// forward, loss, backward and update on one batch. Parameters are only
    /// replaced when loss, gradients and updated values are all finite.
    fn train_step(&mut self, batch: &TrainingExample<T>, started: Instant) -> Result<StepRecord> {
        for parameter in self.operator.parameters() {
            parameter.zero_grad();
        }
        let loss = self.objective.evaluate(self.operator.as_ref(), batch)?;
        let value = loss.total.elem().as_f64();
        if !value.is_finite() {
            return Err(self.fail(value));
        }
        loss.total.backward();

        let parameters: TensorList<T> = self.operator.parameters().cloned().collect();
        let gradients: TensorList<T> = parameters
            .iter()
            .map(|p| p.grad().unwrap_or_else(|| RcTensor::zeros(p.shape().to_vec())))
            .collect();
        if !gradients.iter().all(|g| g.is_finite()) {
            return Err(self.fail(value));
        }

        let snapshot = self.optimizer.state();
        let updated = self.optimizer.step(&parameters, &gradients);
        if !updated.iter().all(|p| p.is_finite()) {
            self.optimizer.load_state(snapshot)?;
            return Err(self.fail(value));
        }
        for (slot, new_value) in self.operator.parameters_mut().zip(updated) {
            *slot = new_value;
        }

        self.step += 1;
        let record = StepRecord {
            epoch: self.epoch,
            step: self.step,
            loss: value,
            data_loss: loss.data,
            residual_loss: loss.residual,
            learning_rate: self.optimizer.learning_rate(),
            elapsed: started.elapsed(),
        };
        debug!(
            epoch = record.epoch,
            step = record.step,
            loss = record.loss,
            data_loss = record.data_loss,
            residual_loss = ?record.residual_loss,
            "step"
        );
        if let Some(sink) = &self.sink {
            if sink.send(record.clone()).is_err() {
                debug!("step record receiver dropped, detaching sink");
                self.sink = None;
            }
        }
        for callback in &mut self.callbacks {
            callback.on_step(&record);
        }
        Ok(record)
    }

    fn fail(&mut self, loss: f64) -> OperatorError {
        let step = self.step + 1;
        warn!(step, loss, "non-finite loss or gradient, training failed");
        self.state = TrainerState::Failed { step, loss };
        OperatorError::NumericFailure { step, loss }
    }

    pub fn state_dict(&self) -> TrainerStateDict {
        TrainerStateDict {
            config: self.config.clone(),
            operator: self.operator.state_dict(),
            optimizer: self.optimizer.state(),
            epoch: self.epoch,
            step: self.step,
        }
    }

    /// Restores parameters, optimizer statistics and counters. A failed
    /// trainer becomes usable again. Nothing changes when any part is rejected.
    pub fn load_state_dict(&mut self, state: &TrainerStateDict) -> Result<()> {
        state.config.validate()?;
        let sizes: Vec<usize> = self.operator.parameters().map(|p| p.count()).collect();
        state.optimizer.check_sizes(&sizes)?;
        let mut optimizer = state.config.optimizer.build(state.config.learning_rate);
        optimizer.load_state(state.optimizer.clone())?;
        // all-or-nothing on its own, so it goes last
        self.operator.load_state_dict(&state.operator)?;
        self.optimizer = optimizer;
        self.objective = std::mem::take(&mut self.objective)
            .with_weights(state.config.loss_weights)
            .with_step(state.config.finite_difference_step);
        self.config = state.config.clone();
        self.epoch = state.epoch;
        self.step = state.step;
        self.state = TrainerState::Initialized;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(TrainerConfig::default().validate().is_ok());
        let bad = TrainerConfig {
            batch_size: 0,
            ..TrainerConfig::default()
        };
        assert!(matches!(bad.validate(), Err(OperatorError::InvalidConfig(_))));
        let bad = TrainerConfig {
            optimizer: OptimizerConfig::Sgd { momentum: 1.5 },
            ..TrainerConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = TrainerConfig {
            finite_difference_step: f64::NAN,
            ..TrainerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: TrainerConfig = serde_json::from_str(r#"{"batch_size": 4, "shuffle": false}"#).unwrap();
        assert_eq!(config.batch_size, 4);
        assert!(!config.shuffle);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.lr_schedule, LrSchedule::Linear);
    }
}
