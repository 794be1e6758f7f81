mod adam;
mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::tensor::{Float, RcTensor, TensorList};

/// `step(parameters, gradients) -> updated parameters`.
///
/// Implementations never touch the tensors they are given; they hand back
/// fresh parameter tensors so the caller decides when to swap them in.
pub trait Optimizer<T: Float> {
    fn step(&mut self, parameters: &[RcTensor<T>], gradients: &[RcTensor<T>]) -> TensorList<T>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd { momentum: f64 },
    Adam { beta1: f64, beta2: f64, epsilon: f64 },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        match *self {
            OptimizerConfig::Sgd { momentum } if !(0.0..1.0).contains(&momentum) => Err(
                OperatorError::InvalidConfig(format!("momentum must be in [0, 1), got {momentum}")),
            ),
            OptimizerConfig::Adam { beta1, beta2, .. }
                if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) =>
            {
                Err(OperatorError::InvalidConfig(format!(
                    "adam betas must be in [0, 1), got ({beta1}, {beta2})"
                )))
            }
            OptimizerConfig::Adam { epsilon, .. } if epsilon <= 0.0 => Err(
                OperatorError::InvalidConfig(format!("adam epsilon must be positive, got {epsilon}")),
            ),
            _ => Ok(()),
        }
    }

    pub fn build<T: Float>(&self, learning_rate: f64) -> Box<dyn Optimizer<T>> {
        match *self {
            OptimizerConfig::Sgd { momentum } => Box::new(Sgd::new(learning_rate, momentum)),
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(learning_rate, beta1, beta2, epsilon)),
        }
    }
}

/// Optimizer statistics in a storage-agnostic form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub config: OptimizerConfig,
    pub learning_rate: f64,
    pub step: usize,
    /// one buffer per statistic per parameter, in parameter order
    pub buffers: Vec<Vec<f64>>,
}

impl OptimizerState {
    /// Buffers are empty before the first step, otherwise there is one per
    /// statistic per parameter tensor, each as long as its tensor.
    pub fn check_sizes(&self, sizes: &[usize]) -> Result<()> {
        if self.buffers.is_empty() {
            return Ok(());
        }
        let statistics = match self.config {
            OptimizerConfig::Sgd { .. } => 1,
            OptimizerConfig::Adam { .. } => 2,
        };
        let expected = sizes.iter().copied().cycle().take(sizes.len() * statistics);
        if !self.buffers.iter().map(Vec::len).eq(expected) {
            return Err(OperatorError::Shape(format!(
                "optimizer buffers {:?} do not fit parameters of sizes {sizes:?}",
                self.buffers.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }
        Ok(())
    }
}

pub(crate) fn to_f64<T: Float>(values: &[T]) -> Vec<f64> {
    values.iter().map(|v| v.as_f64()).collect()
}

/// One buffer per parameter, each as long as its parameter.
pub(crate) fn fits<T: Float>(buffers: &[Vec<T>], parameters: &[RcTensor<T>]) -> bool {
    buffers.len() == parameters.len() && buffers.iter().zip(parameters).all(|(b, p)| b.len() == p.count())
}

pub(crate) fn from_f64<T: Float>(values: &[f64]) -> Vec<T> {
    values.iter().map(|&v| T::cast(v)).collect()
}
