//! Data and physics-informed losses.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dataset::{Dataset, TrainingExample};
use crate::error::{OperatorError, Result};
use crate::function::{FunctionSet, PointCloud};
use crate::operator::Operator;
use crate::tensor::{Float, RcTensor, Scalar};

/// Mean squared error between two sets sampled at the same points.
pub fn data_loss<T: Float>(predicted: &FunctionSet<T>, target: &FunctionSet<T>) -> Result<Scalar<T>> {
    if !predicted.points().same_points(target.points()) {
        return Err(OperatorError::CoordinateMismatch(format!(
            "predicted counts {:?} and target counts {:?} are not sampled at the same points",
            predicted.counts(),
            target.counts()
        )));
    }
    if predicted.codomain_dim() != target.codomain_dim() {
        return Err(OperatorError::Shape(format!(
            "predicted codomain {} differs from target codomain {}",
            predicted.codomain_dim(),
            target.codomain_dim()
        )));
    }
    Ok((predicted.values() - target.values()).square().mean())
}

/// The predicted function and its coordinate derivatives at a set of points,
/// every tensor `[N, m]`.
#[derive(Debug, Clone)]
pub struct Derivatives<T: Float> {
    pub coordinates: RcTensor<T>,
    pub value: RcTensor<T>,
    /// `first[i]` is the derivative along axis `i`
    pub first: Vec<RcTensor<T>>,
    /// `second[i]` is the second derivative along axis `i`
    pub second: Vec<RcTensor<T>>,
}

/// Central differences of `operator(input)` around `points`.
///
/// Each axis costs two extra forward passes. The error is `O(h^2)` from
/// truncation plus `O(eps / h)` and `O(eps / h^2)` from round-off for the
/// first and second derivatives.
pub fn derivatives<T: Float>(
    operator: &dyn Operator<T>,
    input: &FunctionSet<T>,
    points: &PointCloud<T>,
    step: T,
) -> Result<Derivatives<T>> {
    let value = operator.forward(input, points)?.values().clone();
    let half = T::one() / (step + step);
    let inv_sq = T::one() / (step * step);
    let two = RcTensor::scalar(T::one() + T::one());
    let mut first = Vec::with_capacity(points.dim());
    let mut second = Vec::with_capacity(points.dim());
    for axis in 0..points.dim() {
        let plus = operator.forward(input, &points.shifted(axis, step))?.values().clone();
        let minus = operator.forward(input, &points.shifted(axis, -step))?.values().clone();
        first.push((&plus - &minus).scale(half));
        second.push((&(&plus - &(&value * &two)) + &minus).scale(inv_sq));
    }
    Ok(Derivatives {
        coordinates: points.coordinates().clone(),
        value,
        first,
        second,
    })
}

/// Maps derivatives at the collocation points to a `[N, r]` residual that is
/// zero where the physics holds.
pub type PhysicsFn<T> = Box<dyn Fn(&Derivatives<T>) -> RcTensor<T>>;

/// Mean square of the physics residual at the collocation points.
pub fn residual_loss<T: Float>(
    operator: &dyn Operator<T>,
    input: &FunctionSet<T>,
    collocation_points: &PointCloud<T>,
    physics: &dyn Fn(&Derivatives<T>) -> RcTensor<T>,
    step: T,
) -> Result<Scalar<T>> {
    let derivatives = derivatives(operator, input, collocation_points, step)?;
    let residual = physics(&derivatives);
    if residual.shape().len() != 2 || residual.shape()[0] != collocation_points.len() {
        return Err(OperatorError::Shape(format!(
            "residual must be [{}, r], got {:?}",
            collocation_points.len(),
            residual.shape()
        )));
    }
    Ok(residual.square().mean())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub data: f64,
    pub residual: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            data: 1.0,
            residual: 1.0,
        }
    }
}

/// One evaluation of an [`Objective`].
#[derive(Debug, Clone)]
pub struct LossBreakdown<T: Float> {
    pub total: Scalar<T>,
    pub data: f64,
    pub residual: Option<f64>,
}

/// Weighted sum of the data loss and an optional residual loss.
pub struct Objective<T: Float> {
    weights: LossWeights,
    physics: Option<PhysicsFn<T>>,
    step: f64,
}

impl<T: Float> fmt::Debug for Objective<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Objective")
            .field("weights", &self.weights)
            .field("physics", &self.physics.is_some())
            .field("step", &self.step)
            .finish()
    }
}

impl<T: Float> Default for Objective<T> {
    fn default() -> Self {
        Self::data()
    }
}

impl<T: Float> Objective<T> {
    /// Data loss only.
    pub fn data() -> Self {
        Objective {
            weights: LossWeights::default(),
            physics: None,
            step: 1e-3,
        }
    }

    pub fn with_physics(mut self, physics: PhysicsFn<T>) -> Self {
        self.physics = Some(physics);
        self
    }

    pub fn with_weights(mut self, weights: LossWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Finite-difference step used by the residual term.
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    pub fn weights(&self) -> LossWeights {
        self.weights
    }

    /// The residual term is evaluated at the example's collocation points,
    /// or at the target points when it has none.
    pub fn evaluate(&self, operator: &dyn Operator<T>, example: &TrainingExample<T>) -> Result<LossBreakdown<T>> {
        let predicted = operator.forward(&example.input, example.target.points())?;
        let data = data_loss(&predicted, &example.target)?;
        let data_value = data.elem().as_f64();
        let mut total = data.scale(T::cast(self.weights.data));
        let mut residual_value = None;
        if let Some(physics) = &self.physics {
            let points = example
                .collocation
                .as_ref()
                .unwrap_or_else(|| example.target.points());
            let residual = residual_loss(operator, &example.input, points, &**physics, T::cast(self.step))?;
            residual_value = Some(residual.elem().as_f64());
            total = &total + &residual.scale(T::cast(self.weights.residual));
        }
        trace!(data = data_value, residual = ?residual_value, "objective");
        Ok(LossBreakdown {
            total,
            data: data_value,
            residual: residual_value,
        })
    }
}

/// Mean objective over a finite dataset, in batches of `batch_size` examples.
/// Each batch is weighted by its number of examples.
pub fn dataset_loss<T: Float>(
    dataset: &dyn Dataset<T>,
    operator: &dyn Operator<T>,
    objective: &Objective<T>,
    batch_size: usize,
) -> Result<f64> {
    if dataset.len().is_none() {
        return Err(OperatorError::InvalidConfig(
            "can not average a loss over an unbounded dataset".to_string(),
        ));
    }
    if batch_size == 0 {
        return Err(OperatorError::InvalidConfig("batch_size must be positive".to_string()));
    }
    let mut examples = dataset.iter();
    let mut total = 0.0;
    let mut count = 0;
    loop {
        let chunk: Vec<TrainingExample<T>> = examples.by_ref().take(batch_size).collect();
        if chunk.is_empty() {
            break;
        }
        let batch = TrainingExample::collate(&chunk)?;
        // weighted by examples so a short last batch counts for less
        total += chunk.len() as f64 * objective.evaluate(operator, &batch)?.total.elem().as_f64();
        count += chunk.len();
    }
    Ok(if count == 0 { 0.0 } else { total / count as f64 })
}
