//! Learned maps between function sets.
//!
//! Every operator evaluates its output at caller-supplied query points, so a
//! model trained on one discretization can be queried on another.

mod deeponet;
mod fourier;
mod pointwise;
mod stack;

pub use deeponet::{DeepOnet, DeepOnetConfig};
pub use fourier::{FourierLayer, FourierLayerConfig};
pub use pointwise::{ChannelMap, Pointwise};
pub use stack::OperatorStack;

use serde::{Deserialize, Serialize};

use crate::checkpoint::StateDict;
use crate::error::{OperatorError, Result};
use crate::function::{FunctionSet, PointCloud};
use crate::tensor::{Float, RcTensor};

/// Dimensions an operator reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorShapes {
    /// `d` of the input function's points
    pub domain_dim: usize,
    /// `m` of the input function's values
    pub input_channels: usize,
    /// `d` of the query points
    pub query_dim: usize,
    /// `m` of the output values
    pub output_channels: usize,
}

pub trait Operator<T: Float> {
    fn shapes(&self) -> OperatorShapes;

    /// Evaluates the operator applied to `input` at `query`. The returned set
    /// carries `query` as its points.
    fn forward(&self, input: &FunctionSet<T>, query: &PointCloud<T>) -> Result<FunctionSet<T>>;

    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_>;

    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_>;

    fn name(&self) -> &str;

    /// Whether `forward` accepts query points other than the input's own.
    fn resamples(&self) -> bool {
        true
    }

    fn num_params(&self) -> usize {
        self.parameters().map(|p| p.count()).sum()
    }

    fn state_dict(&self) -> StateDict {
        StateDict::from_parameters(self.name(), self.parameters())
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        state.load_into(self.parameters_mut())
    }
}

/// Rejects an input or query whose dimensions differ from `shapes`.
pub(crate) fn check_call<T: Float>(
    name: &str,
    shapes: &OperatorShapes,
    input: &FunctionSet<T>,
    query: &PointCloud<T>,
) -> Result<()> {
    if input.domain_dim() != shapes.domain_dim || input.codomain_dim() != shapes.input_channels {
        return Err(OperatorError::Shape(format!(
            "{name} expects inputs with d={} m={}, got d={} m={}",
            shapes.domain_dim,
            shapes.input_channels,
            input.domain_dim(),
            input.codomain_dim()
        )));
    }
    if query.dim() != shapes.query_dim {
        return Err(OperatorError::Shape(format!(
            "{name} expects {}-dimensional queries, got {}",
            shapes.query_dim,
            query.dim()
        )));
    }
    if query.batch_size() != input.batch_size() {
        return Err(OperatorError::Shape(format!(
            "{name} got {} input functions but {} query sets",
            input.batch_size(),
            query.batch_size()
        )));
    }
    Ok(())
}

/// Pointwise operators can only be evaluated where the input was sampled.
pub(crate) fn check_same_points<T: Float>(
    name: &str,
    input: &FunctionSet<T>,
    query: &PointCloud<T>,
) -> Result<()> {
    if !query.same_points(input.points()) {
        return Err(OperatorError::CoordinateMismatch(format!(
            "{name} works pointwise, queries must coincide with the input points"
        )));
    }
    Ok(())
}
