use tracing::trace;

use crate::checkpoint::StateDict;
use crate::error::{OperatorError, Result};
use crate::function::{FunctionSet, PointCloud};
use crate::operator::{Operator, OperatorShapes};
use crate::tensor::{Float, RcTensor};

/// Operators applied one after another.
///
/// Stages up to the last resampling one run at their input's own points;
/// from that stage on the caller's query points are used.
pub struct OperatorStack<T: Float> {
    stages: Vec<Box<dyn Operator<T>>>,
    last_resampling: Option<usize>,
}

impl<T: Float> OperatorStack<T> {
    pub fn new(stages: Vec<Box<dyn Operator<T>>>) -> Result<Self> {
        let first = stages.first().ok_or_else(|| {
            OperatorError::IncompatibleShape("an operator stack needs at least one stage".to_string())
        })?;
        let dim = first.shapes().domain_dim;
        for (i, stage) in stages.iter().enumerate() {
            let shapes = stage.shapes();
            if shapes.domain_dim != dim || shapes.query_dim != dim {
                return Err(OperatorError::IncompatibleShape(format!(
                    "stage {i} ({}) works on d={}/{}, the stack on d={dim}",
                    stage.name(),
                    shapes.domain_dim,
                    shapes.query_dim
                )));
            }
        }
        for (i, pair) in stages.windows(2).enumerate() {
            let (out, next) = (pair[0].shapes().output_channels, pair[1].shapes().input_channels);
            if out != next {
                return Err(OperatorError::IncompatibleShape(format!(
                    "stage {i} ({}) emits {out} channels, stage {} ({}) reads {next}",
                    pair[0].name(),
                    i + 1,
                    pair[1].name()
                )));
            }
        }
        let last_resampling = stages.iter().rposition(|stage| stage.resamples());
        Ok(OperatorStack {
            stages,
            last_resampling,
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<T: Float> Operator<T> for OperatorStack<T> {
    fn shapes(&self) -> OperatorShapes {
        let first = self.stages[0].shapes();
        let last = self.stages[self.stages.len() - 1].shapes();
        OperatorShapes {
            domain_dim: first.domain_dim,
            input_channels: first.input_channels,
            query_dim: last.query_dim,
            output_channels: last.output_channels,
        }
    }

    fn forward(&self, input: &FunctionSet<T>, query: &PointCloud<T>) -> Result<FunctionSet<T>> {
        let mut current = input.clone();
        for (i, stage) in self.stages.iter().enumerate() {
            let own_points = self.last_resampling.map_or(false, |last| i < last);
            let stage_query = if own_points {
                current.points().clone()
            } else {
                query.clone()
            };
            trace!(stage = stage.name(), own_points, "stack stage");
            current = stage.forward(&current, &stage_query)?;
        }
        Ok(current)
    }

    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_> {
        Box::new(self.stages.iter().flat_map(|stage| stage.parameters()))
    }

    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_> {
        Box::new(self.stages.iter_mut().flat_map(|stage| stage.parameters_mut()))
    }

    fn name(&self) -> &str {
        "stack"
    }

    fn resamples(&self) -> bool {
        self.last_resampling.is_some()
    }

    fn state_dict(&self) -> StateDict {
        let tensors = self
            .stages
            .iter()
            .enumerate()
            .flat_map(|(i, stage)| {
                StateDict::from_parameters(&format!("{i}.{}", stage.name()), stage.parameters()).tensors
            })
            .collect();
        StateDict { tensors }
    }
}
