use rand::Rng;

use crate::error::Result;
use crate::function::{FunctionSet, PointCloud};
use crate::nn::{Activation, Mlp, Module};
use crate::operator::{check_call, check_same_points, Operator, OperatorShapes};
use crate::tensor::{functional, Float, RcTensor};

/// A network applied to the values at every point on its own.
///
/// Used as a lifting layer (`m -> width`) in front of an operator and as a
/// projection (`width -> m`) behind it.
#[derive(Debug)]
pub struct ChannelMap<T: Float> {
    name: &'static str,
    domain_dim: usize,
    net: Mlp<T>,
}

impl<T: Float> ChannelMap<T> {
    pub fn new(name: &'static str, domain_dim: usize, net: Mlp<T>) -> Self {
        ChannelMap {
            name,
            domain_dim,
            net,
        }
    }

    /// A single activated layer `channels -> width`.
    pub fn lifting<R: Rng + ?Sized>(
        domain_dim: usize,
        channels: usize,
        width: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let net = Mlp::random(&[channels, width], activation, activation, rng);
        ChannelMap::new("lifting", domain_dim, net)
    }

    /// `width -> width -> channels`, linear output.
    pub fn projection<R: Rng + ?Sized>(
        domain_dim: usize,
        width: usize,
        channels: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let net = Mlp::random(&[width, width, channels], activation, Activation::Identity, rng);
        ChannelMap::new("projection", domain_dim, net)
    }
}

impl<T: Float> Operator<T> for ChannelMap<T> {
    fn shapes(&self) -> OperatorShapes {
        OperatorShapes {
            domain_dim: self.domain_dim,
            input_channels: self.net.in_features(),
            query_dim: self.domain_dim,
            output_channels: self.net.out_features(),
        }
    }

    fn forward(&self, input: &FunctionSet<T>, query: &PointCloud<T>) -> Result<FunctionSet<T>> {
        check_call(self.name, &self.shapes(), input, query)?;
        check_same_points(self.name, input, query)?;
        FunctionSet::new(query.clone(), self.net.forward(input.values().clone()))
    }

    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_> {
        self.net.parameters()
    }

    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_> {
        self.net.parameters_mut()
    }

    fn name(&self) -> &str {
        self.name
    }

    fn resamples(&self) -> bool {
        false
    }
}

/// A shared network on every `(coordinate, value)` pair: `[d + m_in] -> m_out`.
#[derive(Debug)]
pub struct Pointwise<T: Float> {
    domain_dim: usize,
    net: Mlp<T>,
}

impl<T: Float> Pointwise<T> {
    pub fn new<R: Rng + ?Sized>(
        domain_dim: usize,
        input_channels: usize,
        hidden: &[usize],
        output_channels: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let widths: Vec<usize> = std::iter::once(domain_dim + input_channels)
            .chain(hidden.iter().copied())
            .chain(std::iter::once(output_channels))
            .collect();
        Pointwise {
            domain_dim,
            net: Mlp::random(&widths, activation, Activation::Identity, rng),
        }
    }
}

impl<T: Float> Operator<T> for Pointwise<T> {
    fn shapes(&self) -> OperatorShapes {
        OperatorShapes {
            domain_dim: self.domain_dim,
            input_channels: self.net.in_features() - self.domain_dim,
            query_dim: self.domain_dim,
            output_channels: self.net.out_features(),
        }
    }

    fn forward(&self, input: &FunctionSet<T>, query: &PointCloud<T>) -> Result<FunctionSet<T>> {
        check_call(self.name(), &self.shapes(), input, query)?;
        check_same_points(self.name(), input, query)?;
        let pairs = functional::concat_cols(&[input.coordinates().clone(), input.values().clone()]);
        FunctionSet::new(query.clone(), self.net.forward(pairs))
    }

    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_> {
        self.net.parameters()
    }

    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_> {
        self.net.parameters_mut()
    }

    fn name(&self) -> &str {
        "pointwise"
    }

    fn resamples(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperatorError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn samples() -> FunctionSet<f64> {
        FunctionSet::from_samples(
            vec![vec![vec![0.0], vec![1.0]]],
            vec![vec![vec![0.5], vec![-0.5]]],
        )
        .unwrap()
    }

    #[test]
    fn test_lifting_then_projection_widths() {
        let mut rng = StdRng::seed_from_u64(1);
        let lift: ChannelMap<f64> = ChannelMap::lifting(1, 1, 6, Activation::Tanh, &mut rng);
        let project: ChannelMap<f64> = ChannelMap::projection(1, 6, 2, Activation::Tanh, &mut rng);
        let fs = samples();
        let lifted = lift.forward(&fs, fs.points()).unwrap();
        assert_eq!(lifted.codomain_dim(), 6);
        let out = project.forward(&lifted, fs.points()).unwrap();
        assert_eq!(out.codomain_dim(), 2);
        assert_eq!(out.coordinates(), fs.coordinates());
    }

    #[test]
    fn test_pointwise_requires_matching_points() {
        let mut rng = StdRng::seed_from_u64(1);
        let op: Pointwise<f64> = Pointwise::new(1, 1, &[4], 1, Activation::Tanh, &mut rng);
        let fs = samples();
        assert_eq!(op.shapes().input_channels, 1);
        assert!(op.forward(&fs, fs.points()).is_ok());
        let elsewhere = fs.points().shifted(0, 0.1);
        assert!(matches!(
            op.forward(&fs, &elsewhere),
            Err(OperatorError::CoordinateMismatch(_))
        ));
    }

    #[test]
    fn test_wrong_channels_is_a_shape_error() {
        let mut rng = StdRng::seed_from_u64(1);
        let lift: ChannelMap<f64> = ChannelMap::lifting(1, 3, 4, Activation::Tanh, &mut rng);
        let fs = samples();
        assert!(matches!(lift.forward(&fs, fs.points()), Err(OperatorError::Shape(_))));
    }
}
