use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::discretization::{to_dense, PadPolicy};
use crate::error::{OperatorError, Result};
use crate::function::{FunctionSet, PointCloud};
use crate::nn::{Activation, Mlp, Module};
use crate::operator::{check_call, Operator, OperatorShapes};
use crate::tensor::{functional, Float, RcTensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepOnetConfig {
    pub num_sensors: usize,
    pub domain_dim: usize,
    pub input_channels: usize,
    pub query_dim: usize,
    pub output_channels: usize,
    pub branch_width: usize,
    pub branch_depth: usize,
    pub trunk_width: usize,
    pub trunk_depth: usize,
    /// `p`, the number of basis functions per output channel
    pub basis_functions: usize,
    pub activation: Activation,
}

impl Default for DeepOnetConfig {
    fn default() -> Self {
        Self {
            num_sensors: 32,
            domain_dim: 1,
            input_channels: 1,
            query_dim: 1,
            output_channels: 1,
            branch_width: 32,
            branch_depth: 3,
            trunk_width: 32,
            trunk_depth: 3,
            basis_functions: 8,
            activation: Activation::Tanh,
        }
    }
}

impl DeepOnetConfig {
    pub fn new(num_sensors: usize, domain_dim: usize, input_channels: usize, output_channels: usize) -> Self {
        Self {
            num_sensors,
            domain_dim,
            input_channels,
            query_dim: domain_dim,
            output_channels,
            ..Self::default()
        }
    }

    pub fn with_query_dim(mut self, query_dim: usize) -> Self {
        self.query_dim = query_dim;
        self
    }

    pub fn with_branch(mut self, width: usize, depth: usize) -> Self {
        self.branch_width = width;
        self.branch_depth = depth;
        self
    }

    pub fn with_trunk(mut self, width: usize, depth: usize) -> Self {
        self.trunk_width = width;
        self.trunk_depth = depth;
        self
    }

    pub fn with_basis_functions(mut self, basis_functions: usize) -> Self {
        self.basis_functions = basis_functions;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_sensors", self.num_sensors),
            ("domain_dim", self.domain_dim),
            ("input_channels", self.input_channels),
            ("query_dim", self.query_dim),
            ("output_channels", self.output_channels),
            ("basis_functions", self.basis_functions),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(OperatorError::InvalidConfig(format!("{field} must be positive")));
        }
        if (self.branch_depth > 0 && self.branch_width == 0) || (self.trunk_depth > 0 && self.trunk_width == 0) {
            return Err(OperatorError::InvalidConfig(
                "hidden layers need a positive width".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shapes(&self) -> OperatorShapes {
        OperatorShapes {
            domain_dim: self.domain_dim,
            input_channels: self.input_channels,
            query_dim: self.query_dim,
            output_channels: self.output_channels,
        }
    }
}

/// Branch-trunk operator network.
///
/// The branch reads the input values at the `num_sensors` sample points and
/// emits `p` coefficients per output channel; the trunk maps every query
/// point to `p` basis values per channel. Channel `k` at a query point is
/// `sum_j branch[k * p + j] * trunk[k * p + j] + bias[k]`.
#[derive(Debug)]
pub struct DeepOnet<T: Float> {
    config: DeepOnetConfig,
    branch: Mlp<T>,
    trunk: Mlp<T>,
    bias: RcTensor<T>,
    // [p * m, m], sums each block of p products into its channel
    basis_sum: RcTensor<T>,
}

impl<T: Float> DeepOnet<T> {
    pub fn new<R: Rng + ?Sized>(config: DeepOnetConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let p = config.basis_functions;
        let m = config.output_channels;

        let branch_widths = layer_widths(
            config.num_sensors * config.input_channels,
            config.branch_width,
            config.branch_depth,
            p * m,
        );
        let trunk_widths = layer_widths(config.query_dim, config.trunk_width, config.trunk_depth, p * m);
        let branch = Mlp::random(&branch_widths, config.activation, Activation::Identity, &mut *rng);
        let trunk = Mlp::random(&trunk_widths, config.activation, config.activation, &mut *rng);

        let mut basis_sum = vec![T::zero(); p * m * m];
        for k in 0..m {
            for j in 0..p {
                basis_sum[(k * p + j) * m + k] = T::one();
            }
        }
        debug!(?branch_widths, ?trunk_widths, "built deeponet");
        Ok(DeepOnet {
            config,
            branch,
            trunk,
            bias: RcTensor::parameter(vec![T::zero(); m], vec![1, m]),
            basis_sum: RcTensor::new(basis_sum, vec![p * m, m]),
        })
    }

    pub fn config(&self) -> &DeepOnetConfig {
        &self.config
    }
}

fn layer_widths(input: usize, width: usize, depth: usize, output: usize) -> Vec<usize> {
    std::iter::once(input)
        .chain(std::iter::repeat(width).take(depth))
        .chain(std::iter::once(output))
        .collect()
}

impl<T: Float> Operator<T> for DeepOnet<T> {
    fn shapes(&self) -> OperatorShapes {
        self.config.shapes()
    }

    fn forward(&self, input: &FunctionSet<T>, query: &PointCloud<T>) -> Result<FunctionSet<T>> {
        check_call(self.name(), &self.shapes(), input, query)?;
        let dense = to_dense(input, PadPolicy::ErrorOnRagged)?;
        let sensors = dense.max_count();
        if sensors != self.config.num_sensors {
            return Err(OperatorError::Shape(format!(
                "deeponet reads {} sensors, the input has {sensors}",
                self.config.num_sensors
            )));
        }
        let batch = input.batch_size();
        let branch_in = dense.values.reshape(vec![batch, sensors * self.config.input_channels]);
        let coefficients = self.branch.forward(branch_in);
        let per_point = functional::gather_rows(&coefficients, &query.owners());
        let basis = self.trunk.forward(query.coordinates().clone());
        let values = (&per_point * &basis).matmul(&self.basis_sum) + self.bias.clone();
        FunctionSet::new(query.clone(), values)
    }

    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_> {
        Box::new(
            self.branch
                .parameters()
                .chain(self.trunk.parameters())
                .chain(std::iter::once(&self.bias)),
        )
    }

    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_> {
        Box::new(
            self.branch
                .parameters_mut()
                .chain(self.trunk.parameters_mut())
                .chain(std::iter::once(&mut self.bias)),
        )
    }

    fn name(&self) -> &str {
        "deeponet"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sensors(batch: usize) -> FunctionSet<f64> {
        let points = PointCloud::linspace(0.0, 1.0, 4, batch).unwrap();
        let values = points.coordinates().clone();
        FunctionSet::new(points, values).unwrap()
    }

    #[test]
    fn test_output_shape_and_points() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = DeepOnetConfig::new(4, 1, 1, 2).with_branch(8, 1).with_trunk(8, 1);
        let net: DeepOnet<f64> = DeepOnet::new(config, &mut rng).unwrap();
        let query = PointCloud::from_points(vec![vec![vec![0.1], vec![0.2]], vec![vec![0.3]]]).unwrap();
        let out = net.forward(&sensors(2), &query).unwrap();
        assert_eq!(out.values().shape(), &[3, 2]);
        assert_eq!(out.points(), &query);
        assert_eq!(out.codomain_dim(), 2);
    }

    #[test]
    fn test_rejects_wrong_sensor_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let net: DeepOnet<f64> = DeepOnet::new(DeepOnetConfig::new(5, 1, 1, 1), &mut rng).unwrap();
        let query = PointCloud::linspace(0.0, 1.0, 3, 1).unwrap();
        assert!(matches!(
            net.forward(&sensors(1), &query),
            Err(OperatorError::Shape(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(DeepOnetConfig::new(0, 1, 1, 1).validate().is_err());
        assert!(DeepOnetConfig::new(4, 1, 1, 1).with_branch(0, 2).validate().is_err());
        assert!(DeepOnetConfig::new(4, 1, 1, 1).with_trunk(0, 0).validate().is_ok());
    }

    #[test]
    fn test_parameter_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = DeepOnetConfig::new(4, 1, 1, 1)
            .with_branch(3, 1)
            .with_trunk(3, 1)
            .with_basis_functions(2);
        let net: DeepOnet<f64> = DeepOnet::new(config, &mut rng).unwrap();
        // branch 4*3+3 + 3*2+2, trunk 1*3+3 + 3*2+2, bias 1
        assert_eq!(net.num_params(), 23 + 14 + 1);
    }
}
