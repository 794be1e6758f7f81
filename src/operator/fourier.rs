use std::f64::consts::PI;

use itertools::Itertools;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OperatorError, Result};
use crate::function::{FunctionSet, PointCloud};
use crate::operator::{check_call, Operator, OperatorShapes};
use crate::tensor::{functional, Float, RcTensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FourierLayerConfig {
    pub domain_dim: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Highest frequency kept along every axis; `k` runs over `-modes..=modes`.
    pub modes: usize,
    /// Side length of the periodic cell.
    pub period: f64,
}

impl Default for FourierLayerConfig {
    fn default() -> Self {
        Self {
            domain_dim: 1,
            input_channels: 1,
            output_channels: 1,
            modes: 8,
            period: 2.0 * PI,
        }
    }
}

impl FourierLayerConfig {
    pub fn new(domain_dim: usize, input_channels: usize, output_channels: usize) -> Self {
        Self {
            domain_dim,
            input_channels,
            output_channels,
            ..Self::default()
        }
    }

    pub fn with_modes(mut self, modes: usize) -> Self {
        self.modes = modes;
        self
    }

    pub fn with_period(mut self, period: f64) -> Self {
        self.period = period;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain_dim == 0 || self.input_channels == 0 || self.output_channels == 0 {
            return Err(OperatorError::InvalidConfig(format!(
                "fourier layer dimensions must be positive, got {self:?}"
            )));
        }
        if !(self.period.is_finite() && self.period > 0.0) {
            return Err(OperatorError::InvalidConfig(format!(
                "period must be positive, got {}",
                self.period
            )));
        }
        Ok(())
    }

    /// `(2 * modes + 1)^domain_dim`
    pub fn num_frequencies(&self) -> usize {
        (2 * self.modes + 1).pow(self.domain_dim as u32)
    }

    pub fn shapes(&self) -> OperatorShapes {
        OperatorShapes {
            domain_dim: self.domain_dim,
            input_channels: self.input_channels,
            query_dim: self.domain_dim,
            output_channels: self.output_channels,
        }
    }
}

/// Spectral convolution on a periodic cell.
///
/// Each input function is projected onto the truncated Fourier basis
/// `exp(i w k.x)` with `w = 2 pi / period`, every frequency gets its own
/// complex `m_out x m_in` channel mix, and the resulting series is summed at
/// the query points. On a uniform grid with more than `2 * modes` points per
/// axis the projection is the exact DFT of a band-limited input, so the output
/// does not depend on the input resolution.
#[derive(Debug)]
pub struct FourierLayer<T: Float> {
    config: FourierLayerConfig,
    // angular frequency vectors, [F * d] row-major
    frequencies: Vec<f64>,
    // [F, m_out, m_in]
    real: RcTensor<T>,
    imag: RcTensor<T>,
    // [m_in, 1], sums the mixed channels
    ones: RcTensor<T>,
}

impl<T: Float> FourierLayer<T> {
    pub fn new<R: Rng + ?Sized>(config: FourierLayerConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let omega = 2.0 * PI / config.period;
        let modes = config.modes as i64;
        let frequencies: Vec<f64> = (0..config.domain_dim)
            .map(|_| -modes..=modes)
            .multi_cartesian_product()
            .flatten()
            .map(|k| omega * k as f64)
            .collect();

        let (m_in, m_out) = (config.input_channels, config.output_channels);
        let shape = vec![config.num_frequencies(), m_out, m_in];
        let count: usize = shape.iter().product();
        let std = 1.0 / (m_in * m_out) as f64;
        let mut kernel = || -> Vec<T> {
            (0..count)
                .map(|_| T::cast(std * rng.sample::<f64, _>(StandardNormal)))
                .collect()
        };
        let real = RcTensor::parameter(kernel(), shape.clone());
        let imag = RcTensor::parameter(kernel(), shape);
        debug!(frequencies = config.num_frequencies(), m_in, m_out, "built fourier layer");
        Ok(FourierLayer {
            ones: RcTensor::new(vec![T::one(); m_in], vec![m_in, 1]),
            config,
            frequencies,
            real,
            imag,
        })
    }

    pub fn config(&self) -> &FourierLayerConfig {
        &self.config
    }

    /// `w k.x` for every row of `points` against every frequency, `[n, F]` row-major.
    fn angles(&self, points: &RcTensor<T>) -> Vec<f64> {
        let d = self.config.domain_dim;
        points
            .array()
            .chunks(d)
            .flat_map(|x| {
                self.frequencies
                    .chunks(d)
                    .map(move |k| x.iter().zip(k).map(|(xi, ki)| xi.as_f64() * ki).sum::<f64>())
            })
            .collect()
    }

    /// `[F, n]` cosine and sine tables scaled by `1 / n`.
    fn analysis(&self, points: &RcTensor<T>) -> (RcTensor<T>, RcTensor<T>) {
        let n = points.shape()[0];
        let f = self.config.num_frequencies();
        let angles = self.angles(points);
        let scale = 1.0 / n as f64;
        let mut cos = Vec::with_capacity(f * n);
        let mut sin = Vec::with_capacity(f * n);
        for fi in 0..f {
            for j in 0..n {
                let angle = angles[j * f + fi];
                cos.push(T::cast(scale * angle.cos()));
                sin.push(T::cast(scale * angle.sin()));
            }
        }
        (RcTensor::new(cos, vec![f, n]), RcTensor::new(sin, vec![f, n]))
    }

    /// `[n, F]` cosine and sine tables.
    fn synthesis(&self, points: &RcTensor<T>) -> (RcTensor<T>, RcTensor<T>) {
        let n = points.shape()[0];
        let f = self.config.num_frequencies();
        let angles = self.angles(points);
        let cos = angles.iter().map(|a| T::cast(a.cos())).collect();
        let sin = angles.iter().map(|a| T::cast(a.sin())).collect();
        (RcTensor::new(cos, vec![n, f]), RcTensor::new(sin, vec![n, f]))
    }

    /// `out[f, o] = sum_i kernel[f, o, i] * coefficients[f, i]`
    fn mix(&self, kernel: &RcTensor<T>, coefficients: &RcTensor<T>) -> RcTensor<T> {
        let f = self.config.num_frequencies();
        let (m_in, m_out) = (self.config.input_channels, self.config.output_channels);
        let spread = coefficients.reshape(vec![f, 1, m_in]);
        (kernel * &spread)
            .reshape(vec![f * m_out, m_in])
            .matmul(&self.ones)
            .reshape(vec![f, m_out])
    }
}

impl<T: Float> Operator<T> for FourierLayer<T> {
    fn shapes(&self) -> OperatorShapes {
        self.config.shapes()
    }

    fn forward(&self, input: &FunctionSet<T>, query: &PointCloud<T>) -> Result<FunctionSet<T>> {
        check_call(self.name(), &self.shapes(), input, query)?;
        let mut outputs = Vec::with_capacity(input.batch_size());
        for b in 0..input.batch_size() {
            let sensors = input.points().function(b);
            if sensors.shape()[0] == 0 {
                return Err(OperatorError::Shape(format!(
                    "fourier layer needs samples of every input function, function {b} has none"
                )));
            }
            let values = input.function_values(b);
            let (cos_in, sin_in) = self.analysis(&sensors);
            // c_k = re + i im for every frequency and channel
            let re = cos_in.matmul(&values);
            let im = -&sin_in.matmul(&values);
            let mixed_re = self.mix(&self.real, &re) - self.mix(&self.imag, &im);
            let mixed_im = self.mix(&self.real, &im) + self.mix(&self.imag, &re);

            let (cos_out, sin_out) = self.synthesis(&query.function(b));
            outputs.push(cos_out.matmul(&mixed_re) - sin_out.matmul(&mixed_im));
        }
        FunctionSet::new(query.clone(), functional::concat_rows(&outputs))
    }

    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_> {
        Box::new([&self.real, &self.imag].into_iter())
    }

    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_> {
        Box::new([&mut self.real, &mut self.imag].into_iter())
    }

    fn name(&self) -> &str {
        "fourier"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// `n` equispaced points per axis on `[0, 2 pi)^d`.
    fn periodic_grid(n: usize, d: usize) -> Vec<Vec<f64>> {
        (0..d)
            .map(|_| (0..n).map(move |j| 2.0 * PI * j as f64 / n as f64))
            .multi_cartesian_product()
            .collect()
    }

    fn sample(points: &[Vec<f64>], f: impl Fn(&[f64]) -> f64) -> FunctionSet<f64> {
        let values = points.iter().map(|x| vec![f(x)]).collect();
        FunctionSet::from_samples(vec![points.to_vec()], vec![values]).unwrap()
    }

    fn identity_kernel(layer: &mut FourierLayer<f64>) {
        let f = layer.config.num_frequencies();
        layer.real = RcTensor::parameter(vec![1.0; f], vec![f, 1, 1]);
        layer.imag = RcTensor::parameter(vec![0.0; f], vec![f, 1, 1]);
    }

    #[test]
    fn test_identity_kernel_reproduces_band_limited_input() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut layer = FourierLayer::new(FourierLayerConfig::new(1, 1, 1).with_modes(3), &mut rng).unwrap();
        identity_kernel(&mut layer);
        let u = |x: &[f64]| x[0].sin() + 0.5 * (2.0 * x[0]).cos();
        let input = sample(&periodic_grid(16, 1), u);

        let off_grid = vec![vec![0.1], vec![1.3], vec![2.9], vec![5.5]];
        let query = PointCloud::from_points(vec![off_grid.clone()]).unwrap();
        let out = layer.forward(&input, &query).unwrap();
        for (i, y) in off_grid.iter().enumerate() {
            assert!((out.values().array()[i] - u(y)).abs() < 1e-10);
        }
    }

    #[test]
    fn test_identity_kernel_in_two_dimensions() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = FourierLayer::new(FourierLayerConfig::new(2, 1, 1).with_modes(1), &mut rng).unwrap();
        identity_kernel(&mut layer);
        let u = |x: &[f64]| x[0].sin() * x[1].cos();
        let input = sample(&periodic_grid(8, 2), u);

        let query_points = vec![vec![0.3, 1.7], vec![4.0, 0.2]];
        let query = PointCloud::from_points(vec![query_points.clone()]).unwrap();
        let out = layer.forward(&input, &query).unwrap();
        for (i, y) in query_points.iter().enumerate() {
            assert!((out.values().array()[i] - u(y)).abs() < 1e-10);
        }
    }

    #[test]
    fn test_output_does_not_depend_on_input_resolution() {
        let mut rng = StdRng::seed_from_u64(2);
        let layer: FourierLayer<f64> = FourierLayer::new(FourierLayerConfig::new(1, 1, 2).with_modes(2), &mut rng).unwrap();
        let u = |x: &[f64]| (2.0 * x[0]).sin() - x[0].cos();
        let coarse = sample(&periodic_grid(12, 1), u);
        let fine = sample(&periodic_grid(40, 1), u);
        let query = PointCloud::linspace(0.0, 6.0, 7, 1).unwrap();
        let a = layer.forward(&coarse, &query).unwrap();
        let b = layer.forward(&fine, &query).unwrap();
        assert_eq!(a.values().shape(), &[7, 2]);
        assert!(a.approx_eq(&b, 1e-10));
    }

    #[test]
    fn test_gradients_reach_both_kernels() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer: FourierLayer<f64> = FourierLayer::new(FourierLayerConfig::new(1, 1, 1).with_modes(2), &mut rng).unwrap();
        let input = sample(&periodic_grid(10, 1), |x| x[0].sin());
        let query = PointCloud::linspace(0.0, 3.0, 4, 1).unwrap();
        layer.forward(&input, &query).unwrap().values().square().sum().backward();
        assert!(layer.real.grad().is_some());
        assert!(layer.imag.grad().is_some());
        assert_eq!(layer.num_params(), 2 * 5);
    }

    #[test]
    fn test_rejects_bad_config_and_empty_inputs() {
        let mut rng = StdRng::seed_from_u64(4);
        let bad = FourierLayerConfig::new(1, 1, 1).with_period(0.0);
        assert!(FourierLayer::<f64>::new(bad, &mut rng).is_err());
        assert!(FourierLayer::<f64>::new(FourierLayerConfig::new(0, 1, 1), &mut rng).is_err());

        let layer: FourierLayer<f64> = FourierLayer::new(FourierLayerConfig::new(1, 1, 1), &mut rng).unwrap();
        let input = FunctionSet::from_samples(vec![vec![vec![0.0]], vec![]], vec![vec![vec![1.0]], vec![]]).unwrap();
        let query = PointCloud::linspace(0.0, 1.0, 2, 2).unwrap();
        assert!(matches!(layer.forward(&input, &query), Err(OperatorError::Shape(_))));
    }
}
