use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::Uniform;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::function::{FunctionSet, PointCloud};
use crate::tensor::{Float, RcTensor};

/// An input function, the target it should map to, and optionally points
/// where a physics residual is enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample<T: Float> {
    pub input: FunctionSet<T>,
    pub target: FunctionSet<T>,
    pub collocation: Option<PointCloud<T>>,
}

impl<T: Float> TrainingExample<T> {
    pub fn new(input: FunctionSet<T>, target: FunctionSet<T>) -> Result<Self> {
        if input.batch_size() != target.batch_size() {
            return Err(OperatorError::Shape(format!(
                "{} input functions for {} targets",
                input.batch_size(),
                target.batch_size()
            )));
        }
        Ok(Self {
            input,
            target,
            collocation: None,
        })
    }

    pub fn with_collocation(mut self, points: PointCloud<T>) -> Result<Self> {
        if points.batch_size() != self.input.batch_size() {
            return Err(OperatorError::Shape(format!(
                "{} collocation sets for {} functions",
                points.batch_size(),
                self.input.batch_size()
            )));
        }
        self.collocation = Some(points);
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.input.batch_size()
    }

    /// Merges examples into one batch, functions kept in order.
    pub fn collate(examples: &[TrainingExample<T>]) -> Result<TrainingExample<T>> {
        if examples.len() == 1 {
            return Ok(examples[0].clone());
        }
        let inputs: Vec<FunctionSet<T>> = examples.iter().map(|e| e.input.clone()).collect();
        let targets: Vec<FunctionSet<T>> = examples.iter().map(|e| e.target.clone()).collect();
        let with_points = examples.iter().filter(|e| e.collocation.is_some()).count();
        let collocation = if with_points == 0 {
            None
        } else if with_points == examples.len() {
            let clouds: Vec<PointCloud<T>> = examples.iter().filter_map(|e| e.collocation.clone()).collect();
            Some(PointCloud::concat(&clouds)?)
        } else {
            return Err(OperatorError::Shape(
                "either every example of a batch has collocation points or none has".to_string(),
            ));
        };
        Ok(TrainingExample {
            input: FunctionSet::concat(&inputs)?,
            target: FunctionSet::concat(&targets)?,
            collocation,
        })
    }
}

/// A source of training examples, finite or not.
pub trait Dataset<T: Float> {
    /// Examples in storage order.
    fn iter(&self) -> Box<dyn Iterator<Item = TrainingExample<T>> + '_>;

    /// Examples in an order drawn from `rng`.
    fn shuffled(&self, _rng: &mut StdRng) -> Box<dyn Iterator<Item = TrainingExample<T>> + '_> {
        self.iter()
    }

    /// `None` for datasets without an end.
    fn len(&self) -> Option<usize>;

    fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryDataset<T: Float> {
    examples: Vec<TrainingExample<T>>,
}

impl<T: Float> InMemoryDataset<T> {
    /// All examples must share dimensions so that they can be batched.
    pub fn new(examples: Vec<TrainingExample<T>>) -> Result<Self> {
        if let Some(first) = examples.first() {
            let dims = |e: &TrainingExample<T>| {
                (
                    e.input.domain_dim(),
                    e.input.codomain_dim(),
                    e.target.domain_dim(),
                    e.target.codomain_dim(),
                )
            };
            if let Some(other) = examples.iter().find(|e| dims(e) != dims(first)) {
                return Err(OperatorError::Shape(format!(
                    "examples disagree on (d_in, m_in, d_out, m_out): {:?} and {:?}",
                    dims(first),
                    dims(other)
                )));
            }
        }
        Ok(Self { examples })
    }

    pub fn examples(&self) -> &[TrainingExample<T>] {
        &self.examples
    }
}

impl<T: Float> Dataset<T> for InMemoryDataset<T> {
    fn iter(&self) -> Box<dyn Iterator<Item = TrainingExample<T>> + '_> {
        Box::new(self.examples.iter().cloned())
    }

    fn shuffled(&self, rng: &mut StdRng) -> Box<dyn Iterator<Item = TrainingExample<T>> + '_> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        order.shuffle(rng);
        Box::new(order.into_iter().map(move |i| self.examples[i].clone()))
    }

    fn len(&self) -> Option<usize> {
        Some(self.examples.len())
    }
}

/// An endless stream of examples drawn by a generator function.
pub struct GeneratedDataset<T: Float> {
    seed: u64,
    generate: Box<dyn Fn(&mut StdRng) -> TrainingExample<T>>,
}

impl<T: Float> GeneratedDataset<T> {
    pub fn new(seed: u64, generate: Box<dyn Fn(&mut StdRng) -> TrainingExample<T>>) -> Self {
        Self { seed, generate }
    }

    fn stream(&self, seed: u64) -> Box<dyn Iterator<Item = TrainingExample<T>> + '_> {
        let mut rng = StdRng::seed_from_u64(seed);
        Box::new(std::iter::repeat_with(move || (self.generate)(&mut rng)))
    }
}

impl<T: Float> Dataset<T> for GeneratedDataset<T> {
    fn iter(&self) -> Box<dyn Iterator<Item = TrainingExample<T>> + '_> {
        self.stream(self.seed)
    }

    fn shuffled(&self, rng: &mut StdRng) -> Box<dyn Iterator<Item = TrainingExample<T>> + '_> {
        self.stream(rng.gen())
    }

    fn len(&self) -> Option<usize> {
        None
    }
}

/// Scaled sines `u(x) = a sin(x)` mapped to `v(y) = a sin(y)` on `[-pi, pi]`.
///
/// Sensors sit on a uniform grid; evaluation points are drawn uniformly, so
/// they are held out from the sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SineBenchmark {
    pub num_functions: usize,
    pub num_sensors: usize,
    pub num_evaluations: usize,
    pub amplitude: (f64, f64),
}

impl Default for SineBenchmark {
    fn default() -> Self {
        Self {
            num_functions: 16,
            num_sensors: 32,
            num_evaluations: 32,
            amplitude: (0.5, 1.5),
        }
    }
}

impl SineBenchmark {
    pub fn validate(&self) -> Result<()> {
        if self.num_functions == 0 || self.num_sensors == 0 || self.num_evaluations == 0 {
            return Err(OperatorError::InvalidConfig(
                "sine benchmark needs functions, sensors and evaluation points".to_string(),
            ));
        }
        if self.amplitude.0 >= self.amplitude.1 {
            return Err(OperatorError::InvalidConfig(format!(
                "empty amplitude range {:?}",
                self.amplitude
            )));
        }
        Ok(())
    }

    /// One function per example.
    pub fn generate<T: Float, R: Rng + ?Sized>(&self, rng: &mut R) -> Result<InMemoryDataset<T>> {
        self.validate()?;
        let pi = std::f64::consts::PI;
        let amplitudes = Uniform::new(self.amplitude.0, self.amplitude.1);
        let positions = Uniform::new_inclusive(-pi, pi);
        let sensors = PointCloud::linspace(T::cast(-pi), T::cast(pi), self.num_sensors, 1)?;
        let examples = (0..self.num_functions)
            .map(|_| {
                let a = rng.sample(&amplitudes);
                let input = sampled_sine(&sensors, a)?;
                let mut ys: Vec<f64> = (0..self.num_evaluations).map(|_| rng.sample(&positions)).collect();
                ys.sort_by(f64::total_cmp);
                let query = PointCloud::new(
                    RcTensor::new(ys.iter().map(|&y| T::cast(y)).collect(), vec![ys.len(), 1]),
                    vec![0, ys.len()],
                )?;
                let target = sampled_sine(&query, a)?;
                TrainingExample::new(input, target)
            })
            .collect::<Result<Vec<_>>>()?;
        InMemoryDataset::new(examples)
    }
}

fn sampled_sine<T: Float>(points: &PointCloud<T>, amplitude: f64) -> Result<FunctionSet<T>> {
    let values = points
        .coordinates()
        .array()
        .iter()
        .map(|&x| T::cast(amplitude) * x.sin())
        .collect();
    FunctionSet::new(points.clone(), RcTensor::new(values, vec![points.len(), 1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(value: f64) -> TrainingExample<f64> {
        let fs = FunctionSet::from_samples(vec![vec![vec![0.0]]], vec![vec![vec![value]]]).unwrap();
        TrainingExample::new(fs.clone(), fs).unwrap()
    }

    #[test]
    fn test_collate_keeps_order() {
        let batch = TrainingExample::collate(&[example(1.0), example(2.0), example(3.0)]).unwrap();
        assert_eq!(batch.batch_size(), 3);
        assert_eq!(batch.input.values().array(), &[1.0, 2.0, 3.0]);
        assert!(batch.collocation.is_none());
    }

    #[test]
    fn test_collate_rejects_partial_collocation() {
        let points = PointCloud::from_points(vec![vec![vec![0.5]]]).unwrap();
        let with = example(1.0).with_collocation(points).unwrap();
        assert!(TrainingExample::collate(&[with, example(2.0)]).is_err());
    }

    #[test]
    fn test_shuffle_is_seeded_permutation() {
        let data = InMemoryDataset::new((0..8).map(|i| example(i as f64)).collect()).unwrap();
        let first: Vec<f64> = data
            .shuffled(&mut StdRng::seed_from_u64(5))
            .map(|e| e.input.values().array()[0])
            .collect();
        let second: Vec<f64> = data
            .shuffled(&mut StdRng::seed_from_u64(5))
            .map(|e| e.input.values().array()[0])
            .collect();
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(sorted, (0..8).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_generated_dataset_is_endless() {
        let data = GeneratedDataset::new(1, Box::new(|rng: &mut StdRng| example(rng.gen())));
        assert_eq!(data.len(), None);
        assert_eq!(data.iter().take(50).count(), 50);
        let a: Vec<_> = data.iter().take(3).collect();
        let b: Vec<_> = data.iter().take(3).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sine_benchmark() {
        let bench = SineBenchmark {
            num_functions: 3,
            num_sensors: 20,
            num_evaluations: 5,
            ..SineBenchmark::default()
        };
        let data: InMemoryDataset<f64> = bench.generate(&mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(data.len(), Some(3));
        let first = &data.examples()[0];
        assert_eq!(first.input.counts(), vec![20]);
        assert_eq!(first.target.counts(), vec![5]);
        // v / sin(y) recovers the same amplitude as u / sin(x)
        let x = first.input.coordinates().array()[3];
        let a = first.input.values().array()[3] / x.sin();
        let y = first.target.coordinates().array()[0];
        assert!((first.target.values().array()[0] - a * y.sin()).abs() < 1e-9);
    }
}
