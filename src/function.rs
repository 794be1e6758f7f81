use itertools::Itertools;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::tensor::{functional, Float, RcTensor};

/// Sampling points of a batch of functions.
///
/// All points live in one `[total, d]` tensor; function `b` owns rows
/// `offsets[b]..offsets[b + 1]`. Cloning shares the coordinate tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud<T: Float> {
    coordinates: RcTensor<T>,
    offsets: Vec<usize>,
}

impl<T: Float> PointCloud<T> {
    pub fn new(coordinates: RcTensor<T>, offsets: Vec<usize>) -> Result<Self> {
        if coordinates.shape().len() != 2 {
            return Err(OperatorError::Shape(format!(
                "coordinates must be [points, dim], got {:?}",
                coordinates.shape()
            )));
        }
        if offsets.len() < 2 || offsets[0] != 0 {
            return Err(OperatorError::Shape(format!(
                "offsets must start at 0 and describe at least one function, got {offsets:?}"
            )));
        }
        if offsets.iter().tuple_windows().any(|(a, b)| a > b) {
            return Err(OperatorError::Shape(format!(
                "offsets must be non-decreasing, got {offsets:?}"
            )));
        }
        let total = coordinates.shape()[0];
        if offsets[offsets.len() - 1] != total {
            return Err(OperatorError::Shape(format!(
                "offsets end at {} but there are {total} points",
                offsets[offsets.len() - 1]
            )));
        }
        Ok(PointCloud {
            coordinates,
            offsets,
        })
    }

    /// One list of `d`-vectors per function.
    pub fn from_points(points: Vec<Vec<Vec<T>>>) -> Result<Self> {
        if points.is_empty() {
            return Err(OperatorError::Shape(
                "can not infer the domain dimension of an empty batch".to_string(),
            ));
        }
        let dim = infer_width(&points, "coordinate")?;
        let mut offsets = vec![0];
        let mut array = vec![];
        for function in points {
            offsets.push(offsets[offsets.len() - 1] + function.len());
            array.extend(function.into_iter().flatten());
        }
        let total = offsets[offsets.len() - 1];
        PointCloud::new(RcTensor::new(array, vec![total, dim]), offsets)
    }

    /// The same `[n, d]` grid repeated for every function of the batch.
    pub fn shared(grid: &RcTensor<T>, batch_size: usize) -> Result<Self> {
        if grid.shape().len() != 2 || batch_size == 0 {
            return Err(OperatorError::Shape(format!(
                "a shared grid needs a [points, dim] tensor and a non-empty batch, got {:?} x {batch_size}",
                grid.shape()
            )));
        }
        let n = grid.shape()[0];
        let rows: Vec<usize> = (0..batch_size).flat_map(|_| 0..n).collect();
        let offsets = (0..=batch_size).map(|b| b * n).collect();
        PointCloud::new(functional::gather_rows(&grid.detach(), &rows), offsets)
    }

    /// `count` evenly spaced points on `[low, high]` for each function, `d = 1`.
    pub fn linspace(low: T, high: T, count: usize, batch_size: usize) -> Result<Self> {
        let step = if count > 1 {
            (high - low) / T::cast((count - 1) as f64)
        } else {
            T::zero()
        };
        let grid = (0..count).map(|i| low + step * T::cast(i as f64)).collect();
        PointCloud::shared(&RcTensor::new(grid, vec![count, 1]), batch_size)
    }

    pub fn coordinates(&self) -> &RcTensor<T> {
        &self.coordinates
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn batch_size(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn dim(&self) -> usize {
        self.coordinates.shape()[1]
    }

    /// Number of points over the whole batch.
    pub fn len(&self) -> usize {
        self.coordinates.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> Vec<usize> {
        self.offsets
            .iter()
            .tuple_windows()
            .map(|(start, end)| end - start)
            .collect()
    }

    /// For every point, the index of the function it belongs to.
    pub fn owners(&self) -> Vec<usize> {
        self.counts()
            .into_iter()
            .enumerate()
            .flat_map(|(b, count)| std::iter::repeat(b).take(count))
            .collect()
    }

    /// Points of function `b` as `[N_b, d]`.
    pub fn function(&self, b: usize) -> RcTensor<T> {
        let rows: Vec<usize> = (self.offsets[b]..self.offsets[b + 1]).collect();
        functional::gather_rows(&self.coordinates, &rows)
    }

    /// Every point moved by `delta` along `axis`.
    pub fn shifted(&self, axis: usize, delta: T) -> PointCloud<T> {
        let dim = self.dim();
        assert!(axis < dim, "axis {axis} out of range for dimension {dim}");
        let mut shift = vec![T::zero(); dim];
        shift[axis] = delta;
        PointCloud {
            coordinates: &self.coordinates + &RcTensor::new(shift, vec![1, dim]),
            offsets: self.offsets.clone(),
        }
    }

    /// Same counts and same coordinates, point for point.
    pub fn same_points(&self, other: &PointCloud<T>) -> bool {
        self.offsets == other.offsets
            && self.coordinates.shape() == other.coordinates.shape()
            && self.coordinates.array() == other.coordinates.array()
    }

    /// Stacks several clouds into one batch, functions kept in order.
    pub fn concat(clouds: &[PointCloud<T>]) -> Result<PointCloud<T>> {
        let first = clouds.first().ok_or_else(|| {
            OperatorError::Shape("can not concatenate an empty list of point clouds".to_string())
        })?;
        if let Some(other) = clouds.iter().find(|c| c.dim() != first.dim()) {
            return Err(OperatorError::Shape(format!(
                "domain dimensions differ: {} and {}",
                first.dim(),
                other.dim()
            )));
        }
        let mut offsets = vec![0];
        for cloud in clouds {
            let base = offsets[offsets.len() - 1];
            offsets.extend(cloud.offsets[1..].iter().map(|o| base + o));
        }
        let coordinates: Vec<RcTensor<T>> = clouds.iter().map(|c| c.coordinates.clone()).collect();
        PointCloud::new(functional::concat_rows(&coordinates), offsets)
    }

    fn select_rows(&self, rows: &[usize], offsets: Vec<usize>) -> PointCloud<T> {
        PointCloud {
            coordinates: functional::gather_rows(&self.coordinates, rows),
            offsets,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsampleStrategy {
    /// `count` distinct points drawn uniformly, original order kept.
    #[default]
    UniformRandom,
    /// `count` evenly spaced points, always starting with the first.
    FixedStride,
    /// Every point; `count` is ignored.
    All,
}

/// A batch of `B` functions sampled at (possibly different) points.
///
/// `values` holds one `m`-vector per point, rows aligned with the
/// coordinates of `points`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSet<T: Float> {
    points: PointCloud<T>,
    values: RcTensor<T>,
}

impl<T: Float> FunctionSet<T> {
    pub fn new(points: PointCloud<T>, values: RcTensor<T>) -> Result<Self> {
        if values.shape().len() != 2 {
            return Err(OperatorError::Shape(format!(
                "values must be [points, channels], got {:?}",
                values.shape()
            )));
        }
        if values.shape()[0] != points.len() {
            return Err(OperatorError::Shape(format!(
                "{} value rows for {} points",
                values.shape()[0],
                points.len()
            )));
        }
        Ok(FunctionSet { points, values })
    }

    /// Builds a batch from nested samples: `coordinates[b][i]` is the `i`-th
    /// point of function `b` and `values[b][i]` the value there.
    pub fn from_samples(coordinates: Vec<Vec<Vec<T>>>, values: Vec<Vec<Vec<T>>>) -> Result<Self> {
        if coordinates.len() != values.len() {
            return Err(OperatorError::Shape(format!(
                "{} coordinate lists for {} value lists",
                coordinates.len(),
                values.len()
            )));
        }
        for (b, (x, u)) in coordinates.iter().zip(values.iter()).enumerate() {
            if x.len() != u.len() {
                return Err(OperatorError::Shape(format!(
                    "function {b} has {} coordinates but {} values",
                    x.len(),
                    u.len()
                )));
            }
        }
        let points = PointCloud::from_points(coordinates)?;
        let channels = infer_width(&values, "value")?;
        let array: Vec<T> = values.into_iter().flatten().flatten().collect();
        let values = RcTensor::new(array, vec![points.len(), channels]);
        FunctionSet::new(points, values)
    }

    pub fn points(&self) -> &PointCloud<T> {
        &self.points
    }

    pub fn coordinates(&self) -> &RcTensor<T> {
        self.points.coordinates()
    }

    pub fn values(&self) -> &RcTensor<T> {
        &self.values
    }

    pub fn offsets(&self) -> &[usize] {
        self.points.offsets()
    }

    pub fn counts(&self) -> Vec<usize> {
        self.points.counts()
    }

    pub fn batch_size(&self) -> usize {
        self.points.batch_size()
    }

    pub fn domain_dim(&self) -> usize {
        self.points.dim()
    }

    pub fn codomain_dim(&self) -> usize {
        self.values.shape()[1]
    }

    /// Values of function `b` as `[N_b, m]`.
    pub fn function_values(&self, b: usize) -> RcTensor<T> {
        let rows: Vec<usize> = (self.offsets()[b]..self.offsets()[b + 1]).collect();
        functional::gather_rows(&self.values, &rows)
    }

    /// Applies `f` to the value tensor, keeping the points.
    pub fn map_values<F>(&self, f: F) -> Result<FunctionSet<T>>
    where
        F: FnOnce(&RcTensor<T>) -> RcTensor<T>,
    {
        let values = f(&self.values);
        if values.shape().len() != 2 || values.shape()[0] != self.values.shape()[0] {
            return Err(OperatorError::Shape(format!(
                "map_values must keep {} rows, got {:?}",
                self.values.shape()[0],
                values.shape()
            )));
        }
        FunctionSet::new(self.points.clone(), values)
    }

    /// A new set with `count` points per function.
    pub fn subsample<R: Rng + ?Sized>(
        &self,
        count: usize,
        strategy: SubsampleStrategy,
        rng: &mut R,
    ) -> Result<FunctionSet<T>> {
        if strategy == SubsampleStrategy::All {
            return Ok(self.clone());
        }
        let counts = self.counts();
        if let Some((b, n)) = counts.iter().find_position(|&&n| n < count) {
            return Err(OperatorError::Shape(format!(
                "function {b} has {n} points, can not keep {count}"
            )));
        }
        let mut rows = Vec::with_capacity(count * counts.len());
        for (b, &n) in counts.iter().enumerate() {
            let start = self.offsets()[b];
            match strategy {
                SubsampleStrategy::UniformRandom => {
                    let mut picked = index::sample(rng, n, count).into_vec();
                    picked.sort_unstable();
                    rows.extend(picked.into_iter().map(|i| start + i));
                }
                SubsampleStrategy::FixedStride => {
                    rows.extend((0..count).map(|i| start + i * n / count));
                }
                SubsampleStrategy::All => unreachable!(),
            }
        }
        let offsets = (0..=counts.len()).map(|b| b * count).collect();
        Ok(FunctionSet {
            points: self.points.select_rows(&rows, offsets),
            values: functional::gather_rows(&self.values, &rows),
        })
    }

    /// Stacks several sets into one batch.
    pub fn concat(sets: &[FunctionSet<T>]) -> Result<FunctionSet<T>> {
        let first = sets.first().ok_or_else(|| {
            OperatorError::Shape("can not concatenate an empty list of function sets".to_string())
        })?;
        if let Some(other) = sets.iter().find(|s| s.codomain_dim() != first.codomain_dim()) {
            return Err(OperatorError::Shape(format!(
                "codomain dimensions differ: {} and {}",
                first.codomain_dim(),
                other.codomain_dim()
            )));
        }
        let clouds: Vec<PointCloud<T>> = sets.iter().map(|s| s.points.clone()).collect();
        let values: Vec<RcTensor<T>> = sets.iter().map(|s| s.values.clone()).collect();
        FunctionSet::new(PointCloud::concat(&clouds)?, functional::concat_rows(&values))
    }

    /// Drops the autograd history of the values.
    pub fn detach(&self) -> FunctionSet<T> {
        FunctionSet {
            points: self.points.clone(),
            values: self.values.detach(),
        }
    }

    /// Same points and values within `tolerance`.
    pub fn approx_eq(&self, other: &FunctionSet<T>, tolerance: T) -> bool {
        self.points.same_points(&other.points)
            && self.values.shape() == other.values.shape()
            && self
                .values
                .array()
                .iter()
                .zip(other.values.array().iter())
                .all(|(a, b)| (*a - *b).abs() <= tolerance)
    }
}

/// Width shared by every sample of a nested batch.
fn infer_width<T>(batch: &[Vec<Vec<T>>], what: &str) -> Result<usize> {
    let mut widths = batch.iter().flatten().map(|sample| sample.len()).dedup();
    let width = widths.next().ok_or_else(|| {
        OperatorError::Shape(format!("can not infer the {what} dimension without samples"))
    })?;
    if let Some(other) = widths.next() {
        return Err(OperatorError::Shape(format!(
            "inconsistent {what} dimension: {width} and {other}"
        )));
    }
    Ok(width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ragged() -> FunctionSet<f64> {
        FunctionSet::from_samples(
            vec![
                vec![vec![0.0], vec![0.5], vec![1.0]],
                vec![vec![0.0], vec![1.0]],
            ],
            vec![
                vec![vec![1.0], vec![2.0], vec![3.0]],
                vec![vec![4.0], vec![5.0]],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_from_samples_layout() {
        let fs = ragged();
        assert_eq!(fs.batch_size(), 2);
        assert_eq!(fs.domain_dim(), 1);
        assert_eq!(fs.codomain_dim(), 1);
        assert_eq!(fs.offsets(), &[0, 3, 5]);
        assert_eq!(fs.counts(), vec![3, 2]);
        assert_eq!(fs.points().owners(), vec![0, 0, 0, 1, 1]);
        assert_eq!(fs.function_values(1).array(), &[4.0, 5.0]);
    }

    #[test]
    fn test_points_reject_bad_offsets() {
        let coordinates = RcTensor::new(vec![0.0, 1.0], vec![2, 1]);
        assert!(PointCloud::new(coordinates.clone(), vec![0, 3]).is_err());
        assert!(PointCloud::new(coordinates.clone(), vec![1, 2]).is_err());
        assert!(PointCloud::new(coordinates.clone(), vec![0, 2, 1, 2]).is_err());
        assert!(PointCloud::new(coordinates, vec![0, 1, 2]).is_ok());
    }

    #[test]
    fn test_map_values_keeps_points() {
        let fs = ragged();
        let doubled = fs.map_values(|v| v.scale(2.0)).unwrap();
        assert_eq!(doubled.values().array(), &[2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_eq!(doubled.coordinates(), fs.coordinates());
        assert!(fs.map_values(|v| v.sum().reshape(vec![1, 1])).is_err());
    }

    #[test]
    fn test_subsample_strategies() {
        let fs = ragged();
        let mut rng = StdRng::seed_from_u64(3);
        let strided = fs.subsample(2, SubsampleStrategy::FixedStride, &mut rng).unwrap();
        assert_eq!(strided.counts(), vec![2, 2]);
        assert_eq!(strided.values().array(), &[1.0, 2.0, 4.0, 5.0]);

        let random = fs.subsample(1, SubsampleStrategy::UniformRandom, &mut rng).unwrap();
        assert_eq!(random.counts(), vec![1, 1]);
        assert!([1.0, 2.0, 3.0].contains(&random.values().array()[0]));
        assert!([4.0, 5.0].contains(&random.values().array()[1]));

        assert_eq!(fs.subsample(99, SubsampleStrategy::All, &mut rng).unwrap(), fs);
        assert!(matches!(
            fs.subsample(3, SubsampleStrategy::FixedStride, &mut rng),
            Err(OperatorError::Shape(_))
        ));
    }

    #[test]
    fn test_subsample_is_seeded() {
        let fs = ragged();
        let a = fs
            .subsample(2, SubsampleStrategy::UniformRandom, &mut StdRng::seed_from_u64(9))
            .unwrap();
        let b = fs
            .subsample(2, SubsampleStrategy::UniformRandom, &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_concat_and_shift() {
        let fs = ragged();
        let both = FunctionSet::concat(&[fs.clone(), fs.clone()]).unwrap();
        assert_eq!(both.offsets(), &[0, 3, 5, 8, 10]);
        let moved = fs.points().shifted(0, 0.25);
        assert_eq!(moved.coordinates().array(), &[0.25, 0.75, 1.25, 0.25, 1.25]);
        assert!(!moved.same_points(fs.points()));
    }

    #[test]
    fn test_linspace_and_shared() {
        let grid = PointCloud::<f64>::linspace(0.0, 1.0, 3, 2).unwrap();
        assert_eq!(grid.counts(), vec![3, 3]);
        assert_eq!(grid.coordinates().array(), &[0.0, 0.5, 1.0, 0.0, 0.5, 1.0]);
    }
}
