//! Conversion between ragged function sets and dense, padded tensors.

use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::function::{FunctionSet, PointCloud};
use crate::tensor::{functional, Float, RcTensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadPolicy {
    /// Pad every function to the largest count with zeros and mark padding in the mask.
    #[default]
    ZeroPadWithMask,
    /// Refuse batches whose functions have different counts.
    ErrorOnRagged,
}

/// `coordinates: [B, N_max, d]`, `values: [B, N_max, m]`, `mask: [B, N_max]`
/// with `1` for real samples and `0` for padding.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseBatch<T: Float> {
    pub coordinates: RcTensor<T>,
    pub values: RcTensor<T>,
    pub mask: RcTensor<T>,
}

impl<T: Float> DenseBatch<T> {
    pub fn batch_size(&self) -> usize {
        self.mask.shape()[0]
    }

    pub fn max_count(&self) -> usize {
        self.mask.shape()[1]
    }
}

/// Pads `fs` into rectangular tensors.
///
/// Padding is a gather from the arena with one extra zero row appended, so
/// gradients reach the original values and never the padding.
pub fn to_dense<T: Float>(fs: &FunctionSet<T>, pad_policy: PadPolicy) -> Result<DenseBatch<T>> {
    let counts = fs.counts();
    let max_count = counts.iter().copied().max().unwrap_or(0);
    if pad_policy == PadPolicy::ErrorOnRagged && counts.iter().any(|&n| n != max_count) {
        return Err(OperatorError::RaggedBatch(format!(
            "functions have different sample counts {counts:?}"
        )));
    }
    let batch = fs.batch_size();
    let total = fs.points().len();
    let (d, m) = (fs.domain_dim(), fs.codomain_dim());

    let mut rows = Vec::with_capacity(batch * max_count);
    let mut mask = Vec::with_capacity(batch * max_count);
    for (b, &n) in counts.iter().enumerate() {
        let start = fs.offsets()[b];
        for i in 0..max_count {
            if i < n {
                rows.push(start + i);
                mask.push(T::one());
            } else {
                rows.push(total);
                mask.push(T::zero());
            }
        }
    }

    let pad = |tensor: &RcTensor<T>, width: usize| {
        let padded = functional::concat_rows(&[tensor.clone(), RcTensor::zeros(vec![1, width])]);
        functional::gather_rows(&padded, &rows).reshape(vec![batch, max_count, width])
    };
    Ok(DenseBatch {
        coordinates: pad(fs.coordinates(), d),
        values: pad(fs.values(), m),
        mask: RcTensor::new(mask, vec![batch, max_count]),
    })
}

/// Inverse of [`to_dense`]: keeps the rows whose mask entry is non-zero.
pub fn from_dense<T: Float>(
    coordinates: &RcTensor<T>,
    values: &RcTensor<T>,
    mask: &RcTensor<T>,
) -> Result<FunctionSet<T>> {
    let (c_shape, v_shape, m_shape) = (coordinates.shape(), values.shape(), mask.shape());
    if c_shape.len() != 3 || v_shape.len() != 3 || m_shape.len() != 2 {
        return Err(OperatorError::Shape(format!(
            "expected [B, N, d], [B, N, m] and [B, N], got {c_shape:?}, {v_shape:?} and {m_shape:?}"
        )));
    }
    if c_shape[..2] != m_shape[..] || v_shape[..2] != m_shape[..] {
        return Err(OperatorError::Shape(format!(
            "leading dimensions disagree: {c_shape:?}, {v_shape:?} and {m_shape:?}"
        )));
    }
    let (batch, max_count) = (m_shape[0], m_shape[1]);
    if batch == 0 {
        return Err(OperatorError::Shape("a dense batch needs at least one function".to_string()));
    }

    let mut rows = vec![];
    let mut offsets = vec![0];
    for b in 0..batch {
        for i in 0..max_count {
            let flat = b * max_count + i;
            if mask.array()[flat] != T::zero() {
                rows.push(flat);
            }
        }
        offsets.push(rows.len());
    }

    let unpad = |tensor: &RcTensor<T>, width: usize| {
        let flat = tensor.reshape(vec![batch * max_count, width]);
        functional::gather_rows(&flat, &rows)
    };
    let points = PointCloud::new(unpad(coordinates, c_shape[2]), offsets)?;
    FunctionSet::new(points, unpad(values, v_shape[2]))
}

/// `from_dense` on the parts of a [`DenseBatch`].
pub fn from_dense_batch<T: Float>(dense: &DenseBatch<T>) -> Result<FunctionSet<T>> {
    from_dense(&dense.coordinates, &dense.values, &dense.mask)
}
