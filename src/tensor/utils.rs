use itertools::EitherOrBoth::{Both, Left, Right};
use itertools::Itertools;
use std::cmp::max;

use crate::tensor::numeric::Numeric;
use crate::tensor::{IndexType, RawTensor};

pub struct IndexIterator {
    index: Vec<usize>,
    dimensions: Vec<usize>,
    first: bool,
    done: bool,
}

impl IndexIterator {
    pub fn new(dimensions: Vec<usize>) -> IndexIterator {
        // a zero sized dimension means there is nothing to visit
        let done = dimensions.iter().any(|&dim| dim == 0);
        IndexIterator {
            index: vec![0; dimensions.len()],
            dimensions,
            first: true,
            done,
        }
    }
}

impl Iterator for IndexIterator {
    type Item = Vec<usize>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.first {
            self.first = false;
            return Some(self.index.clone());
        }
        if increment_index(&mut self.index, &self.dimensions) {
            return Some(self.index.clone());
        }
        self.done = true;
        None
    }
}

pub fn increment_index(index: &mut [usize], shape: &[usize]) -> bool {
    let mut carry = 1;
    for i in (0..index.len()).rev() {
        let v = index[i];
        let dim = shape[i];
        if v + 1 < dim && carry > 0 {
            index[i] = v + 1;
            carry -= 1;
        }
        if carry == 0 {
            reset_trailing_indices(index, i);
            return true;
        }
    }
    false
}

fn reset_trailing_indices(index: &mut [usize], position: usize) {
    for idx in index.iter_mut().skip(position + 1) {
        *idx = 0;
    }
}

/// Row-major offset of `index` into a tensor of `shape`, broadcasting along
/// any dimension of size one. `index` may be longer than `shape`, in which case
/// the leading entries are ignored.
pub fn global_index(index: IndexType, shape: IndexType) -> usize {
    let mut global_idx = 0;
    let mut multiplier = 1;
    for (&dim, &idx_dim) in shape.iter().rev().zip(index.iter().rev()) {
        if dim == 1 {
            // we pick the 0th element during broadcasting
            continue;
        }
        debug_assert!(idx_dim < dim, "index {index:?} out of bounds for {shape:?}");
        global_idx += idx_dim * multiplier;
        multiplier *= dim;
    }
    global_idx
}

/// The shape two operands broadcast to, or `None` when they are incompatible.
pub fn broadcast_shape(left_shape: IndexType, right_shape: IndexType) -> Option<Vec<usize>> {
    let mut max_shape = Vec::with_capacity(max(left_shape.len(), right_shape.len()));

    for pair in left_shape
        .iter()
        .rev()
        .zip_longest(right_shape.iter().rev())
        .rev()
    {
        let dim = match pair {
            Both(&l, &r) if l == r || r == 1 => l,
            Both(&l, &r) if l == 1 => r,
            Both(_, _) => return None,
            Left(&l) => l,
            Right(&r) => r,
        };
        max_shape.push(dim);
    }
    Some(max_shape)
}

/// Sums a broadcast gradient back down to the shape of the operand it came from.
pub(in crate::tensor) fn reduce_to_shape<T: Numeric>(
    grad: &RawTensor<T>,
    shape: IndexType,
) -> RawTensor<T> {
    if grad.shape() == shape {
        return RawTensor::new(grad.array.clone(), shape.to_vec());
    }
    let mut array = vec![T::zero(); shape.iter().product()];
    for (idx, &value) in IndexIterator::new(grad.shape().to_vec()).zip(grad.array.iter()) {
        array[global_index(&idx, shape)] += value;
    }
    RawTensor::new(array, shape.to_vec())
}

#[test]
fn test_increment_index() {
    let mut index = vec![0, 0, 0];
    let dimensions = vec![2, 3, 2];
    let indices = vec![
        [0, 0, 1].to_vec(),
        [0, 1, 0].to_vec(),
        [0, 1, 1].to_vec(),
        [0, 2, 0].to_vec(),
        [0, 2, 1].to_vec(),
        [1, 0, 0].to_vec(),
        [1, 0, 1].to_vec(),
        [1, 1, 0].to_vec(),
        [1, 1, 1].to_vec(),
        [1, 2, 0].to_vec(),
        [1, 2, 1].to_vec(),
    ];
    for expected_idx in indices.into_iter() {
        let valid = increment_index(&mut index, &dimensions);
        assert!(valid);
        assert_eq!(index, expected_idx);
    }
    assert!(!increment_index(&mut index, &dimensions));
}

#[test]
fn test_index_iterator() {
    let index_iter = IndexIterator::new(vec![2, 2, 2]);
    assert_eq!(
        index_iter.collect::<Vec<_>>(),
        vec![
            [0, 0, 0].to_vec(),
            [0, 0, 1].to_vec(),
            [0, 1, 0].to_vec(),
            [0, 1, 1].to_vec(),
            [1, 0, 0].to_vec(),
            [1, 0, 1].to_vec(),
            [1, 1, 0].to_vec(),
            [1, 1, 1].to_vec(),
        ]
    );
}

#[test]
fn test_index_iterator_edge_shapes() {
    assert_eq!(IndexIterator::new(vec![]).count(), 1);
    assert_eq!(IndexIterator::new(vec![3, 0, 2]).count(), 0);
}

#[test]
fn test_broadcast_shape() {
    assert_eq!(broadcast_shape(&[4, 3], &[1, 3]), Some(vec![4, 3]));
    assert_eq!(broadcast_shape(&[2, 4, 4], &[4, 4]), Some(vec![2, 4, 4]));
    assert_eq!(broadcast_shape(&[], &[5, 2]), Some(vec![5, 2]));
    assert_eq!(broadcast_shape(&[4, 3], &[4, 2]), None);
}

#[test]
fn test_reduce_to_shape() {
    let grad = RawTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]);
    let row = reduce_to_shape(&grad, &[1, 2]);
    assert_eq!(row.array, vec![9.0, 12.0]);
    let scalar = reduce_to_shape(&grad, &[]);
    assert_eq!(scalar.array, vec![21.0]);
}
