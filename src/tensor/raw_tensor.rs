use std::cell::RefCell;
use std::cmp::PartialEq;
use std::convert::From;

use super::autograd::Derivative;
use super::numeric::*;
use super::rc_tensor::*;
use super::utils::*;
use super::IndexType;

/// The storage behind every `RcTensor`: a dense row-major array plus the
/// autograd bookkeeping.
#[derive(Clone)]
pub struct RawTensor<T>
where
    T: Numeric,
{
    pub(in crate::tensor) array: Vec<T>,
    pub(in crate::tensor) shape: Vec<usize>,
    pub(in crate::tensor) grad: RefCell<Option<RcTensor<T>>>,
    pub(in crate::tensor) grad_fn: Option<Derivative<T>>,
    pub(in crate::tensor) requires_grad: bool,
}

impl<T: Numeric> PartialEq for RawTensor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.array == other.array
    }
}

impl<T: Numeric> std::fmt::Debug for RawTensor<T> {
    // the backward graph is left out, it can be arbitrarily deep
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTensor")
            .field("shape", &self.shape)
            .field("array", &self.array)
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

impl<T> Default for RawTensor<T>
where
    T: Numeric,
{
    fn default() -> Self {
        RawTensor {
            shape: vec![],
            grad: RefCell::new(None),
            array: vec![],
            grad_fn: None,
            requires_grad: false,
        }
    }
}

impl<T, U> From<Vec<U>> for RawTensor<T>
where
    T: Numeric,
    RawTensor<T>: From<U>,
{
    fn from(value: Vec<U>) -> RawTensor<T> {
        let tensors: Vec<_> = value.into_iter().map(RawTensor::from).collect();
        let (arrays, shapes): (Vec<_>, Vec<_>) =
            tensors.into_iter().map(|t| (t.array, t.shape)).unzip();
        let valid = shapes.iter().all(|shape| *shape == shapes[0]);
        assert!(valid, "nested arrays must all have the same shape");

        let array = arrays.into_iter().flatten().collect();
        let mut shape = vec![shapes.len()];
        shape.extend_from_slice(shapes.first().map(|s| s.as_slice()).unwrap_or(&[]));
        RawTensor {
            array,
            shape,
            ..Default::default()
        }
    }
}

impl<T, U, const N: usize> From<[U; N]> for RawTensor<T>
where
    T: Numeric,
    RawTensor<T>: From<U>,
    U: Clone,
{
    fn from(value: [U; N]) -> RawTensor<T> {
        From::from(value.to_vec())
    }
}

impl<T> From<T> for RawTensor<T>
where
    T: Numeric,
{
    fn from(value: T) -> Self {
        RawTensor {
            array: vec![value],
            shape: vec![],
            ..Default::default()
        }
    }
}

impl<T> RawTensor<T>
where
    T: Numeric,
{
    pub fn new(array: Vec<T>, shape: Vec<usize>) -> RawTensor<T> {
        let len = shape.iter().product::<usize>();
        assert_eq!(
            len,
            array.len(),
            "shape {shape:?} needs {len} elements but got {}",
            array.len()
        );
        RawTensor {
            array,
            shape,
            ..Default::default()
        }
    }

    /// Note! This function will construct Scalars
    pub fn new_with_filler(shape: Vec<usize>, filler: T) -> RawTensor<T> {
        let total = shape.iter().product::<usize>();
        RawTensor {
            array: vec![filler; total],
            shape,
            ..Default::default()
        }
    }

    pub fn scalar(scalar: T) -> RawTensor<T> {
        RawTensor::from(scalar)
    }

    pub fn is_scalar(&self) -> bool {
        self.array.len() == 1 && self.shape.is_empty()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn count(&self) -> usize {
        self.array.len()
    }

    /// The underlying row-major storage.
    pub fn array(&self) -> &[T] {
        &self.array
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// The single value of a tensor holding exactly one element.
    pub fn elem(&self) -> T {
        assert_eq!(
            self.array.len(),
            1,
            "elem() needs a single element tensor, got shape {:?}",
            self.shape
        );
        self.array[0]
    }

    /// ```
    /// # use rust_operator::tensor::*;
    /// let v = vec![0, 1, 2, 3];
    /// let matrix = RcTensor::new(v, vec![2, 2]);
    /// let tensor = RcTensor::new((0..16).collect(), vec![2, 2, 1, 2, 2]);
    ///
    /// assert_eq!(matrix.get(&[0, 1]), matrix.get(&[0, 0, 1]));
    /// assert_eq!(tensor.get(&[0, 0, 0, 0, 1]), tensor.get(&[0, 0, 10, 0, 1]));
    /// assert!(matrix.get(&[2, 0]).is_err());
    /// ```
    pub fn get(&self, index: IndexType) -> Result<&T, String> {
        if index.len() < self.shape.len() {
            return Err(format!(
                "shapes do not match: self.shape={:?}, index={:?}
                Need index to be at least as long as shape.",
                self.shape, index,
            ));
        }
        for (i, (&dim, &idx_dim)) in self.shape.iter().rev().zip(index.iter().rev()).enumerate() {
            if dim != 1 && dim <= idx_dim {
                return Err(format!(
                    "shape do not match -- tensor has dimension:
                    {:?}
                    index is:
                    {:?}
                    the {}th position is out-of-bounds!",
                    self.shape,
                    index,
                    self.shape.len() - i - 1,
                ));
            }
        }
        Ok(&self.array[global_index(index, &self.shape)])
    }

    pub(in crate::tensor) fn map(&self, f: impl Fn(T) -> T) -> RawTensor<T> {
        RawTensor::new(self.array.iter().map(|&x| f(x)).collect(), self.shape.clone())
    }

    /// Elementwise combination with numpy style broadcasting.
    pub(in crate::tensor) fn zip_broadcast(
        &self,
        right: &RawTensor<T>,
        f: impl Fn(T, T) -> T,
    ) -> RawTensor<T> {
        if self.shape == right.shape {
            let array = self
                .array
                .iter()
                .zip(right.array.iter())
                .map(|(&x, &y)| f(x, y))
                .collect();
            return RawTensor::new(array, self.shape.clone());
        }
        let max_shape = broadcast_shape(&self.shape, &right.shape).unwrap_or_else(|| {
            panic!(
                "shapes {:?} and {:?} can not be broadcast together",
                self.shape, right.shape
            )
        });
        let mut array = Vec::with_capacity(max_shape.iter().product());
        for idx in IndexIterator::new(max_shape.clone()) {
            let x = self.array[global_index(&idx, &self.shape)];
            let y = right.array[global_index(&idx, &right.shape)];
            array.push(f(x, y));
        }
        RawTensor::new(array, max_shape)
    }

    /// A plain copy of the data, cut loose from the graph.
    pub(in crate::tensor) fn detached(&self) -> RawTensor<T> {
        RawTensor::new(self.array.clone(), self.shape.clone())
    }
}

impl<T: Numeric> std::ops::Index<IndexType<'_>> for RawTensor<T> {
    type Output = T;

    fn index(&self, index: IndexType) -> &Self::Output {
        match self.get(index) {
            Ok(value) => value,
            Err(e) => panic!("{}", e),
        }
    }
}

#[test]
fn test_new_with_filler() {
    let vec = RawTensor::new_with_filler(vec![4], 4);
    assert_eq!(vec.shape(), &[4]);
    assert_eq!(vec.get(&[0]).unwrap(), &4);
    assert!(RawTensor::new_with_filler(vec![], 7).is_scalar());
}

#[test]
fn test_get_2x2x2() {
    let matrix = RawTensor::new(vec![0, 1, 2, 3, 4, 5, 6, 7], vec![2, 2, 2]);
    assert_eq!(*matrix.get(&[0, 0, 0]).unwrap(), 0);
    assert_eq!(*matrix.get(&[0, 1, 0]).unwrap(), 2);
    assert_eq!(*matrix.get(&[1, 1, 1]).unwrap(), 7);
    assert_eq!(matrix[&[1, 0, 1][..]], 5);
}

#[test]
fn test_from_nested_arrays() {
    let tensor: RawTensor<i32> = RawTensor::from([[0, 1, 2], [3, 4, 5]]);
    assert_eq!(tensor, RawTensor::new((0..6).collect(), vec![2, 3]));
}

#[test]
fn test_zip_broadcast_row() {
    let matrix = RawTensor::new(vec![1, 2, 3, 4], vec![2, 2]);
    let row = RawTensor::new(vec![10, 20], vec![1, 2]);
    let sum = matrix.zip_broadcast(&row, |x, y| x + y);
    assert_eq!(sum, RawTensor::new(vec![11, 22, 13, 24], vec![2, 2]));
}
