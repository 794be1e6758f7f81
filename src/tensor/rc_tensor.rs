use std::rc::Rc;

use std::cmp::PartialEq;
use std::convert::From;
use std::ops::Deref;

use super::autograd::{self, Derivative, VectorJacobianProduct};

use super::functional;
use super::numeric::*;
use super::raw_tensor::*;
use super::types::*;

/// A cheaply clonable handle on an immutable tensor.
///
/// Tensors never change after construction; ops build new tensors and, when
/// any input requires a gradient, record how to push gradients back to their
/// inputs. Parameters are the leaves of that graph and are created with
/// [`RcTensor::parameter`].
#[derive(Debug, PartialEq, Clone)]
pub struct RcTensor<T: Numeric>(pub(in crate::tensor) Rc<RawTensor<T>>);

impl<T> Deref for RcTensor<T>
where
    T: Numeric,
{
    type Target = RawTensor<T>;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl<T: Numeric> RcTensor<T> {
    pub(in crate::tensor) fn from_raw(raw_tensor: RawTensor<T>) -> RcTensor<T> {
        RcTensor(Rc::new(raw_tensor))
    }

    /// Wraps the result of an op, recording the backward node when needed.
    pub(in crate::tensor) fn from_op(
        mut raw_tensor: RawTensor<T>,
        inputs: TensorList<T>,
        attrs: Vec<usize>,
        vector_jacobian_product: VectorJacobianProduct<T>,
        debug_info: String,
    ) -> RcTensor<T> {
        if inputs.iter().any(|input| input.requires_grad) {
            raw_tensor.requires_grad = true;
            raw_tensor.grad_fn = Some(Derivative::new(
                inputs,
                attrs,
                vector_jacobian_product,
                debug_info,
            ));
        }
        RcTensor::from_raw(raw_tensor)
    }

    pub(in crate::tensor) fn as_ptr(&self) -> *const RawTensor<T> {
        Rc::as_ptr(&self.0)
    }

    pub fn new(array: Vec<T>, shape: Vec<usize>) -> RcTensor<T> {
        RcTensor::from_raw(RawTensor::new(array, shape))
    }

    pub fn new_with_filler(shape: Vec<usize>, filler: T) -> RcTensor<T> {
        RcTensor::from_raw(RawTensor::new_with_filler(shape, filler))
    }

    pub fn zeros(shape: Vec<usize>) -> RcTensor<T> {
        RcTensor::new_with_filler(shape, T::zero())
    }

    pub fn scalar(scalar: T) -> RcTensor<T> {
        RcTensor::from_raw(RawTensor::scalar(scalar))
    }

    /// A leaf tensor that collects gradients during `backward`.
    pub fn parameter(array: Vec<T>, shape: Vec<usize>) -> RcTensor<T> {
        let mut raw_tensor = RawTensor::new(array, shape);
        raw_tensor.requires_grad = true;
        RcTensor::from_raw(raw_tensor)
    }

    /// Same data, no history: the result is a leaf that does not require grad.
    pub fn detach(&self) -> RcTensor<T> {
        RcTensor::from_raw(self.0.detached())
    }

    /// Same data as a fresh parameter with an empty gradient slot.
    pub fn deep_clone(&self) -> RcTensor<T> {
        RcTensor::parameter(self.array.clone(), self.shape.clone())
    }

    pub fn grad(&self) -> Option<RcTensor<T>> {
        self.0.grad.borrow().clone()
    }

    pub fn zero_grad(&self) {
        *self.0.grad.borrow_mut() = None;
    }

    pub(in crate::tensor) fn accumulate_grad(&self, grad: RawTensor<T>) {
        let mut slot = self.0.grad.borrow_mut();
        let updated = match slot.take() {
            Some(existing) => existing.zip_broadcast(&grad, |x, y| x + y),
            None => grad,
        };
        *slot = Some(RcTensor::from_raw(updated));
    }

    /// Backpropagates from a single element tensor.
    pub fn backward(&self) {
        assert_eq!(
            self.count(),
            1,
            "backward needs a single element tensor, got shape {:?}",
            self.shape()
        );
        autograd::backward(
            self,
            RawTensor::new_with_filler(self.shape.clone(), T::one()),
        );
    }

    pub fn sum(&self) -> Scalar<T> {
        functional::sum(self)
    }

    pub fn reshape(&self, shape: Vec<usize>) -> RcTensor<T> {
        functional::reshape(self, shape)
    }

    pub fn matmul(&self, right: &RcTensor<T>) -> RcTensor<T> {
        functional::matmul(self, right)
    }

    pub fn scale(&self, factor: T) -> RcTensor<T> {
        self * &RcTensor::scalar(factor)
    }
}

impl<T: Float> RcTensor<T> {
    pub fn mean(&self) -> Scalar<T> {
        functional::mean(self)
    }

    pub fn square(&self) -> RcTensor<T> {
        functional::square(self)
    }

    pub fn is_finite(&self) -> bool {
        self.array.iter().all(|x| x.finite())
    }
}

impl<T: Numeric + std::fmt::Display> std::fmt::Display for RcTensor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count() == 1 {
            return write!(f, "{}", self.array[0]);
        }
        write!(f, "tensor(shape={:?}, [", self.shape)?;
        for (i, value) in self.array.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "])")
    }
}

impl<T> From<T> for RcTensor<T>
where
    T: Numeric,
{
    fn from(value: T) -> Self {
        RcTensor::from_raw(RawTensor::from(value))
    }
}

impl<T, U> From<Vec<U>> for RcTensor<T>
where
    T: Numeric,
    RawTensor<T>: From<U>,
{
    fn from(value: Vec<U>) -> RcTensor<T> {
        let tmp = <RawTensor<T> as From<Vec<U>>>::from(value);
        RcTensor::from_raw(tmp)
    }
}

impl<T, U, const N: usize> From<[U; N]> for RcTensor<T>
where
    T: Numeric,
    RawTensor<T>: From<U>,
    U: Clone,
{
    fn from(value: [U; N]) -> RcTensor<T> {
        let raw_tensor = From::from(value.to_vec());
        RcTensor::from_raw(raw_tensor)
    }
}

macro_rules! binary_op_impl {
    ($trait: ident, $method: ident, $function: path) => {
        impl<T: Numeric> std::ops::$trait<&RcTensor<T>> for &RcTensor<T> {
            type Output = RcTensor<T>;
            fn $method(self, right: &RcTensor<T>) -> RcTensor<T> {
                $function(self, right)
            }
        }

        impl<T: Numeric> std::ops::$trait<RcTensor<T>> for RcTensor<T> {
            type Output = RcTensor<T>;
            fn $method(self, right: RcTensor<T>) -> RcTensor<T> {
                $function(&self, &right)
            }
        }
    };
}

binary_op_impl!(Add, add, functional::add);
binary_op_impl!(Sub, sub, functional::sub);
binary_op_impl!(Mul, mul, functional::mul);

impl<T: Numeric> std::ops::Neg for &RcTensor<T> {
    type Output = RcTensor<T>;
    fn neg(self) -> Self::Output {
        functional::neg(self)
    }
}

#[test]
fn test_element_wise_multiplication() {
    let left = RcTensor::from([1, 2, 3]);
    let right = RcTensor::from([7, 2, 8]);
    assert_eq!(&left * &right, RcTensor::from([7, 4, 24]));
}

#[test]
fn test_element_wise_multiplication_on_rc_tensor_directly() {
    let left = RcTensor::from([1, 2, 3]);
    let right = RcTensor::from([7, 2, 8]);
    assert_eq!(left * right, RcTensor::from([7, 4, 24]));
}

#[test]
fn test_detach_drops_history() {
    let x = RcTensor::parameter(vec![1.0, 2.0], vec![2]);
    let y = (&x * &x).detach();
    assert!(!y.requires_grad());
    assert_eq!(y, RcTensor::new(vec![1.0, 4.0], vec![2]));
}

#[test]
fn test_display() {
    assert_eq!(format!("{}", RcTensor::scalar(1.5)), "1.5");
    assert_eq!(
        format!("{}", RcTensor::new(vec![1, 2], vec![2])),
        "tensor(shape=[2], [1, 2])"
    );
}
