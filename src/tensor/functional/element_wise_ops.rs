use crate::tensor::numeric::*;

use crate::tensor::utils::reduce_to_shape;
use crate::tensor::{RawTensor, RcTensor};

pub fn add<T: Numeric>(left: &RcTensor<T>, right: &RcTensor<T>) -> RcTensor<T> {
    let raw_tensor = left.zip_broadcast(right, |x, y| x + y);
    RcTensor::from_op(
        raw_tensor,
        vec![left.clone(), right.clone()],
        vec![],
        add_vjp,
        format!("add, file: {}, line: {}", file!(), line!()),
    )
}

fn add_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    vec![
        reduce_to_shape(grad, inputs[0].shape()),
        reduce_to_shape(grad, inputs[1].shape()),
    ]
}

pub fn sub<T: Numeric>(left: &RcTensor<T>, right: &RcTensor<T>) -> RcTensor<T> {
    let raw_tensor = left.zip_broadcast(right, |x, y| x - y);
    RcTensor::from_op(
        raw_tensor,
        vec![left.clone(), right.clone()],
        vec![],
        sub_vjp,
        format!("sub, file: {}, line: {}", file!(), line!()),
    )
}

fn sub_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    let negated = grad.map(|x| T::zero() - x);
    vec![
        reduce_to_shape(grad, inputs[0].shape()),
        reduce_to_shape(&negated, inputs[1].shape()),
    ]
}

pub fn neg<T: Numeric>(tensor: &RcTensor<T>) -> RcTensor<T> {
    RcTensor::from_op(
        tensor.map(|x| T::zero() - x),
        vec![tensor.clone()],
        vec![],
        neg_vjp,
        format!("neg, file: {}, line: {}", file!(), line!()),
    )
}

fn neg_vjp<T: Numeric>(
    _inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    vec![grad.map(|x| T::zero() - x)]
}

/// Elementwise (Hadamard) product with broadcasting.
pub fn mul<T: Numeric>(left: &RcTensor<T>, right: &RcTensor<T>) -> RcTensor<T> {
    let raw_tensor = left.zip_broadcast(right, |x, y| x * y);
    RcTensor::from_op(
        raw_tensor,
        vec![left.clone(), right.clone()],
        vec![],
        mul_vjp,
        format!("mul, file: {}, line: {}", file!(), line!()),
    )
}

fn mul_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    let (left, right) = (&inputs[0], &inputs[1]);
    let left_grad = grad.zip_broadcast(right, |g, y| g * y);
    let right_grad = grad.zip_broadcast(left, |g, x| g * x);
    vec![
        reduce_to_shape(&left_grad, left.shape()),
        reduce_to_shape(&right_grad, right.shape()),
    ]
}

/// Builds a unary op from its forward map and its pointwise derivative.
fn unary<T: Numeric>(
    tensor: &RcTensor<T>,
    forward: impl Fn(T) -> T,
    vjp: fn(&[RcTensor<T>], &[usize], &RawTensor<T>) -> Vec<RawTensor<T>>,
    debug_info: String,
) -> RcTensor<T> {
    RcTensor::from_op(
        tensor.map(forward),
        vec![tensor.clone()],
        vec![],
        vjp,
        debug_info,
    )
}

fn pointwise_vjp<T: Numeric>(
    input: &RcTensor<T>,
    grad: &RawTensor<T>,
    derivative: impl Fn(T) -> T,
) -> Vec<RawTensor<T>> {
    let local = input.map(derivative);
    vec![grad.zip_broadcast(&local, |g, d| g * d)]
}

pub fn tanh<T: Float>(tensor: &RcTensor<T>) -> RcTensor<T> {
    unary(
        tensor,
        |x| x.tanh(),
        tanh_vjp,
        format!("tanh, file: {}, line: {}", file!(), line!()),
    )
}

fn tanh_vjp<T: Float>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    pointwise_vjp(&inputs[0], grad, |x| T::one() - x.tanh().powi(2))
}

pub fn relu<T: Float>(tensor: &RcTensor<T>) -> RcTensor<T> {
    unary(
        tensor,
        |x| if x > T::zero() { x } else { T::zero() },
        relu_vjp,
        format!("relu, file: {}, line: {}", file!(), line!()),
    )
}

fn relu_vjp<T: Float>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    pointwise_vjp(&inputs[0], grad, |x| {
        if x > T::zero() {
            T::one()
        } else {
            T::zero()
        }
    })
}

pub fn sin<T: Float>(tensor: &RcTensor<T>) -> RcTensor<T> {
    unary(
        tensor,
        |x| x.sin(),
        sin_vjp,
        format!("sin, file: {}, line: {}", file!(), line!()),
    )
}

fn sin_vjp<T: Float>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    pointwise_vjp(&inputs[0], grad, |x| x.cos())
}

pub fn square<T: Float>(tensor: &RcTensor<T>) -> RcTensor<T> {
    unary(
        tensor,
        |x| x * x,
        square_vjp,
        format!("square, file: {}, line: {}", file!(), line!()),
    )
}

fn square_vjp<T: Float>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    let two = T::one() + T::one();
    pointwise_vjp(&inputs[0], grad, |x| two * x)
}

pub fn identity<T: Float>(tensor: &RcTensor<T>) -> RcTensor<T> {
    tensor.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// central difference of `f(x).sum()` along every coordinate of `x`
    fn numerical_gradient(f: impl Fn(&RcTensor<f64>) -> RcTensor<f64>, x: &[f64]) -> Vec<f64> {
        let epsilon = 1e-6;
        (0..x.len())
            .map(|i| {
                let mut plus = x.to_vec();
                let mut minus = x.to_vec();
                plus[i] += epsilon;
                minus[i] -= epsilon;
                let up = f(&RcTensor::new(plus, vec![x.len()])).sum().elem();
                let down = f(&RcTensor::new(minus, vec![x.len()])).sum().elem();
                (up - down) / (2.0 * epsilon)
            })
            .collect()
    }

    fn assert_grad_matches(f: impl Fn(&RcTensor<f64>) -> RcTensor<f64>, x: Vec<f64>) {
        let input = RcTensor::parameter(x.clone(), vec![x.len()]);
        f(&input).sum().backward();
        let grad = input.grad().unwrap();
        for (analytic, numeric) in grad.array().iter().zip(numerical_gradient(&f, &x)) {
            assert!(
                (analytic - numeric).abs() < 1e-6,
                "analytic={analytic}, numeric={numeric}"
            );
        }
    }

    #[test]
    fn test_tanh_sets_grad() {
        assert_grad_matches(|x| tanh(x), vec![0.666, 12.0, -3.2, -0.1]);
    }

    #[test]
    fn test_tanh_twice_sets_grad() {
        assert_grad_matches(|x| tanh(&tanh(x)), vec![0.666, -0.3]);
    }

    #[test]
    fn test_sin_square_relu() {
        assert_grad_matches(|x| sin(x), vec![0.1, 1.2, -2.0]);
        assert_grad_matches(|x| square(x), vec![0.1, 1.2, -2.0]);
        assert_grad_matches(|x| relu(x), vec![0.5, -1.5, 2.0]);
    }

    #[test]
    fn test_sub_and_neg() {
        let x = RcTensor::parameter(vec![1.0, 2.0], vec![2]);
        let y = RcTensor::parameter(vec![3.0, 5.0], vec![2]);
        (&(&x - &y) + &(-&y)).sum().backward();
        assert_eq!(x.grad().unwrap().array(), &[1.0, 1.0]);
        assert_eq!(y.grad().unwrap().array(), &[-2.0, -2.0]);
    }

    #[test]
    fn test_broadcast_add_reduces_grad() {
        let matrix = RcTensor::parameter(vec![1.0; 6], vec![3, 2]);
        let bias = RcTensor::parameter(vec![0.5, -0.5], vec![1, 2]);
        (&matrix + &bias).sum().backward();
        assert_eq!(bias.grad().unwrap(), RcTensor::new(vec![3.0, 3.0], vec![1, 2]));
        assert_eq!(matrix.grad().unwrap().shape(), &[3, 2]);
    }

    #[test]
    fn test_broadcast_mul_grad() {
        let matrix = RcTensor::parameter(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let row = RcTensor::parameter(vec![10.0, 20.0], vec![1, 2]);
        (&matrix * &row).sum().backward();
        assert_eq!(row.grad().unwrap().array(), &[4.0, 6.0]);
        assert_eq!(matrix.grad().unwrap().array(), &[10.0, 20.0, 10.0, 20.0]);
    }

    #[test]
    fn test_add() {
        let tensor1 = RcTensor::new_with_filler(vec![4, 4], 1);
        let tensor2 = RcTensor::new((0..32).collect(), vec![2, 4, 4]);
        let tensor3 = RcTensor::new((1..33).collect(), vec![2, 4, 4]);
        assert_eq!(&tensor2 + &tensor1, tensor3);
        assert_eq!(&tensor1 + &tensor2, tensor3);
        assert_eq!(tensor1 + tensor2, tensor3);
    }
}
