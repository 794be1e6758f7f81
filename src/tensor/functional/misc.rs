use rayon::prelude::*;

use crate::tensor::numeric::*;
use crate::tensor::{RawTensor, RcTensor, Scalar};

pub fn sum<T: Numeric>(tensor: &RcTensor<T>) -> Scalar<T> {
    let total = tensor
        .array
        .iter()
        .fold(T::zero(), |acc, &value| acc + value);
    RcTensor::from_op(
        RawTensor::scalar(total),
        vec![tensor.clone()],
        vec![],
        sum_vjp,
        format!("sum, file: {}, line: {}", file!(), line!()),
    )
}

fn sum_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    vec![RawTensor::new_with_filler(
        inputs[0].shape().to_vec(),
        grad.elem(),
    )]
}

pub fn mean<T: Float>(tensor: &RcTensor<T>) -> Scalar<T> {
    let count = tensor.count().max(1);
    sum(tensor).scale(T::one() / T::cast(count as f64))
}

/// Same elements, new shape.
pub fn reshape<T: Numeric>(tensor: &RcTensor<T>, shape: Vec<usize>) -> RcTensor<T> {
    RcTensor::from_op(
        RawTensor::new(tensor.array.clone(), shape),
        vec![tensor.clone()],
        vec![],
        reshape_vjp,
        format!("reshape, file: {}, line: {}", file!(), line!()),
    )
}

fn reshape_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    vec![RawTensor::new(grad.array.clone(), inputs[0].shape().to_vec())]
}

fn matrix_dims(shape: &[usize]) -> (usize, usize) {
    assert_eq!(
        shape.len(),
        2,
        "matmul works on matrices, got shape {shape:?}"
    );
    (shape[0], shape[1])
}

/// `[n, k] @ [k, m]`, rows computed in parallel.
fn matmul_raw<T: Numeric>(left: &[T], (n, k): (usize, usize), right: &[T], m: usize) -> Vec<T> {
    let mut out = vec![T::zero(); n * m];
    if m == 0 {
        return out;
    }
    out.par_chunks_mut(m).enumerate().for_each(|(i, row)| {
        for p in 0..k {
            let a = left[i * k + p];
            let right_row = &right[p * m..(p + 1) * m];
            for (o, &b) in row.iter_mut().zip(right_row.iter()) {
                *o += a * b;
            }
        }
    });
    out
}

fn transpose_raw<T: Numeric>(array: &[T], (rows, cols): (usize, usize)) -> Vec<T> {
    let mut out = Vec::with_capacity(array.len());
    for j in 0..cols {
        for i in 0..rows {
            out.push(array[i * cols + j]);
        }
    }
    out
}

/// A naive matrix multiply operation
///
/// ```
/// # use rust_operator::tensor::*;
/// let matrix = RcTensor::new(vec![0, 1, 2, 3], vec![2, 2]);
/// let diag = RcTensor::new(vec![1, 1], vec![2, 1]);
/// let e1 = RcTensor::new(vec![0, 1], vec![2, 1]);
///
/// assert_eq!(functional::matmul(&matrix, &diag), RcTensor::new(vec![1, 5], vec![2, 1]));
/// assert_eq!(matrix.matmul(&e1), RcTensor::new(vec![1, 3], vec![2, 1]));
/// ```
pub fn matmul<T: Numeric>(left: &RcTensor<T>, right: &RcTensor<T>) -> RcTensor<T> {
    let (n, k) = matrix_dims(left.shape());
    let (k_right, m) = matrix_dims(right.shape());
    assert_eq!(
        k,
        k_right,
        "matmul inner dimensions differ: {:?} @ {:?}",
        left.shape(),
        right.shape()
    );
    let array = matmul_raw(&left.array, (n, k), &right.array, m);
    RcTensor::from_op(
        RawTensor::new(array, vec![n, m]),
        vec![left.clone(), right.clone()],
        vec![],
        matmul_vjp,
        format!("matmul, file: {}, line: {}", file!(), line!()),
    )
}

fn matmul_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    let (left, right) = (&inputs[0], &inputs[1]);
    let (n, k) = matrix_dims(left.shape());
    let (_, m) = matrix_dims(right.shape());
    // dL/dA = G @ B^T, dL/dB = A^T @ G
    let right_t = transpose_raw(&right.array, (k, m));
    let left_grad = matmul_raw(&grad.array, (n, m), &right_t, k);
    let left_t = transpose_raw(&left.array, (n, k));
    let right_grad = matmul_raw(&left_t, (k, n), &grad.array, m);
    vec![
        RawTensor::new(left_grad, vec![n, k]),
        RawTensor::new(right_grad, vec![k, m]),
    ]
}

/// Picks rows of a matrix, repeats allowed: `out[i] = tensor[rows[i]]`.
pub fn gather_rows<T: Numeric>(tensor: &RcTensor<T>, rows: &[usize]) -> RcTensor<T> {
    let (n, cols) = matrix_dims(tensor.shape());
    let mut array = Vec::with_capacity(rows.len() * cols);
    for &row in rows {
        assert!(row < n, "row {row} out of bounds for {n} rows");
        array.extend_from_slice(&tensor.array[row * cols..(row + 1) * cols]);
    }
    RcTensor::from_op(
        RawTensor::new(array, vec![rows.len(), cols]),
        vec![tensor.clone()],
        rows.to_vec(),
        gather_rows_vjp,
        format!("gather_rows, file: {}, line: {}", file!(), line!()),
    )
}

fn gather_rows_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    rows: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    let shape = inputs[0].shape().to_vec();
    let cols = shape[1];
    let mut array = vec![T::zero(); shape.iter().product()];
    for (i, &row) in rows.iter().enumerate() {
        for c in 0..cols {
            array[row * cols + c] += grad.array[i * cols + c];
        }
    }
    vec![RawTensor::new(array, shape)]
}

/// Stacks matrices with the same column count on top of each other.
pub fn concat_rows<T: Numeric>(tensors: &[RcTensor<T>]) -> RcTensor<T> {
    assert!(!tensors.is_empty(), "concat_rows needs at least one tensor");
    let cols = matrix_dims(tensors[0].shape()).1;
    let mut rows = 0;
    let mut array = Vec::with_capacity(tensors.iter().map(|t| t.count()).sum());
    for tensor in tensors {
        let (n, c) = matrix_dims(tensor.shape());
        assert_eq!(c, cols, "concat_rows needs equal column counts");
        rows += n;
        array.extend_from_slice(&tensor.array);
    }
    RcTensor::from_op(
        RawTensor::new(array, vec![rows, cols]),
        tensors.to_vec(),
        vec![],
        concat_rows_vjp,
        format!("concat_rows, file: {}, line: {}", file!(), line!()),
    )
}

fn concat_rows_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    let mut start = 0;
    inputs
        .iter()
        .map(|input| {
            let end = start + input.count();
            let part = RawTensor::new(grad.array[start..end].to_vec(), input.shape().to_vec());
            start = end;
            part
        })
        .collect()
}

/// Places matrices with the same row count side by side.
pub fn concat_cols<T: Numeric>(tensors: &[RcTensor<T>]) -> RcTensor<T> {
    assert!(!tensors.is_empty(), "concat_cols needs at least one tensor");
    let rows = matrix_dims(tensors[0].shape()).0;
    let widths: Vec<usize> = tensors
        .iter()
        .map(|tensor| {
            let (n, c) = matrix_dims(tensor.shape());
            assert_eq!(n, rows, "concat_cols needs equal row counts");
            c
        })
        .collect();
    let total: usize = widths.iter().sum();
    let mut array = Vec::with_capacity(rows * total);
    for i in 0..rows {
        for (tensor, &width) in tensors.iter().zip(widths.iter()) {
            array.extend_from_slice(&tensor.array[i * width..(i + 1) * width]);
        }
    }
    RcTensor::from_op(
        RawTensor::new(array, vec![rows, total]),
        tensors.to_vec(),
        vec![],
        concat_cols_vjp,
        format!("concat_cols, file: {}, line: {}", file!(), line!()),
    )
}

fn concat_cols_vjp<T: Numeric>(
    inputs: &[RcTensor<T>],
    _attrs: &[usize],
    grad: &RawTensor<T>,
) -> Vec<RawTensor<T>> {
    let rows = grad.shape()[0];
    let total = grad.shape()[1];
    let mut offset = 0;
    inputs
        .iter()
        .map(|input| {
            let width = input.shape()[1];
            let mut array = Vec::with_capacity(rows * width);
            for i in 0..rows {
                let start = i * total + offset;
                array.extend_from_slice(&grad.array[start..start + width]);
            }
            offset += width;
            RawTensor::new(array, vec![rows, width])
        })
        .collect()
}
