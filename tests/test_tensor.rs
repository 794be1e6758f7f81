use rust_operator::tensor::*;

#[test]
fn test_from_vec() {
    let tensor1 = RcTensor::from(vec![vec![0, 1, 2], vec![3, 4, 5]]);
    let tensor2 = RcTensor::new((0..6).collect(), vec![2, 3]);
    assert_eq!(tensor1, tensor2);
}

#[test]
fn test_new_with_filler() {
    let vec = RcTensor::new_with_filler(vec![4], 4);
    assert_eq!(vec.shape(), &[4]);
    assert_eq!(vec.get(&[0]).unwrap(), &4);
}

#[test]
fn test_get_2x2x2() {
    let matrix = RcTensor::new(vec![0, 1, 2, 3, 4, 5, 6, 7], vec![2, 2, 2]);
    assert_eq!(*matrix.get(&[0, 0, 0]).unwrap(), 0);
    assert_eq!(*matrix.get(&[0, 1, 0]).unwrap(), 2);
    assert_eq!(*matrix.get(&[1, 1, 1]).unwrap(), 7);
    assert!(matrix.get(&[2, 0, 0]).is_err());
}

#[test]
fn test_get_3x3() {
    let matrix = RcTensor::new(vec![0, 1, 2, 3, 4, 5, 6, 7, 8], vec![3, 3]);
    let mut prev = -1;
    for i in 0..3 {
        for j in 0..3 {
            let &curr = matrix.get(&[i, j]).unwrap();
            assert_eq!(prev + 1, curr);
            prev = curr;
        }
    }
}

#[test]
fn test_add_scalar() {
    let tensor1 = RcTensor::new((0..32).collect(), vec![2, 4, 4]);
    let tensor2 = RcTensor::new((42..(32 + 42)).collect(), vec![2, 4, 4]);
    let scalar = RcTensor::scalar(42);
    assert_eq!(&tensor1 + &scalar, tensor2);
    assert_eq!(&scalar + &tensor1, tensor2);
}

#[test]
fn test_add_broadcasts_leading_axes() {
    let tensor1 = RcTensor::new_with_filler(vec![4, 4], 1);
    let tensor2 = RcTensor::new((0..32).collect(), vec![2, 4, 4]);
    let tensor3 = RcTensor::new((1..33).collect(), vec![2, 4, 4]);
    assert_eq!(&tensor2 + &tensor1, tensor3);
    assert_eq!(&tensor1 + &tensor2, tensor3);
}

#[test]
fn test_matmul_2x2() {
    let matrix = RcTensor::new(vec![0, 1, 2, 3], vec![2, 2]);
    let e2 = RcTensor::new(vec![1, 0], vec![2, 1]);
    let diag = RcTensor::new(vec![1, 1], vec![2, 1]);
    assert_eq!(matrix.matmul(&diag), RcTensor::new(vec![1, 5], vec![2, 1]));
    assert_eq!(matrix.matmul(&e2), RcTensor::new(vec![0, 2], vec![2, 1]));
}

#[test]
fn test_scale() {
    let vec = RcTensor::new_with_filler(vec![4], 1);
    assert_eq!(vec.scale(42), RcTensor::new(vec![42, 42, 42, 42], vec![4]));
}

#[test]
fn test_backward_through_a_small_network() {
    // loss = sum(tanh(x @ w) * c)
    let x = RcTensor::new(vec![0.5, -1.0], vec![1, 2]);
    let w = RcTensor::parameter(vec![0.3, -0.2], vec![2, 1]);
    let c = RcTensor::scalar(2.0);
    let loss = (&functional::tanh(&x.matmul(&w)) * &c).sum();
    loss.backward();

    let z: f64 = 0.5 * 0.3 + 1.0 * 0.2;
    let dz = 2.0 * (1.0 - z.tanh().powi(2));
    let grad = w.grad().unwrap();
    assert!((grad.array()[0] - dz * 0.5).abs() < 1e-12);
    assert!((grad.array()[1] + dz).abs() < 1e-12);
    assert!(x.grad().is_none());
}

#[test]
fn test_zero_grad_clears_accumulation() {
    let w = RcTensor::parameter(vec![1.0, 2.0], vec![2]);
    w.square().sum().backward();
    w.square().sum().backward();
    assert_eq!(w.grad().unwrap().array(), &[4.0, 8.0]);
    w.zero_grad();
    assert!(w.grad().is_none());
    assert!(w.is_finite());
}
