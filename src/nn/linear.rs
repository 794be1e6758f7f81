use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::nn::Module;
use crate::tensor::{functional, Float, RcTensor};

pub type ActivationFn<T> = fn(&RcTensor<T>) -> RcTensor<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Tanh,
    Relu,
    Sin,
    Identity,
}

impl Activation {
    pub fn function<T: Float>(self) -> ActivationFn<T> {
        match self {
            Activation::Tanh => functional::tanh as ActivationFn<T>,
            Activation::Relu => functional::relu as ActivationFn<T>,
            Activation::Sin => functional::sin as ActivationFn<T>,
            Activation::Identity => functional::identity as ActivationFn<T>,
        }
    }
}

/// `y = activation(x @ weights + bias)` on a `[batch, in_features]` input.
pub struct Linear<T>
where
    T: Float,
{
    pub weights: RcTensor<T>,
    pub bias: RcTensor<T>,
    activation: ActivationFn<T>,
}

impl<T: Float> std::fmt::Debug for Linear<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features())
            .field("out_features", &self.out_features())
            .finish()
    }
}

impl<T> Linear<T>
where
    T: Float,
{
    pub fn new(weights: RcTensor<T>, bias: RcTensor<T>, activation: Option<ActivationFn<T>>) -> Self {
        assert_eq!(weights.shape().len(), 2, "weights must be a matrix");
        assert_eq!(
            bias.shape(),
            &[1, weights.shape()[1]],
            "bias must be a row matching the output width"
        );
        Linear {
            weights: weights.deep_clone(),
            bias: bias.deep_clone(),
            activation: activation.unwrap_or(functional::identity),
        }
    }

    /// Xavier-normal weights and a zero bias.
    pub fn random<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let std = (2.0 / (in_features + out_features).max(1) as f64).sqrt();
        let weights = (0..in_features * out_features)
            .map(|_| T::cast(std * rng.sample::<f64, _>(StandardNormal)))
            .collect();
        Linear {
            weights: RcTensor::parameter(weights, vec![in_features, out_features]),
            bias: RcTensor::parameter(vec![T::zero(); out_features], vec![1, out_features]),
            activation: activation.function(),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weights.shape()[0]
    }

    pub fn out_features(&self) -> usize {
        self.weights.shape()[1]
    }
}

impl<T: Float> crate::nn::module::private::Private for Linear<T> {}

impl<T: Float> Module<T> for Linear<T> {
    type InputType = RcTensor<T>;
    type OutputType = RcTensor<T>;

    fn forward(&self, batch: RcTensor<T>) -> RcTensor<T> {
        let y = batch.matmul(&self.weights);
        (self.activation)(&(&y + &self.bias))
    }

    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_> {
        Box::new([&self.weights, &self.bias].into_iter())
    }

    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_> {
        Box::new([&mut self.weights, &mut self.bias].into_iter())
    }
}

#[test]
fn test_layer_no_grad() {
    let layer = Linear::new(
        RcTensor::new_with_filler(vec![2, 2], 1.0),
        RcTensor::new_with_filler(vec![1, 2], 1.0),
        None,
    );
    let input = RcTensor::new(vec![1.0, 2.0], vec![1, 2]);
    let res = layer.forward(input);
    let expected = RcTensor::new(vec![4.0, 4.0], vec![1, 2]);

    assert_eq!(res, expected);
}

#[test]
fn test_layer() {
    let layer = Linear::new(
        RcTensor::from([[1.0, -2.0], [-1.1, 0.7]]),
        RcTensor::new_with_filler(vec![1, 2], 1.0),
        None,
    );
    let input = RcTensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    let res = layer.forward(input);
    res.sum().backward();
    // every output column sums both rows of the input
    assert_eq!(
        layer.weights.grad().unwrap().array(),
        &[4.0, 4.0, 6.0, 6.0]
    );
    assert_eq!(layer.bias.grad().unwrap().array(), &[2.0, 2.0]);
}

#[test]
fn test_random_layer_shapes() {
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let layer: Linear<f64> = Linear::random(3, 5, Activation::Relu, &mut rng);
    assert_eq!(layer.in_features(), 3);
    assert_eq!(layer.out_features(), 5);
    assert_eq!(layer.num_params(), 3 * 5 + 5);
    assert!(layer.parameters().all(|p| p.requires_grad()));
}
