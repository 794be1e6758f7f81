use rand::Rng;

use crate::nn::{Activation, Linear, Module};
use crate::tensor::{Float, RcTensor};

/// A stack of `Linear` layers applied row by row.
#[derive(Debug)]
pub struct Mlp<T>
where
    T: Float,
{
    layers: Vec<Linear<T>>,
}

impl<T: Float> Mlp<T> {
    pub fn new(layers: Vec<Linear<T>>) -> Mlp<T> {
        assert!(!layers.is_empty(), "an Mlp needs at least one layer");
        for pair in layers.windows(2) {
            assert_eq!(
                pair[0].out_features(),
                pair[1].in_features(),
                "consecutive layers must agree on their width"
            );
        }
        Mlp { layers }
    }

    /// `widths = [in, hidden.., out]`; hidden layers use `activation`, the last
    /// layer uses `output_activation`.
    pub fn random<R: Rng + ?Sized>(
        widths: &[usize],
        activation: Activation,
        output_activation: Activation,
        rng: &mut R,
    ) -> Mlp<T> {
        assert!(widths.len() >= 2, "an Mlp needs an input and an output width");
        let last = widths.len() - 2;
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let act = if i == last { output_activation } else { activation };
                Linear::random(pair[0], pair[1], act, &mut *rng)
            })
            .collect();
        Mlp { layers }
    }

    pub fn in_features(&self) -> usize {
        self.layers[0].in_features()
    }

    pub fn out_features(&self) -> usize {
        self.layers[self.layers.len() - 1].out_features()
    }

    pub fn layers(&self) -> &[Linear<T>] {
        &self.layers
    }
}

impl<T: Float> crate::nn::module::private::Private for Mlp<T> {}

impl<T: Float> Module<T> for Mlp<T> {
    type InputType = RcTensor<T>;
    type OutputType = RcTensor<T>;

    fn forward(&self, batch: RcTensor<T>) -> RcTensor<T> {
        self.layers
            .iter()
            .fold(batch, |prev, layer| layer.forward(prev))
    }

    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_> {
        Box::new(self.layers.iter().flat_map(|layer| layer.parameters()))
    }

    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_> {
        Box::new(
            self.layers
                .iter_mut()
                .flat_map(|layer| layer.parameters_mut()),
        )
    }
}

#[test]
fn test_mlp_creation() {
    use crate::tensor::functional;
    let mlp = Mlp::new(vec![
        Linear::new(
            RcTensor::from([[1.0, -2.0], [-1.1, 0.7]]),
            RcTensor::new_with_filler(vec![1, 2], 1.0),
            Some(functional::tanh),
        ),
        Linear::new(
            RcTensor::from([[1.0, -2.0], [-1.1, 0.7]]),
            RcTensor::new_with_filler(vec![1, 2], 1.0),
            Some(functional::tanh),
        ),
    ]);
    assert_eq!(mlp.parameters().count(), 4);
    assert_eq!(mlp.num_params(), 12);
}

#[test]
fn test_mlp() {
    use crate::optim::{Optimizer, Sgd};
    use crate::tensor::functional;

    let mut mlp = Mlp::new(vec![
        Linear::new(
            RcTensor::from([[1.0, 1e-2, -1e-3, -2.0], [-1.1, 0., 0., 0.7]]),
            RcTensor::new_with_filler(vec![1, 4], 1.0),
            Some(functional::tanh),
        ),
        Linear::new(
            RcTensor::from([[1.0, -2.0], [-1.1, 0.7], [0.1, -0.2], [0.1, 0.0]]),
            RcTensor::new_with_filler(vec![1, 2], 1.0),
            Some(functional::tanh),
        ),
    ]);
    let input = RcTensor::new(vec![1.0, 2.0], vec![1, 2]);
    let expected = RcTensor::new(vec![-1.0, 1.0], vec![1, 2]);
    let loss_of = |mlp: &Mlp<f64>| (&mlp.forward(input.clone()) - &expected).square().sum();
    let initial = loss_of(&mlp).elem();

    let mut sgd = Sgd::new(5e-2, 0.0);
    for _ in 0..50 {
        let loss = loss_of(&mlp);
        loss.backward();
        let params: Vec<_> = mlp.parameters().cloned().collect();
        let grads: Vec<_> = params.iter().map(|p| p.grad().unwrap()).collect();
        let updated = sgd.step(&params, &grads);
        for (slot, new_value) in mlp.parameters_mut().zip(updated) {
            *slot = new_value;
        }
    }
    let last = loss_of(&mlp).elem();
    assert!(last < initial, "loss went from {initial} to {last}");
}

#[test]
fn test_random_mlp_widths() {
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mlp: Mlp<f64> = Mlp::random(&[2, 8, 8, 3], Activation::Tanh, Activation::Identity, &mut rng);
    assert_eq!(mlp.layers().len(), 3);
    assert_eq!(mlp.in_features(), 2);
    assert_eq!(mlp.out_features(), 3);
    let out = mlp.forward(RcTensor::new(vec![0.1, 0.2, 0.3, 0.4], vec![2, 2]));
    assert_eq!(out.shape(), &[2, 3]);
}
