use crate::error::{OperatorError, Result};
use crate::optim::{fits, from_f64, to_f64, Optimizer, OptimizerConfig, OptimizerState};
use crate::tensor::{Float, RcTensor, TensorList};

/// Plain gradient descent, with optional heavy-ball momentum.
pub struct Sgd<T: Float> {
    learning_rate: f64,
    momentum: f64,
    velocity: Vec<Vec<T>>,
    step: usize,
}

impl<T: Float> Sgd<T> {
    pub fn new(learning_rate: f64, momentum: f64) -> Self {
        assert!(learning_rate > 0.0, "Step size must be positive!");
        Sgd {
            learning_rate,
            momentum,
            velocity: vec![],
            step: 0,
        }
    }
}

impl<T: Float> Optimizer<T> for Sgd<T> {
    fn step(&mut self, parameters: &[RcTensor<T>], gradients: &[RcTensor<T>]) -> TensorList<T> {
        assert_eq!(parameters.len(), gradients.len());
        if !fits(&self.velocity, parameters) {
            self.velocity = parameters.iter().map(|p| vec![T::zero(); p.count()]).collect();
        }
        let lr = T::cast(self.learning_rate);
        let momentum = T::cast(self.momentum);
        self.step += 1;
        parameters
            .iter()
            .zip(gradients.iter())
            .zip(self.velocity.iter_mut())
            .map(|((param, grad), velocity)| {
                let updated = param
                    .array()
                    .iter()
                    .zip(grad.array().iter())
                    .zip(velocity.iter_mut())
                    .map(|((&p, &g), v)| {
                        *v = momentum * *v + g;
                        p - lr * *v
                    })
                    .collect();
                RcTensor::parameter(updated, param.shape().to_vec())
            })
            .collect()
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            config: OptimizerConfig::Sgd {
                momentum: self.momentum,
            },
            learning_rate: self.learning_rate,
            step: self.step,
            buffers: self.velocity.iter().map(|v| to_f64(v)).collect(),
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let momentum = match state.config {
            OptimizerConfig::Sgd { momentum } => momentum,
            other => {
                return Err(OperatorError::InvalidConfig(format!(
                    "can not load {other:?} state into sgd"
                )))
            }
        };
        self.momentum = momentum;
        self.learning_rate = state.learning_rate;
        self.step = state.step;
        self.velocity = state.buffers.iter().map(|b| from_f64(b)).collect();
        Ok(())
    }
}

#[test]
fn test_sgd_step() {
    let mut sgd = Sgd::new(0.1, 0.0);
    let param = RcTensor::parameter(vec![1.0, 2.0], vec![2]);
    let grad = RcTensor::new(vec![1.0, -1.0], vec![2]);
    let updated = sgd.step(&[param.clone()], &[grad]);
    assert_eq!(updated[0].array(), &[0.9, 2.1]);
    assert!(updated[0].requires_grad());
    // the input is left alone
    assert_eq!(param.array(), &[1.0, 2.0]);
}

#[test]
fn test_sgd_momentum_state_round_trip() {
    let mut sgd: Sgd<f64> = Sgd::new(0.1, 0.5);
    let param = RcTensor::parameter(vec![1.0], vec![1]);
    let grad = RcTensor::new(vec![2.0], vec![1]);
    sgd.step(&[param.clone()], &[grad.clone()]);
    let state = sgd.state();
    assert_eq!(state.buffers, vec![vec![2.0]]);

    let mut restored: Sgd<f64> = Sgd::new(1.0, 0.0);
    restored.load_state(state).unwrap();
    let a = sgd.step(&[param.clone()], &[grad.clone()]);
    let b = restored.step(&[param], &[grad]);
    assert_eq!(a[0].array(), b[0].array());
}

#[test]
fn test_sgd_state_sizes() {
    let state = OptimizerState {
        config: OptimizerConfig::Sgd { momentum: 0.5 },
        learning_rate: 0.1,
        step: 3,
        buffers: vec![vec![0.0, 0.0], vec![1.0]],
    };
    assert!(state.check_sizes(&[2, 1]).is_ok());
    assert!(state.check_sizes(&[2, 2]).is_err());
    assert!(state.check_sizes(&[2]).is_err());
    let empty = OptimizerState {
        buffers: vec![],
        ..state
    };
    assert!(empty.check_sizes(&[5]).is_ok());
}
