use crate::error::{OperatorError, Result};
use crate::optim::{fits, from_f64, to_f64, Optimizer, OptimizerConfig, OptimizerState};
use crate::tensor::{Float, RcTensor, TensorList};

/// Adam with bias-corrected first and second moment estimates.
pub struct Adam<T: Float> {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    first_moment: Vec<Vec<T>>,
    second_moment: Vec<Vec<T>>,
    step: usize,
}

impl<T: Float> Adam<T> {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        assert!(learning_rate > 0.0, "Step size must be positive!");
        Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            first_moment: vec![],
            second_moment: vec![],
            step: 0,
        }
    }
}

impl<T: Float> Optimizer<T> for Adam<T> {
    fn step(&mut self, parameters: &[RcTensor<T>], gradients: &[RcTensor<T>]) -> TensorList<T> {
        assert_eq!(parameters.len(), gradients.len());
        if !fits(&self.first_moment, parameters) || !fits(&self.second_moment, parameters) {
            self.first_moment = parameters.iter().map(|p| vec![T::zero(); p.count()]).collect();
            self.second_moment = self.first_moment.clone();
        }
        self.step += 1;
        let (b1, b2) = (T::cast(self.beta1), T::cast(self.beta2));
        let correction1 = T::cast(1.0 - self.beta1.powi(self.step as i32));
        let correction2 = T::cast(1.0 - self.beta2.powi(self.step as i32));
        let lr = T::cast(self.learning_rate);
        let eps = T::cast(self.epsilon);

        let mut updated = Vec::with_capacity(parameters.len());
        for (i, (param, grad)) in parameters.iter().zip(gradients.iter()).enumerate() {
            let m = &mut self.first_moment[i];
            let v = &mut self.second_moment[i];
            let mut array = Vec::with_capacity(param.count());
            for (j, (&p, &g)) in param.array().iter().zip(grad.array().iter()).enumerate() {
                m[j] = b1 * m[j] + (T::one() - b1) * g;
                v[j] = b2 * v[j] + (T::one() - b2) * g * g;
                let m_hat = m[j] / correction1;
                let v_hat = v[j] / correction2;
                array.push(p - lr * m_hat / (v_hat.sqrt() + eps));
            }
            updated.push(RcTensor::parameter(array, param.shape().to_vec()));
        }
        updated
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn state(&self) -> OptimizerState {
        OptimizerState {
            config: OptimizerConfig::Adam {
                beta1: self.beta1,
                beta2: self.beta2,
                epsilon: self.epsilon,
            },
            learning_rate: self.learning_rate,
            step: self.step,
            buffers: self
                .first_moment
                .iter()
                .chain(self.second_moment.iter())
                .map(|b| to_f64(b))
                .collect(),
        }
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let (beta1, beta2, epsilon) = match state.config {
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
            } => (beta1, beta2, epsilon),
            other => {
                return Err(OperatorError::InvalidConfig(format!(
                    "can not load {other:?} state into adam"
                )))
            }
        };
        if state.buffers.len() % 2 != 0 {
            return Err(OperatorError::Shape(format!(
                "adam state needs paired moment buffers, got {}",
                state.buffers.len()
            )));
        }
        let half = state.buffers.len() / 2;
        self.beta1 = beta1;
        self.beta2 = beta2;
        self.epsilon = epsilon;
        self.learning_rate = state.learning_rate;
        self.step = state.step;
        self.first_moment = state.buffers[..half].iter().map(|b| from_f64(b)).collect();
        self.second_moment = state.buffers[half..].iter().map(|b| from_f64(b)).collect();
        Ok(())
    }
}

#[test]
fn test_adam_first_step_moves_by_learning_rate() {
    // with bias correction the first step is lr * sign(g)
    let mut adam: Adam<f64> = Adam::new(0.01, 0.9, 0.999, 1e-8);
    let param = RcTensor::parameter(vec![1.0, -1.0], vec![2]);
    let grad = RcTensor::new(vec![3.0, -0.5], vec![2]);
    let updated = adam.step(&[param], &[grad]);
    assert!((updated[0].array()[0] - 0.99).abs() < 1e-6);
    assert!((updated[0].array()[1] + 0.99).abs() < 1e-6);
}

#[test]
fn test_adam_rejects_sgd_state() {
    let mut adam: Adam<f64> = Adam::new(0.01, 0.9, 0.999, 1e-8);
    let state = OptimizerState {
        config: OptimizerConfig::Sgd { momentum: 0.0 },
        learning_rate: 0.1,
        step: 0,
        buffers: vec![],
    };
    assert!(adam.load_state(state).is_err());
}

#[test]
fn test_adam_resets_statistics_that_do_not_fit() {
    let mut adam: Adam<f64> = Adam::new(0.01, 0.9, 0.999, 1e-8);
    let state = OptimizerState {
        config: OptimizerConfig::default(),
        learning_rate: 0.01,
        step: 0,
        buffers: vec![vec![0.0], vec![0.0]],
    };
    assert!(state.check_sizes(&[2]).is_err());
    assert!(state.check_sizes(&[1]).is_ok());
    adam.load_state(state).unwrap();

    // one-element buffers for a two-element parameter
    let param = RcTensor::parameter(vec![1.0, -1.0], vec![2]);
    let grad = RcTensor::new(vec![3.0, -0.5], vec![2]);
    let updated = adam.step(&[param], &[grad]);
    assert!((updated[0].array()[0] - 0.99).abs() < 1e-6);
    assert_eq!(adam.state().buffers.len(), 2);
    assert_eq!(adam.state().buffers[0].len(), 2);
}
