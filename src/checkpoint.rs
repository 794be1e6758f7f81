use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::tensor::{Float, RcTensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl TensorRecord {
    pub fn from_tensor<T: Float>(name: String, tensor: &RcTensor<T>) -> Self {
        Self {
            name,
            shape: tensor.shape().to_vec(),
            data: tensor.array().iter().map(|x| x.as_f64()).collect(),
        }
    }

    /// A fresh parameter holding the recorded values.
    pub fn to_parameter<T: Float>(&self) -> Result<RcTensor<T>> {
        if self.shape.iter().product::<usize>() != self.data.len() {
            return Err(OperatorError::Shape(format!(
                "record {} has {} values for shape {:?}",
                self.name,
                self.data.len(),
                self.shape
            )));
        }
        Ok(RcTensor::parameter(
            self.data.iter().map(|&x| T::cast(x)).collect(),
            self.shape.clone(),
        ))
    }
}

/// Named parameter values of an operator, in `parameters()` order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub tensors: Vec<TensorRecord>,
}

impl StateDict {
    pub fn from_parameters<'a, T, I>(prefix: &str, parameters: I) -> Self
    where
        T: Float,
        I: Iterator<Item = &'a RcTensor<T>>,
    {
        Self {
            tensors: parameters
                .enumerate()
                .map(|(i, p)| TensorRecord::from_tensor(format!("{prefix}.{i}"), p))
                .collect(),
        }
    }

    /// Replaces every slot with the matching record. Nothing is written unless
    /// all counts and shapes match.
    pub fn load_into<'a, T, I>(&self, slots: I) -> Result<()>
    where
        T: Float + 'a,
        I: Iterator<Item = &'a mut RcTensor<T>>,
    {
        let slots: Vec<&mut RcTensor<T>> = slots.collect();
        if slots.len() != self.tensors.len() {
            return Err(OperatorError::Shape(format!(
                "state dict holds {} tensors, the operator has {}",
                self.tensors.len(),
                slots.len()
            )));
        }
        let mut loaded = Vec::with_capacity(slots.len());
        for (slot, record) in slots.iter().zip(self.tensors.iter()) {
            if slot.shape() != record.shape.as_slice() {
                return Err(OperatorError::Shape(format!(
                    "{} has shape {:?}, the operator expects {:?}",
                    record.name,
                    record.shape,
                    slot.shape()
                )));
            }
            loaded.push(record.to_parameter()?);
        }
        for (slot, value) in slots.into_iter().zip(loaded) {
            *slot = value;
        }
        Ok(())
    }
}

#[test]
fn test_state_dict_load_checks_shapes() {
    let mut params = vec![
        RcTensor::parameter(vec![1.0, 2.0], vec![1, 2]),
        RcTensor::parameter(vec![3.0], vec![1, 1]),
    ];
    let saved = StateDict::from_parameters("net", params.iter());
    assert_eq!(saved.tensors[1].name, "net.1");

    let mut other = vec![
        RcTensor::parameter(vec![0.0, 0.0], vec![1, 2]),
        RcTensor::parameter(vec![0.0], vec![1, 1]),
    ];
    saved.load_into(other.iter_mut()).unwrap();
    assert_eq!(other[0].array(), &[1.0, 2.0]);
    assert!(other[0].requires_grad());

    params.pop();
    let short = StateDict::from_parameters("net", params.iter());
    assert!(short.load_into(other.iter_mut()).is_err());
}
