use std::collections::{HashMap, HashSet};

use crate::tensor::numeric::*;
use crate::tensor::{RawTensor, RcTensor, TensorList};

/// signature: vjp(inputs, attrs, grad) -> one gradient per input, shaped like that input.
/// `grad` is the gradient of the final scalar with respect to this node's output.
pub(in crate::tensor) type VectorJacobianProduct<T> =
    fn(&[RcTensor<T>], &[usize], &RawTensor<T>) -> Vec<RawTensor<T>>;

#[derive(Clone)]
pub(in crate::tensor) struct Derivative<T: Numeric> {
    inputs: TensorList<T>,
    /// integer attributes of the op (row indices, split sizes, ...)
    attrs: Vec<usize>,
    vector_jacobian_product: VectorJacobianProduct<T>,
    debug_info: String,
}

impl<T: Numeric> Derivative<T> {
    pub fn new(
        inputs: TensorList<T>,
        attrs: Vec<usize>,
        vector_jacobian_product: VectorJacobianProduct<T>,
        debug_info: String,
    ) -> Derivative<T> {
        Derivative {
            inputs,
            attrs,
            vector_jacobian_product,
            debug_info,
        }
    }

    fn input_grads(&self, grad: &RawTensor<T>) -> Vec<RawTensor<T>> {
        let grads = (self.vector_jacobian_product)(&self.inputs, &self.attrs, grad);
        debug_assert_eq!(grads.len(), self.inputs.len(), "{}", self.debug_info);
        for (grad, input) in grads.iter().zip(self.inputs.iter()) {
            debug_assert_eq!(
                grad.shape(),
                input.shape(),
                "grad and input must have the same shape: {}",
                self.debug_info
            );
        }
        grads
    }
}

impl<T: Numeric> std::fmt::Debug for Derivative<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derivative")
            .field("num_inputs", &self.inputs.len())
            .field("debug_info", &self.debug_info)
            .finish()
    }
}

/// Reverse mode sweep from `root`, seeded with `seed` (the gradient of the
/// objective with respect to `root`). Gradients of leaf tensors that require
/// them are accumulated into their `.grad` slot.
pub(in crate::tensor) fn backward<T: Numeric>(root: &RcTensor<T>, seed: RawTensor<T>) {
    if !root.requires_grad {
        return;
    }
    let order = topological_order(root);
    let mut grads: HashMap<*const RawTensor<T>, RawTensor<T>> = HashMap::new();
    grads.insert(root.as_ptr(), seed);

    for node in order.iter().rev() {
        let grad = match grads.remove(&node.as_ptr()) {
            Some(grad) => grad,
            None => continue,
        };
        match node.grad_fn.as_ref() {
            Some(derivative) => {
                let input_grads = derivative.input_grads(&grad);
                for (input, input_grad) in derivative.inputs.iter().zip(input_grads) {
                    if !input.requires_grad {
                        continue;
                    }
                    accumulate(&mut grads, input.as_ptr(), input_grad);
                }
            }
            None => node.accumulate_grad(grad),
        }
    }
}

fn accumulate<T: Numeric>(
    grads: &mut HashMap<*const RawTensor<T>, RawTensor<T>>,
    key: *const RawTensor<T>,
    grad: RawTensor<T>,
) {
    match grads.get_mut(&key) {
        Some(existing) => {
            for (acc, value) in existing.array.iter_mut().zip(grad.array) {
                *acc += value;
            }
        }
        None => {
            grads.insert(key, grad);
        }
    }
}

/// Nodes ordered so that every node comes after all of its inputs.
fn topological_order<T: Numeric>(root: &RcTensor<T>) -> TensorList<T> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.as_ptr()) {
            continue;
        }
        stack.push((node.clone(), true));
        if let Some(derivative) = node.grad_fn.as_ref() {
            for input in derivative.inputs.iter() {
                if input.requires_grad && !visited.contains(&input.as_ptr()) {
                    stack.push((input.clone(), false));
                }
            }
        }
    }
    order
}
