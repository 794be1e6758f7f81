use crate::tensor::{Numeric, RcTensor};

pub(crate) mod private {
    pub trait Private {}
}

pub trait Module<T: Numeric>: private::Private {
    type InputType;
    type OutputType;

    fn forward(&self, inputs: Self::InputType) -> Self::OutputType;

    /// Learnable tensors, in a fixed order. Calling again restarts the sequence.
    fn parameters(&self) -> Box<dyn Iterator<Item = &RcTensor<T>> + '_>;

    /// Same order as `parameters`, for swapping in updated values.
    fn parameters_mut(&mut self) -> Box<dyn Iterator<Item = &mut RcTensor<T>> + '_>;

    fn num_params(&self) -> usize {
        self.parameters().map(|p| p.count()).sum()
    }
}
