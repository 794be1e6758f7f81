use crate::tensor::RcTensor;

// These are all aliases that should probably be converted to traits/structs at somepoint
// However they exist now for the sake of readability.
pub type TensorList<T> = Vec<RcTensor<T>>;

pub type Scalar<T> = RcTensor<T>;

/// Shapes are indexed with slices throughout.
pub type IndexType<'a> = &'a [usize];
