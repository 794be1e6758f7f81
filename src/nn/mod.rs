mod feed_foward;
mod linear;
pub(crate) mod module;

pub use feed_foward::Mlp;
pub use linear::{Activation, ActivationFn, Linear};
pub use module::Module;
