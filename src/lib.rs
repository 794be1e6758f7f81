//! Operator learning: networks that map functions to functions.
//!
//! Functions are carried as [`function::FunctionSet`]s, batches of samples at
//! arbitrary points. Operators such as [`operator::DeepOnet`] evaluate their
//! output at any query points, and [`trainer::Trainer`] fits them with data
//! and physics-informed losses on top of the small autograd engine in
//! [`tensor`].

pub mod callback;
pub mod checkpoint;
pub mod dataset;
pub mod discretization;
pub mod error;
pub mod function;
pub mod loss;
pub mod nn;
pub mod operator;
pub mod optim;
pub mod tensor;
pub mod trainer;

pub use error::{OperatorError, Result};
