use num::traits::real::Real;
pub use num::{One, Zero};
use std::cmp::PartialEq;

pub use std::ops::{Add, AddAssign, Mul, Neg, Sub};

pub trait Numeric:
    Add<Output = Self>
    + AddAssign
    + Copy
    + Clone
    + One
    + Mul<Output = Self>
    + Sub<Output = Self>
    + PartialEq
    + Zero
    + std::fmt::Debug
    + Send
    + Sync
{
}
// https://stackoverflow.com/questions/42381185/specifying-generic-parameter-to-belong-to-a-small-set-of-types
macro_rules! numeric_impl {
    ($($t: ty),+) => {
        $(
            impl Numeric for $t {}
        )+
    }
}

numeric_impl!(usize, u8, u32, u64, u128, i8, i32, i64, i128, f32, f64);

/// Element types the differentiable ops and the operator layers work over.
pub trait Float: Numeric + Real + std::fmt::Display + std::iter::Sum + 'static {
    fn cast(value: f64) -> Self;
    fn as_f64(self) -> f64;
    fn finite(self) -> bool;
}

macro_rules! float_impl {
    ($($t: ty),+) => {
        $(
            impl Float for $t {
                #[inline]
                fn cast(value: f64) -> Self {
                    value as $t
                }
                #[inline]
                fn as_f64(self) -> f64 {
                    self as f64
                }
                #[inline]
                fn finite(self) -> bool {
                    <$t>::is_finite(self)
                }
            }
        )+
    }
}

float_impl!(f32, f64);
