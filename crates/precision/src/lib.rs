//! Precision-casting call wrappers for mixed-precision training.
//!
//! Modules opt into mixed precision through [`MixedPrecision`]. When the flag
//! is off, [`AutoFp16`] and [`ForceFp32`] are transparent and the wrapped
//! function sees exactly the arguments it was given. When it is on,
//! [`AutoFp16`] moves tensor inputs to half precision for the forward pass
//! and [`ForceFp32`] brings inputs and outputs back to full precision for
//! numerically sensitive code such as losses.

mod args;
mod auto_fp16;
pub mod cast;
mod force_fp32;

pub use args::Arg;
pub use auto_fp16::AutoFp16;
pub use cast::{cast_tensor, epsilon_for, FULL_PRECISION, HALF_PRECISION};
pub use force_fp32::ForceFp32;

/// Exposes the "mixed precision enabled" flag of a module.
///
/// The default reports the flag as absent, which the wrappers treat the same
/// as disabled.
pub trait MixedPrecision {
    fn fp16_enabled(&self) -> bool {
        false
    }
}

impl MixedPrecision for bool {
    fn fp16_enabled(&self) -> bool {
        *self
    }
}

impl MixedPrecision for () {}

impl<T: MixedPrecision + ?Sized> MixedPrecision for &T {
    fn fp16_enabled(&self) -> bool {
        (**self).fp16_enabled()
    }
}

impl<T: MixedPrecision> MixedPrecision for Option<T> {
    fn fp16_enabled(&self) -> bool {
        self.as_ref().is_some_and(|inner| inner.fp16_enabled())
    }
}

impl<T: MixedPrecision + ?Sized> MixedPrecision for Box<T> {
    fn fp16_enabled(&self) -> bool {
        (**self).fp16_enabled()
    }
}
