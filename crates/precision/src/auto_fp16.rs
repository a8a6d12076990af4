use candle_core::{DType, Result};

use crate::{
    cast::{cast_positional, HALF_PRECISION},
    Arg, MixedPrecision,
};

/// Casts tensor inputs of a call to half precision when its owner has
/// mixed precision enabled.
///
/// ```ignore
/// let forward = AutoFp16::new().apply_to([0]);
/// let out = forward.call(&head, vec![Arg::Tensor(features)], |head, args| head.forward(args))?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoFp16 {
    apply_to: Option<Vec<usize>>,
    dtype: DType,
}

impl Default for AutoFp16 {
    fn default() -> Self {
        Self {
            apply_to: None,
            dtype: HALF_PRECISION,
        }
    }
}

impl AutoFp16 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts casting to the given argument positions. Positions index
    /// the `args` passed to `call`, which never include the owner, so `0`
    /// is the first data argument.
    pub fn apply_to(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.apply_to = Some(positions.into_iter().collect());
        self
    }

    /// Uses another reduced dtype such as `BF16` instead of `F16`.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn positions(&self) -> Option<&[usize]> {
        self.apply_to.as_deref()
    }

    /// Runs `func`, first casting the selected tensor arguments when
    /// `owner.fp16_enabled()`. The result is returned without casting.
    pub fn call<S, O, R, F>(&self, owner: &S, args: Vec<Arg<O>>, func: F) -> Result<R>
    where
        S: MixedPrecision + ?Sized,
        F: FnOnce(&S, Vec<Arg<O>>) -> Result<R>,
    {
        if !owner.fp16_enabled() {
            return func(owner, args);
        }

        log::trace!("auto_fp16: casting inputs to {:?}", self.dtype);
        let args = cast_positional(args, self.positions(), self.dtype)?;
        func(owner, args)
    }

    /// Turns `func` into a reusable wrapped function.
    pub fn wrap<S, O, R, F>(self, func: F) -> impl Fn(&S, Vec<Arg<O>>) -> Result<R>
    where
        S: MixedPrecision + ?Sized,
        F: Fn(&S, Vec<Arg<O>>) -> Result<R>,
    {
        move |owner: &S, args: Vec<Arg<O>>| self.call(owner, args, &func)
    }
}
