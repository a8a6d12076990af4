use candle_core::Result;

use crate::{
    cast::{cast_positional, cast_tensor, FULL_PRECISION},
    Arg, MixedPrecision,
};

/// Forces a call to run in full precision when its owner has mixed
/// precision enabled, typically around loss computation.
///
/// Selected tensor arguments are cast to `f32` before the call. With
/// `out_fp32` (the default) a tensor result, or each tensor element of a
/// tuple result, is cast to `f32` afterwards; other elements keep their
/// position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceFp32 {
    apply_to: Option<Vec<usize>>,
    out_fp32: bool,
}

impl Default for ForceFp32 {
    fn default() -> Self {
        Self {
            apply_to: None,
            out_fp32: true,
        }
    }
}

impl ForceFp32 {
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

    pub fn out_fp32(mut self, enabled: bool) -> Self {
        self.out_fp32 = enabled;
        self
    }

    pub fn positions(&self) -> Option<&[usize]> {
        self.apply_to.as_deref()
    }

    pub fn call<S, O, F>(&self, owner: &S, args: Vec<Arg<O>>, func: F) -> Result<Arg<O>>
    where
        S: MixedPrecision + ?Sized,
        F: FnOnce(&S, Vec<Arg<O>>) -> Result<Arg<O>>,
    {
        if !owner.fp16_enabled() {
            return func(owner, args);
        }

        let args = cast_positional(args, self.positions(), FULL_PRECISION)?;
        let output = func(owner, args)?;
        if !self.out_fp32 {
            return Ok(output);
        }

        log::trace!("force_fp32: casting output to {:?}", FULL_PRECISION);
        match output {
            Arg::Tensor(tensor) => cast_tensor(&tensor, FULL_PRECISION).map(Arg::Tensor),
            Arg::Tuple(items) => items
                .into_iter()
                .map(|item| item.cast_if_tensor(FULL_PRECISION))
                .collect::<Result<Vec<_>>>()
                .map(Arg::Tuple),
            other => Ok(other),
        }
    }

    pub fn wrap<S, O, F>(self, func: F) -> impl Fn(&S, Vec<Arg<O>>) -> Result<Arg<O>>
    where
        S: MixedPrecision + ?Sized,
        F: Fn(&S, Vec<Arg<O>>) -> Result<Arg<O>>,
    {
        move |owner: &S, args: Vec<Arg<O>>| self.call(owner, args, &func)
    }
}
