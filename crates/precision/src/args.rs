use candle_core::{DType, Result, Tensor};

use crate::cast::cast_tensor;

/// A positional argument or return value passed through a precision wrapper.
///
/// Only [`Arg::Tensor`] values are ever cast. [`Arg::Tuple`] models a tuple
/// return value; its tensor elements are cast one by one by
/// [`crate::ForceFp32`]. [`Arg::Other`] carries any non-tensor value and is
/// always moved through unchanged.
#[derive(Debug, Clone)]
pub enum Arg<O = serde_json::Value> {
    Tensor(Tensor),
    Tuple(Vec<Arg<O>>),
    Other(O),
}

impl<O> Arg<O> {
    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Arg::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            Arg::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Arg<O>]> {
        match self {
            Arg::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn other(&self) -> Option<&O> {
        match self {
            Arg::Other(value) => Some(value),
            _ => None,
        }
    }

    /// Casts a tensor to `dtype`; tuples and other values are returned as-is.
    pub fn cast_if_tensor(self, dtype: DType) -> Result<Self> {
        match self {
            Arg::Tensor(tensor) => cast_tensor(&tensor, dtype).map(Arg::Tensor),
            other => Ok(other),
        }
    }
}

impl<O> From<Tensor> for Arg<O> {
    fn from(tensor: Tensor) -> Self {
        Arg::Tensor(tensor)
    }
}
