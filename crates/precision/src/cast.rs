//! Dtype casting helpers shared by the precision wrappers.
//!
//! Half precision (`f16`) is used for forward computation when a module has
//! mixed precision enabled; full precision (`f32`) is used for losses and
//! other numerically sensitive paths. Casts always produce new tensors and a
//! tensor already in the requested dtype is handed back as-is.

use candle_core::{DType, Result, Tensor};

use crate::Arg;

/// Reduced precision used by [`crate::AutoFp16`] unless overridden.
pub const HALF_PRECISION: DType = DType::F16;

/// Precision restored by [`crate::ForceFp32`].
pub const FULL_PRECISION: DType = DType::F32;

/// Casts `tensor` to `dtype`, returning the same tensor when it already matches.
pub fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

/// Comparison tolerance for values stored in `dtype`.
pub fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

/// Casts the tensor arguments whose position is in `apply_to` (all of them
/// when `None`). Everything else is moved through untouched.
pub(crate) fn cast_positional<O>(
    args: Vec<Arg<O>>,
    apply_to: Option<&[usize]>,
    dtype: DType,
) -> Result<Vec<Arg<O>>> {
    args.into_iter()
        .enumerate()
        .map(|(idx, arg)| {
            let selected = apply_to.map_or(true, |targets| targets.contains(&idx));
            if selected {
                arg.cast_if_tensor(dtype)
            } else {
                Ok(arg)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sample() -> Result<Tensor> {
        Tensor::new(&[[0.1f32, 2.5], [-3.7, 100.25]], &Device::Cpu)
    }

    #[test]
    fn half_then_full_keeps_shape_and_rounds_to_half() -> Result<()> {
        let base = sample()?;
        let half = cast_tensor(&base, HALF_PRECISION)?;
        assert_eq!(half.dtype(), DType::F16);
        assert_eq!(half.dims(), &[2, 2]);

        let full = cast_tensor(&half, FULL_PRECISION)?;
        assert_eq!(full.dtype(), DType::F32);
        assert_eq!(full.dims(), &[2, 2]);

        // Nearest f16 values: 0.1 and -3.7 are not representable, the others are.
        let restored = full.to_vec2::<f32>()?;
        assert_eq!(restored, vec![vec![0.099_975_585_937_5, 2.5], vec![-3.699_218_75, 100.25]]);

        let original = base.to_vec2::<f32>()?;
        let eps = epsilon_for(HALF_PRECISION);
        for (orig_row, rest_row) in original.iter().zip(restored.iter()) {
            for (orig, rest) in orig_row.iter().zip(rest_row.iter()) {
                assert!(rest.is_finite());
                assert!((orig - rest).abs() <= eps * orig.abs().max(1.0));
            }
        }
        Ok(())
    }

    #[test]
    fn matching_dtype_returns_same_tensor() -> Result<()> {
        let base = sample()?;
        let same = cast_tensor(&base, DType::F32)?;
        assert_eq!(same.id(), base.id());

        let cast = cast_tensor(&base, DType::F16)?;
        assert_ne!(cast.id(), base.id());
        assert_eq!(base.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn bf16_is_coarser_than_f16() -> Result<()> {
        let base = sample()?;
        let bf16 = cast_tensor(&base, DType::BF16)?.to_dtype(DType::F32)?;
        let values = bf16.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values[1], 2.5);
        assert!((values[0] - 0.1).abs() <= epsilon_for(DType::BF16));
        assert!(epsilon_for(DType::BF16) > epsilon_for(DType::F16));
        Ok(())
    }

    #[test]
    fn positional_selection_only_touches_targets() -> Result<()> {
        let base = sample()?;
        let args: Vec<Arg<()>> = vec![
            Arg::Tensor(base.clone()),
            Arg::Other(()),
            Arg::Tensor(base.clone()),
        ];
        let cast = cast_positional(args, Some(&[2]), DType::F16)?;
        assert_eq!(cast[0].tensor().map(Tensor::dtype), Some(DType::F32));
        assert!(matches!(cast[1], Arg::Other(())));
        assert_eq!(cast[2].tensor().map(Tensor::dtype), Some(DType::F16));
        Ok(())
    }
}
