use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::Deserialize;

use crate::TrainingError;

/// The `fp16` section of a runner config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fp16Config {
    #[serde(default)]
    pub loss_scale: LossScaleSetting,
}

/// `loss_scale` accepts a number (static scale), `"dynamic"`, or a mapping
/// of dynamic scaling settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LossScaleSetting {
    Static(f32),
    Named(String),
    Dynamic(DynamicLossScale),
}

impl Default for LossScaleSetting {
    fn default() -> Self {
        Self::Static(512.0)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DynamicLossScale {
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for DynamicLossScale {
    fn default() -> Self {
        Self {
            init_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Scales the loss before backward and unscales gradients afterwards.
///
/// A static scale never reports overflow. A dynamic scale backs off when
/// gradients overflow and grows again after `growth_interval` clean steps.
#[derive(Debug, Clone)]
pub struct LossScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Static(f32),
    Dynamic(DynamicState),
}

#[derive(Debug, Clone)]
struct DynamicState {
    loss_scale: f32,
    stable_steps: usize,
    config: DynamicLossScale,
}

impl LossScaler {
    pub fn disabled() -> Self {
        Self {
            state: ScalerState::Disabled,
        }
    }

    pub fn from_setting(setting: LossScaleSetting) -> Result<Self, String> {
        match setting {
            LossScaleSetting::Static(scale) if scale.is_finite() && scale > 0.0 => Ok(Self {
                state: ScalerState::Static(scale),
            }),
            LossScaleSetting::Static(scale) => Err(format!("invalid static loss scale {}", scale)),
            LossScaleSetting::Named(name) if name == "dynamic" => {
                Ok(Self::dynamic(DynamicLossScale::default()))
            }
            LossScaleSetting::Named(name) => Err(format!(
                "loss_scale must be a number, \"dynamic\" or a mapping, found \"{}\"",
                name
            )),
            LossScaleSetting::Dynamic(config) => Ok(Self::dynamic(config)),
        }
    }

    pub fn dynamic(config: DynamicLossScale) -> Self {
        let config = sanitize_config(config);
        Self {
            state: ScalerState::Dynamic(DynamicState {
                loss_scale: config.init_scale,
                stable_steps: 0,
                config,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, ScalerState::Disabled)
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.state, ScalerState::Dynamic(_))
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Static(scale) => *scale,
            ScalerState::Dynamic(state) => state.loss_scale,
        }
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        if !self.is_enabled() {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.loss_scale() as f64, 0.0)?)
    }

    /// Divides the gradients of `params` by the current scale in place.
    /// Returns whether any of them overflowed, which only a dynamic scale
    /// checks.
    pub fn unscale_grads(&self, grads: &mut GradStore, params: &[Var]) -> Result<bool, TrainingError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let inv_scale = 1.0 / self.loss_scale() as f64;
        let check = self.is_dynamic();
        let mut found_inf = false;
        for var in params {
            let Some(grad) = grads.remove(var.as_tensor()) else {
                continue;
            };
            let grad = grad.affine(inv_scale, 0.0)?;
            if check && !found_inf {
                found_inf = contains_non_finite(&grad)?;
            }
            grads.insert(var.as_tensor(), grad);
        }
        Ok(found_inf)
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Dynamic(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(values.iter().any(|value| !value.is_finite()))
}

fn sanitize_config(mut config: DynamicLossScale) -> DynamicLossScale {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.init_scale = config.init_scale.clamp(config.min_scale, config.max_scale);
    config
}
