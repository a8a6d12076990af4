use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use registry::{BuildArgs, BuildError, ConfigDict};
use serde::Deserialize;

use super::{
    scaler::{Fp16Config, LossScaler},
    RunSummary, StepContext,
};
use crate::{optimizer::Optimizer, TrainingError};

const DEFAULT_LOG_INTERVAL: usize = 10;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
struct GradClipConfig {
    max_norm: f64,
}

/// State and step logic shared by the built-in runners.
pub(crate) struct RunnerCore {
    name: &'static str,
    work_dir: Option<PathBuf>,
    meta: ConfigDict,
    log_interval: usize,
    grad_clip: Option<f64>,
    scaler: LossScaler,
    optimizer: Option<Box<dyn Optimizer>>,
    pub(crate) epoch: usize,
    pub(crate) iter: usize,
    pub(crate) inner_iter: usize,
    skipped_steps: usize,
    last_loss: Option<f32>,
}

/// `max_epochs` and `max_iters` as given; at most one may be set.
pub(crate) fn take_limits(args: &mut BuildArgs) -> registry::Result<(Option<usize>, Option<usize>)> {
    let max_epochs: Option<usize> = args.take("max_epochs")?;
    let max_iters: Option<usize> = args.take("max_iters")?;
    if max_epochs.is_some() && max_iters.is_some() {
        return Err(args.invalid("max_iters", "only one of max_epochs or max_iters can be set"));
    }
    Ok((max_epochs, max_iters))
}

impl RunnerCore {
    /// Consumes the keys common to every runner. The caller finishes `args`.
    pub(crate) fn from_args(
        name: &'static str,
        args: &mut BuildArgs,
        optimizer: Option<Box<dyn Optimizer>>,
    ) -> registry::Result<Self> {
        let work_dir: Option<PathBuf> = args.take("work_dir")?;
        let meta: ConfigDict = args.take_or("meta", ConfigDict::new())?;
        let log_interval: usize = args.take_or("log_interval", DEFAULT_LOG_INTERVAL)?;
        if log_interval == 0 {
            return Err(args.invalid("log_interval", "must be at least 1"));
        }
        let grad_clip: Option<GradClipConfig> = args.take("grad_clip")?;
        if let Some(clip) = grad_clip {
            if !(clip.max_norm > 0.0) {
                return Err(args.invalid("grad_clip", "max_norm must be positive"));
            }
        }
        let scaler = match args.take::<Fp16Config>("fp16")? {
            Some(fp16) => LossScaler::from_setting(fp16.loss_scale)
                .map_err(|reason| args.invalid("fp16", reason))?,
            None => LossScaler::disabled(),
        };

        if let Some(dir) = &work_dir {
            fs::create_dir_all(dir).map_err(BuildError::Io)?;
        }

        Ok(Self {
            name,
            work_dir,
            meta,
            log_interval,
            grad_clip: grad_clip.map(|clip| clip.max_norm),
            scaler,
            optimizer,
            epoch: 0,
            iter: 0,
            inner_iter: 0,
            skipped_steps: 0,
            last_loss: None,
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub(crate) fn meta(&self) -> &ConfigDict {
        &self.meta
    }

    pub(crate) fn fp16_enabled(&self) -> bool {
        self.scaler.is_enabled()
    }

    pub(crate) fn loss_scale(&self) -> Option<f32> {
        self.scaler.is_enabled().then(|| self.scaler.loss_scale())
    }

    pub(crate) fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.optimizer.as_deref()
    }

    pub(crate) fn optimizer_mut(&mut self) -> Option<&mut dyn Optimizer> {
        match &mut self.optimizer {
            Some(optimizer) => Some(optimizer.as_mut()),
            None => None,
        }
    }

    pub(crate) fn context(&self) -> StepContext {
        StepContext {
            epoch: self.epoch,
            iter: self.iter,
            inner_iter: self.inner_iter,
        }
    }

    pub(crate) fn summary(&self) -> RunSummary {
        RunSummary {
            epochs: self.epoch,
            iters: self.iter,
            skipped_steps: self.skipped_steps,
            last_loss: self.last_loss,
        }
    }

    pub(crate) fn ensure_optimizer(&self) -> Result<(), TrainingError> {
        if self.optimizer.is_none() {
            return Err(TrainingError::runtime(format!(
                "{} has no optimizer to step",
                self.name
            )));
        }
        Ok(())
    }

    /// Backward, unscale, overflow check, optional clipping and the optimizer
    /// step for one batch. Overflowing fp16 steps are skipped.
    pub(crate) fn train_step(&mut self, loss: &Tensor) -> Result<(), TrainingError> {
        let optimizer = self.optimizer.as_mut().ok_or_else(|| {
            TrainingError::runtime(format!("{} has no optimizer to step", self.name))
        })?;

        let loss_value = loss.to_dtype(DType::F32)?.sum_all()?.to_vec0::<f32>()?;
        let scaled = self.scaler.scale(loss)?;
        let mut grads = scaled.backward()?;

        let params = optimizer.params();
        let found_inf = self.scaler.unscale_grads(&mut grads, &params)?;
        let loss_scale = self.scaler.loss_scale();
        self.scaler.update(found_inf);

        if found_inf {
            self.skipped_steps += 1;
            log::warn!(
                "{}: gradient overflow at iter {} with loss scale {}, skipping step",
                self.name,
                self.iter + 1,
                loss_scale
            );
        } else {
            if let Some(max_norm) = self.grad_clip {
                clip_grad_norm(&mut grads, &params, max_norm)?;
            }
            optimizer.step(&grads)?;
        }

        self.last_loss = Some(loss_value);
        self.iter += 1;
        self.inner_iter += 1;

        if self.iter % self.log_interval == 0 {
            log::info!(
                "{}: epoch {} iter {} loss {:.6} lr {:.3e}",
                self.name,
                self.epoch + 1,
                self.iter,
                loss_value,
                optimizer.learning_rate()
            );
        }
        Ok(())
    }
}

/// Rescales gradients so their global L2 norm does not exceed `max_norm`.
/// Returns the norm before clipping.
pub(crate) fn clip_grad_norm(
    grads: &mut GradStore,
    params: &[Var],
    max_norm: f64,
) -> Result<f64, TrainingError> {
    let mut sum_squares = 0.0f64;
    for var in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_squares += grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_vec0::<f32>()? as f64;
        }
    }

    let total_norm = sum_squares.sqrt();
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in params {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), grad.affine(clip_coef, 0.0)?);
            }
        }
    }
    Ok(total_norm)
}
