use std::path::Path;

use precision::MixedPrecision;
use registry::{BuildArgs, ConfigDict};

use super::{
    base::{take_limits, RunnerCore},
    RunSummary, Runner, RunnerParts, StepFn,
};
use crate::{optimizer::Optimizer, TrainingError};

/// Runs a fixed number of iterations, restarting the data whenever an epoch
/// runs out.
pub struct IterBasedRunner {
    core: RunnerCore,
    max_iters: usize,
}

pub(crate) fn build_iter_runner(
    mut args: BuildArgs,
    parts: RunnerParts,
) -> registry::Result<Box<dyn Runner>> {
    let max_iters = match take_limits(&mut args)? {
        (None, Some(max_iters)) => max_iters,
        (Some(_), None) => {
            return Err(args.invalid("max_epochs", "IterBasedRunner is bounded by max_iters"))
        }
        _ => args.require("max_iters")?,
    };
    let core = RunnerCore::from_args("IterBasedRunner", &mut args, parts.optimizer)?;
    args.finish()?;
    Ok(Box::new(IterBasedRunner { core, max_iters }))
}

impl MixedPrecision for IterBasedRunner {
    fn fp16_enabled(&self) -> bool {
        self.core.fp16_enabled()
    }
}

impl Runner for IterBasedRunner {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn epoch(&self) -> usize {
        self.core.epoch
    }

    fn iter(&self) -> usize {
        self.core.iter
    }

    fn inner_iter(&self) -> usize {
        self.core.inner_iter
    }

    fn max_epochs(&self) -> Option<usize> {
        None
    }

    fn max_iters(&self) -> Option<usize> {
        Some(self.max_iters)
    }

    fn work_dir(&self) -> Option<&Path> {
        self.core.work_dir()
    }

    fn meta(&self) -> &ConfigDict {
        self.core.meta()
    }

    fn loss_scale(&self) -> Option<f32> {
        self.core.loss_scale()
    }

    fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.core.optimizer()
    }

    fn optimizer_mut(&mut self) -> Option<&mut dyn Optimizer> {
        self.core.optimizer_mut()
    }

    fn run(&mut self, step: &mut StepFn<'_>) -> Result<RunSummary, TrainingError> {
        self.core.ensure_optimizer()?;
        log::info!(
            "{}: start running, work_dir: {}, max iters {}",
            self.core.name(),
            self.core
                .work_dir()
                .map_or_else(|| "<none>".to_string(), |dir| dir.display().to_string()),
            self.max_iters
        );

        while self.core.iter < self.max_iters {
            match step(&self.core.context())? {
                Some(loss) => self.core.train_step(&loss)?,
                None if self.core.inner_iter == 0 => {
                    return Err(TrainingError::runtime(format!(
                        "no batches available for epoch {}",
                        self.core.epoch + 1
                    )))
                }
                None => {
                    self.core.epoch += 1;
                    self.core.inner_iter = 0;
                }
            }
        }
        Ok(self.core.summary())
    }
}
