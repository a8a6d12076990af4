use std::path::Path;

use precision::MixedPrecision;
use registry::{BuildArgs, ConfigDict};

use super::{
    base::{take_limits, RunnerCore},
    RunSummary, Runner, RunnerParts, StepFn,
};
use crate::{optimizer::Optimizer, TrainingError};

/// Runs whole passes over the data until `max_epochs` is reached.
pub struct EpochBasedRunner {
    core: RunnerCore,
    max_epochs: usize,
}

pub(crate) fn build_epoch_runner(
    mut args: BuildArgs,
    parts: RunnerParts,
) -> registry::Result<Box<dyn Runner>> {
    let max_epochs = match take_limits(&mut args)? {
        (Some(max_epochs), None) => max_epochs,
        (None, Some(_)) => {
            return Err(args.invalid("max_iters", "EpochBasedRunner is bounded by max_epochs"))
        }
        _ => args.require("max_epochs")?,
    };
    let core = RunnerCore::from_args("EpochBasedRunner", &mut args, parts.optimizer)?;
    args.finish()?;
    Ok(Box::new(EpochBasedRunner { core, max_epochs }))
}

impl MixedPrecision for EpochBasedRunner {
    fn fp16_enabled(&self) -> bool {
        self.core.fp16_enabled()
    }
}

impl Runner for EpochBasedRunner {
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
        Some(self.max_epochs)
    }

    fn max_iters(&self) -> Option<usize> {
        None
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
            "{}: start running, work_dir: {}, max epochs {}",
            self.core.name(),
            self.core
                .work_dir()
                .map_or_else(|| "<none>".to_string(), |dir| dir.display().to_string()),
            self.max_epochs
        );

        while self.core.epoch < self.max_epochs {
            self.core.inner_iter = 0;
            while let Some(loss) = step(&self.core.context())? {
                self.core.train_step(&loss)?;
            }
            self.core.epoch += 1;
            log::info!(
                "{}: epoch [{}/{}] finished after {} iters",
                self.core.name(),
                self.core.epoch,
                self.max_epochs,
                self.core.inner_iter
            );
        }
        Ok(self.core.summary())
    }
}
