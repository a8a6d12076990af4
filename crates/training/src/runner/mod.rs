//! Training loop drivers built from configuration.
//!
//! [`build_runner`] mirrors [`crate::build_optimizer`]: the `constructor`
//! key picks a [`RunnerConstructor`] from the `runner builder` registry, and
//! that constructor builds the runner named by `type` from the `runner`
//! registry. Values that cannot live in a config, such as the optimizer,
//! travel alongside as [`RunnerDefaults`].

mod base;
mod constructor;
mod epoch;
mod iter;
mod scaler;

use std::{path::Path, sync::OnceLock};

use candle_core::Tensor;
use precision::MixedPrecision;
use registry::{ConfigDict, Registry, TYPE_KEY};

use crate::{builder::take_constructor, optimizer::Optimizer, TrainingError};

pub use constructor::{DefaultRunnerConstructor, RunnerConstructor, DEFAULT_RUNNER_CONSTRUCTOR};
pub use epoch::EpochBasedRunner;
pub use iter::IterBasedRunner;
pub use scaler::{DynamicLossScale, Fp16Config, LossScaleSetting, LossScaler};

/// Position of the runner when a step is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    pub epoch: usize,
    pub iter: usize,
    pub inner_iter: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub epochs: usize,
    pub iters: usize,
    pub skipped_steps: usize,
    pub last_loss: Option<f32>,
}

/// Supplies the loss for the next batch, or `None` once the data for the
/// current epoch is exhausted.
pub type StepFn<'a> = dyn FnMut(&StepContext) -> Result<Option<Tensor>, TrainingError> + 'a;

/// A training loop driver.
///
/// A runner reports mixed precision as enabled when it scales the loss, so
/// it can own calls wrapped with [`precision::AutoFp16`] or
/// [`precision::ForceFp32`].
pub trait Runner: MixedPrecision {
    fn name(&self) -> &str;

    fn epoch(&self) -> usize;

    fn iter(&self) -> usize;

    fn inner_iter(&self) -> usize;

    fn max_epochs(&self) -> Option<usize>;

    fn max_iters(&self) -> Option<usize>;

    fn work_dir(&self) -> Option<&Path>;

    fn meta(&self) -> &ConfigDict;

    /// Current loss scale, `None` without fp16.
    fn loss_scale(&self) -> Option<f32>;

    fn optimizer(&self) -> Option<&dyn Optimizer>;

    fn optimizer_mut(&mut self) -> Option<&mut dyn Optimizer>;

    /// Drives `step` until the configured limit, running backward and the
    /// optimizer on every loss it returns.
    fn run(&mut self, step: &mut StepFn<'_>) -> Result<RunSummary, TrainingError>;
}

/// Arguments handed to runners alongside the config.
pub struct RunnerParts {
    pub optimizer: Option<Box<dyn Optimizer>>,
}

/// Defaults applied by [`build_runner`]: config values filled in where the
/// runner config leaves them out, plus the optimizer to drive.
#[derive(Default)]
pub struct RunnerDefaults {
    pub values: ConfigDict,
    pub optimizer: Option<Box<dyn Optimizer>>,
}

impl RunnerDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key, value);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }
}

pub fn runners() -> &'static Registry<Box<dyn Runner>, RunnerParts> {
    static RUNNERS: OnceLock<Registry<Box<dyn Runner>, RunnerParts>> = OnceLock::new();
    RUNNERS.get_or_init(|| {
        let registry = Registry::new("runner");
        registry.register_force("EpochBasedRunner", epoch::build_epoch_runner);
        registry.register_force("IterBasedRunner", iter::build_iter_runner);
        registry
    })
}

pub fn runner_builders() -> &'static Registry<Box<dyn RunnerConstructor>, Option<RunnerDefaults>> {
    static BUILDERS: OnceLock<Registry<Box<dyn RunnerConstructor>, Option<RunnerDefaults>>> =
        OnceLock::new();
    BUILDERS.get_or_init(|| {
        let registry = Registry::new("runner builder");
        registry.register_force(DEFAULT_RUNNER_CONSTRUCTOR, constructor::build_default);
        registry
    })
}

pub fn build_runner_constructor(
    cfg: ConfigDict,
    default_args: Option<RunnerDefaults>,
) -> registry::Result<Box<dyn RunnerConstructor>> {
    runner_builders().build(cfg, default_args)
}

/// Builds the runner described by `cfg`.
///
/// `constructor` selects the runner constructor (default
/// [`DEFAULT_RUNNER_CONSTRUCTOR`]); the rest of `cfg` is the runner config.
/// `cfg` is left untouched.
pub fn build_runner(
    cfg: &ConfigDict,
    default_args: Option<RunnerDefaults>,
) -> registry::Result<Box<dyn Runner>> {
    let mut runner_cfg = cfg.clone();
    let constructor_type = take_constructor(&mut runner_cfg, "runner", DEFAULT_RUNNER_CONSTRUCTOR)?;
    let constructor = build_runner_constructor(
        ConfigDict::new()
            .with(TYPE_KEY, constructor_type)
            .with("runner_cfg", runner_cfg),
        default_args,
    )?;
    constructor.construct()
}
