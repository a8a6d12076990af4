use registry::{BuildArgs, ConfigDict};

use super::{runners, Runner, RunnerDefaults, RunnerParts};

pub const DEFAULT_RUNNER_CONSTRUCTOR: &str = "DefaultRunnerConstructor";

/// Produces a runner from the config it was built with.
pub trait RunnerConstructor {
    fn construct(self: Box<Self>) -> registry::Result<Box<dyn Runner>>;
}

/// Builds `runner_cfg` from the `runner` registry, filling keys it leaves
/// out from the default values.
pub struct DefaultRunnerConstructor {
    runner_cfg: ConfigDict,
    default_args: Option<RunnerDefaults>,
}

impl DefaultRunnerConstructor {
    pub fn new(runner_cfg: ConfigDict, default_args: Option<RunnerDefaults>) -> Self {
        Self {
            runner_cfg,
            default_args,
        }
    }
}

impl RunnerConstructor for DefaultRunnerConstructor {
    fn construct(self: Box<Self>) -> registry::Result<Box<dyn Runner>> {
        let Self {
            runner_cfg,
            default_args,
        } = *self;
        let RunnerDefaults { values, optimizer } = default_args.unwrap_or_default();
        runners().build_with_defaults(runner_cfg, Some(&values), RunnerParts { optimizer })
    }
}

pub(crate) fn build_default(
    mut args: BuildArgs,
    default_args: Option<RunnerDefaults>,
) -> registry::Result<Box<dyn RunnerConstructor>> {
    let runner_cfg: ConfigDict = args.require("runner_cfg")?;
    args.finish()?;
    Ok(Box::new(DefaultRunnerConstructor::new(runner_cfg, default_args)))
}
