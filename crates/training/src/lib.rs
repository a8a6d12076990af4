mod builder;
pub mod error;
pub mod optimizer;
pub mod runner;

pub use builder::CONSTRUCTOR_KEY;
pub use error::TrainingError;
pub use optimizer::{
    build_optimizer, build_optimizer_constructor, optimizer_builders, optimizers,
    DefaultOptimizerConstructor, NamedParameters, Optimizer, OptimizerConstructor,
    ParamGroupOptimizer, ParamwiseConfig, DEFAULT_OPTIMIZER_CONSTRUCTOR,
};
pub use runner::{
    build_runner, build_runner_constructor, runner_builders, runners, DefaultRunnerConstructor,
    EpochBasedRunner, IterBasedRunner, RunSummary, Runner, RunnerConstructor, RunnerDefaults,
    RunnerParts, StepContext, StepFn, DEFAULT_RUNNER_CONSTRUCTOR,
};
