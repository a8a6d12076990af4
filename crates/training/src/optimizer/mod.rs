//! Optimizer construction from configuration.
//!
//! Two registries back [`build_optimizer`]: `optimizer` maps a `type` name to
//! a factory receiving the parameters to train, and `optimizer builder` maps
//! a constructor name to an [`OptimizerConstructor`] that decides how a
//! model's parameters are handed to that factory.

mod builtin;
mod constructor;
mod paramwise;

use std::sync::{OnceLock, PoisonError};

use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::VarMap;
use registry::{ConfigDict, Registry, TYPE_KEY};
use serde_json::Value;

use crate::builder::take_constructor;

pub use builtin::{register_builtin_optimizers, FrameworkOptimizer, BUILTIN_OPTIMIZERS};
pub use constructor::{
    DefaultOptimizerConstructor, OptimizerConstructor, DEFAULT_OPTIMIZER_CONSTRUCTOR,
};
pub use paramwise::{KeyMultipliers, ParamGroup, ParamGroupOptimizer, ParamwiseConfig};

/// Key popped from an optimizer config and handed to the constructor.
pub const PARAMWISE_KEY: &str = "paramwise_cfg";

/// Object-safe view over a parameter-updating optimizer.
pub trait Optimizer {
    /// Registered name of the algorithm.
    fn name(&self) -> &str;

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Parameters updated by [`Optimizer::step`].
    fn params(&self) -> Vec<Var>;

    fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }
}

/// A model seen as named trainable parameters.
pub trait NamedParameters {
    fn named_parameters(&self) -> Vec<(String, Var)>;
}

impl NamedParameters for VarMap {
    /// Sorted by name so grouping is deterministic.
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self.data().lock().unwrap_or_else(PoisonError::into_inner);
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }
}

impl NamedParameters for [(String, Var)] {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.to_vec()
    }
}

impl NamedParameters for Vec<(String, Var)> {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.clone()
    }
}

/// Registry of optimizer algorithms, seeded with the framework's optimizers.
pub fn optimizers() -> &'static Registry<Box<dyn Optimizer>, Vec<Var>> {
    static OPTIMIZERS: OnceLock<Registry<Box<dyn Optimizer>, Vec<Var>>> = OnceLock::new();
    OPTIMIZERS.get_or_init(|| {
        let registry = Registry::new("optimizer");
        let names = register_builtin_optimizers(&registry);
        log::debug!("registered built-in optimizers: {}", names.join(", "));
        registry
    })
}

/// Registry of optimizer constructors.
pub fn optimizer_builders() -> &'static Registry<Box<dyn OptimizerConstructor>> {
    static BUILDERS: OnceLock<Registry<Box<dyn OptimizerConstructor>>> = OnceLock::new();
    BUILDERS.get_or_init(|| {
        let registry = Registry::new("optimizer builder");
        registry.register_force(DEFAULT_OPTIMIZER_CONSTRUCTOR, constructor::build_default);
        registry
    })
}

pub fn build_optimizer_constructor(cfg: ConfigDict) -> registry::Result<Box<dyn OptimizerConstructor>> {
    optimizer_builders().build(cfg, ())
}

/// Builds the optimizer described by `cfg` over the parameters of `model`.
///
/// `constructor` selects the optimizer constructor (default
/// [`DEFAULT_OPTIMIZER_CONSTRUCTOR`]) and `paramwise_cfg` is forwarded to it;
/// every other key, `type` included, describes the optimizer itself. `cfg`
/// is left untouched.
pub fn build_optimizer(
    model: &dyn NamedParameters,
    cfg: &ConfigDict,
) -> registry::Result<Box<dyn Optimizer>> {
    let mut optimizer_cfg = cfg.clone();
    let constructor_type =
        take_constructor(&mut optimizer_cfg, "optimizer", DEFAULT_OPTIMIZER_CONSTRUCTOR)?;
    let paramwise_cfg = optimizer_cfg.remove(PARAMWISE_KEY).unwrap_or(Value::Null);

    let constructor = build_optimizer_constructor(
        ConfigDict::new()
            .with(TYPE_KEY, constructor_type)
            .with("optimizer_cfg", optimizer_cfg)
            .with(PARAMWISE_KEY, paramwise_cfg),
    )?;
    constructor.construct(model)
}
