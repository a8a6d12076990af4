use candle_core::{backprop::GradStore, Var};
use candle_nn::{AdamW, ParamsAdamW, SGD};
use registry::{BuildArgs, BuildError, Registry};

use super::Optimizer;

/// Names under which the framework's optimizers are registered.
pub const BUILTIN_OPTIMIZERS: [&str; 2] = ["SGD", "AdamW"];

/// Adapts a `candle_nn` optimizer to [`Optimizer`].
pub struct FrameworkOptimizer<O> {
    name: &'static str,
    inner: O,
    vars: Vec<Var>,
}

impl<O: candle_nn::Optimizer> FrameworkOptimizer<O> {
    pub fn new(name: &'static str, vars: Vec<Var>, config: O::Config) -> candle_core::Result<Self> {
        let vars: Vec<Var> = vars.into_iter().filter(|var| var.dtype().is_float()).collect();
        let inner = O::new(vars.clone(), config)?;
        Ok(Self { name, inner, vars })
    }
}

impl<O: candle_nn::Optimizer> Optimizer for FrameworkOptimizer<O> {
    fn name(&self) -> &str {
        self.name
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.inner.step(grads)
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr)
    }

    fn params(&self) -> Vec<Var> {
        self.vars.clone()
    }
}

/// Registers every optimizer shipped by `candle_nn` and returns their names.
pub fn register_builtin_optimizers(
    registry: &Registry<Box<dyn Optimizer>, Vec<Var>>,
) -> Vec<String> {
    registry.register_force("SGD", build_sgd);
    registry.register_force("AdamW", build_adamw);
    BUILTIN_OPTIMIZERS.iter().map(|name| name.to_string()).collect()
}

fn build_sgd(mut args: BuildArgs, vars: Vec<Var>) -> registry::Result<Box<dyn Optimizer>> {
    let lr: f64 = args.require("lr")?;
    let momentum: f64 = args.take_or("momentum", 0.0)?;
    let weight_decay: f64 = args.take_or("weight_decay", 0.0)?;
    check_non_negative(&args, "lr", lr)?;
    if momentum != 0.0 {
        return Err(args.invalid("momentum", "only plain SGD without momentum is available"));
    }
    if weight_decay != 0.0 {
        return Err(args.invalid("weight_decay", "SGD does not apply weight decay, use AdamW"));
    }
    args.finish()?;

    let optimizer = FrameworkOptimizer::<SGD>::new("SGD", vars, lr)
        .map_err(|err| BuildError::construction("SGD", err.to_string()))?;
    Ok(Box::new(optimizer))
}

fn build_adamw(mut args: BuildArgs, vars: Vec<Var>) -> registry::Result<Box<dyn Optimizer>> {
    let defaults = ParamsAdamW::default();
    let lr: f64 = args.take_or("lr", 1e-3)?;
    let [beta1, beta2]: [f64; 2] = args.take_or("betas", [defaults.beta1, defaults.beta2])?;
    let eps: f64 = args.take_or("eps", defaults.eps)?;
    let weight_decay: f64 = args.take_or("weight_decay", defaults.weight_decay)?;
    let amsgrad: bool = args.take_or("amsgrad", false)?;

    check_non_negative(&args, "lr", lr)?;
    check_non_negative(&args, "eps", eps)?;
    check_non_negative(&args, "weight_decay", weight_decay)?;
    for beta in [beta1, beta2] {
        if !(0.0..1.0).contains(&beta) {
            return Err(args.invalid("betas", format!("invalid beta parameter: {}", beta)));
        }
    }
    if amsgrad {
        return Err(args.invalid("amsgrad", "the AMSGrad variant is not available"));
    }
    args.finish()?;

    let params = ParamsAdamW {
        lr,
        beta1,
        beta2,
        eps,
        weight_decay,
    };
    let optimizer = FrameworkOptimizer::<AdamW>::new("AdamW", vars, params)
        .map_err(|err| BuildError::construction("AdamW", err.to_string()))?;
    Ok(Box::new(optimizer))
}

fn check_non_negative(args: &BuildArgs, key: &str, value: f64) -> registry::Result<()> {
    if value.is_finite() && value >= 0.0 {
        return Ok(());
    }
    Err(args.invalid(key, format!("invalid value: {}", value)))
}
