use registry::{BuildArgs, BuildError, ConfigDict};
use serde_json::Value;

use super::{optimizers, NamedParameters, Optimizer, ParamGroupOptimizer, ParamwiseConfig};

pub const DEFAULT_OPTIMIZER_CONSTRUCTOR: &str = "DefaultOptimizerConstructor";

/// Turns a model into an optimizer over its parameters.
pub trait OptimizerConstructor {
    fn construct(&self, model: &dyn NamedParameters) -> registry::Result<Box<dyn Optimizer>>;
}

/// Builds the configured optimizer over all parameters, or one optimizer per
/// parameter group when a [`ParamwiseConfig`] is given.
#[derive(Debug, Clone)]
pub struct DefaultOptimizerConstructor {
    optimizer_cfg: ConfigDict,
    paramwise_cfg: Option<ParamwiseConfig>,
    base_lr: Option<f64>,
    base_wd: Option<f64>,
}

impl DefaultOptimizerConstructor {
    pub fn new(
        optimizer_cfg: ConfigDict,
        paramwise_cfg: Option<ParamwiseConfig>,
    ) -> registry::Result<Self> {
        let base_lr = optimizer_cfg.get("lr").and_then(Value::as_f64);
        let base_wd = optimizer_cfg.get("weight_decay").and_then(Value::as_f64);
        let constructor = Self {
            optimizer_cfg,
            paramwise_cfg,
            base_lr,
            base_wd,
        };
        constructor.validate()?;
        Ok(constructor)
    }

    fn validate(&self) -> registry::Result<()> {
        if self.optimizer_cfg.type_name().is_none() {
            return Err(BuildError::MissingArgument {
                type_name: DEFAULT_OPTIMIZER_CONSTRUCTOR.to_string(),
                key: "optimizer_cfg.type".to_string(),
            });
        }
        let Some(paramwise) = &self.paramwise_cfg else {
            return Ok(());
        };
        if paramwise.uses_decay_mult() && self.base_wd.is_none() {
            return Err(invalid_paramwise("decay multipliers need a base weight_decay"));
        }
        if paramwise.uses_lr_mult() && self.base_lr.is_none() {
            return Err(invalid_paramwise("lr multipliers need a base lr"));
        }
        Ok(())
    }
}

impl OptimizerConstructor for DefaultOptimizerConstructor {
    fn construct(&self, model: &dyn NamedParameters) -> registry::Result<Box<dyn Optimizer>> {
        let params = model.named_parameters();
        let Some(paramwise) = &self.paramwise_cfg else {
            let vars = params.into_iter().map(|(_, var)| var).collect();
            return optimizers().build(self.optimizer_cfg.clone(), vars);
        };

        let groups = paramwise.group(params, self.base_lr, self.base_wd);
        let mut built = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut cfg = self.optimizer_cfg.clone();
            if let Some(lr) = group.lr {
                cfg.insert("lr", lr);
            }
            if let Some(weight_decay) = group.weight_decay {
                cfg.insert("weight_decay", weight_decay);
            }
            built.push((group.lr_mult, optimizers().build(cfg, group.vars())?));
        }
        log::debug!("built {} parameter group(s)", built.len());

        let base_lr = match self.base_lr {
            Some(lr) => lr,
            None => built
                .first()
                .map(|(_, optimizer)| optimizer.learning_rate())
                .unwrap_or_default(),
        };
        Ok(Box::new(ParamGroupOptimizer::new(base_lr, built)))
    }
}

fn invalid_paramwise(reason: &str) -> BuildError {
    BuildError::InvalidArgument {
        type_name: DEFAULT_OPTIMIZER_CONSTRUCTOR.to_string(),
        key: "paramwise_cfg".to_string(),
        reason: reason.to_string(),
    }
}

pub(crate) fn build_default(
    mut args: BuildArgs,
    _: (),
) -> registry::Result<Box<dyn OptimizerConstructor>> {
    let optimizer_cfg: ConfigDict = args.require("optimizer_cfg")?;
    let paramwise_cfg: Option<ParamwiseConfig> = args.take("paramwise_cfg")?;
    args.finish()?;
    Ok(Box::new(DefaultOptimizerConstructor::new(
        optimizer_cfg,
        paramwise_cfg,
    )?))
}
