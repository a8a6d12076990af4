use std::collections::BTreeMap;

use candle_core::{backprop::GradStore, Var};
use serde::Deserialize;

use super::Optimizer;

/// Per-parameter multipliers applied on top of the base `lr` and
/// `weight_decay` of an optimizer config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamwiseConfig {
    /// Substring of a parameter name mapped to the multipliers it receives.
    #[serde(default)]
    pub custom_keys: BTreeMap<String, KeyMultipliers>,
    pub bias_lr_mult: Option<f64>,
    pub bias_decay_mult: Option<f64>,
    pub norm_decay_mult: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyMultipliers {
    pub lr_mult: Option<f64>,
    pub decay_mult: Option<f64>,
}

/// Multipliers resolved for a single parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Multipliers {
    lr: f64,
    decay: f64,
}

impl ParamwiseConfig {
    pub fn uses_decay_mult(&self) -> bool {
        self.bias_decay_mult.is_some()
            || self.norm_decay_mult.is_some()
            || self.custom_keys.values().any(|key| key.decay_mult.is_some())
    }

    pub fn uses_lr_mult(&self) -> bool {
        self.bias_lr_mult.is_some() || self.custom_keys.values().any(|key| key.lr_mult.is_some())
    }

    /// Custom keys ordered longest first, ties alphabetically.
    fn sorted_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.custom_keys.keys().map(String::as_str).collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        keys
    }

    fn resolve(&self, name: &str, sorted_keys: &[&str]) -> Multipliers {
        if let Some(key) = sorted_keys.iter().find(|key| name.contains(**key)) {
            let custom = self.custom_keys[*key];
            return Multipliers {
                lr: custom.lr_mult.unwrap_or(1.0),
                decay: custom.decay_mult.unwrap_or(1.0),
            };
        }

        let norm = is_norm_param(name);
        let bias = name.rsplit('.').next() == Some("bias");
        let mut multipliers = Multipliers { lr: 1.0, decay: 1.0 };
        if bias && !norm {
            multipliers.lr = self.bias_lr_mult.unwrap_or(1.0);
        }
        if norm {
            multipliers.decay = self.norm_decay_mult.unwrap_or(1.0);
        } else if bias {
            multipliers.decay = self.bias_decay_mult.unwrap_or(1.0);
        }
        multipliers
    }

    /// Splits `params` into groups sharing the same effective `lr` and
    /// `weight_decay` and the same multipliers, in order of first appearance.
    /// Different multipliers never share a group, even when a zero base `lr`
    /// makes their effective rates equal.
    pub fn group(
        &self,
        params: Vec<(String, Var)>,
        base_lr: Option<f64>,
        base_wd: Option<f64>,
    ) -> Vec<ParamGroup> {
        let sorted_keys = self.sorted_keys();
        let mut groups: Vec<ParamGroup> = Vec::new();
        for (name, var) in params {
            let multipliers = self.resolve(&name, &sorted_keys);
            let lr = base_lr.map(|lr| lr * multipliers.lr);
            let weight_decay = base_wd.map(|wd| wd * multipliers.decay);
            log::debug!(
                "paramwise: {} lr_mult={} decay_mult={}",
                name,
                multipliers.lr,
                multipliers.decay
            );

            match groups.iter_mut().find(|group| {
                group.lr == lr
                    && group.weight_decay == weight_decay
                    && group.lr_mult == multipliers.lr
                    && group.decay_mult == multipliers.decay
            }) {
                Some(group) => group.params.push((name, var)),
                None => groups.push(ParamGroup {
                    lr,
                    weight_decay,
                    lr_mult: multipliers.lr,
                    decay_mult: multipliers.decay,
                    params: vec![(name, var)],
                }),
            }
        }

        if groups.is_empty() {
            groups.push(ParamGroup {
                lr: base_lr,
                weight_decay: base_wd,
                lr_mult: 1.0,
                decay_mult: 1.0,
                params: Vec::new(),
            });
        }
        groups
    }
}

/// Whether a path segment before the parameter's own name looks like a
/// normalisation layer (`bn1.weight`, `backbone.norm.bias`).
fn is_norm_param(name: &str) -> bool {
    let mut segments: Vec<&str> = name.split('.').collect();
    segments.pop();
    segments.iter().any(|segment| {
        let segment = segment.to_ascii_lowercase();
        ["norm", "bn", "ln", "gn"]
            .iter()
            .any(|prefix| segment.starts_with(prefix))
    })
}

#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub lr: Option<f64>,
    pub weight_decay: Option<f64>,
    /// Ratio of this group's learning rate to the base learning rate.
    pub lr_mult: f64,
    pub decay_mult: f64,
    pub params: Vec<(String, Var)>,
}

impl ParamGroup {
    pub fn names(&self) -> Vec<&str> {
        self.params.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn vars(&self) -> Vec<Var> {
        self.params.iter().map(|(_, var)| var.clone()).collect()
    }
}

/// One optimizer per parameter group, stepped together.
pub struct ParamGroupOptimizer {
    name: String,
    base_lr: f64,
    groups: Vec<(f64, Box<dyn Optimizer>)>,
}

impl ParamGroupOptimizer {
    /// `groups` pairs each optimizer with its learning-rate multiplier.
    pub fn new(base_lr: f64, groups: Vec<(f64, Box<dyn Optimizer>)>) -> Self {
        let name = groups
            .first()
            .map(|(_, optimizer)| optimizer.name().to_string())
            .unwrap_or_default();
        Self {
            name,
            base_lr,
            groups,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Learning rates of each group, in group order.
    pub fn group_learning_rates(&self) -> Vec<f64> {
        self.groups
            .iter()
            .map(|(_, optimizer)| optimizer.learning_rate())
            .collect()
    }
}

impl Optimizer for ParamGroupOptimizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (_, optimizer) in self.groups.iter_mut() {
            optimizer.step(grads)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.base_lr = lr;
        for (lr_mult, optimizer) in self.groups.iter_mut() {
            optimizer.set_learning_rate(lr * *lr_mult);
        }
    }

    fn params(&self) -> Vec<Var> {
        self.groups
            .iter()
            .flat_map(|(_, optimizer)| optimizer.params())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::FrameworkOptimizer;
    use candle_core::Device;
    use candle_nn::SGD;
    use serde_json::json;

    fn param(name: &str) -> (String, Var) {
        (name.to_string(), Var::new(&[0.0f32], &Device::Cpu).unwrap())
    }

    fn paramwise(value: serde_json::Value) -> ParamwiseConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn longest_custom_key_wins() {
        let cfg = paramwise(json!({
            "custom_keys": {
                "backbone": {"lr_mult": 0.1},
                "backbone.layer1": {"lr_mult": 0.0},
            }
        }));
        let keys = cfg.sorted_keys();
        assert_eq!(keys, vec!["backbone.layer1", "backbone"]);
        assert_eq!(cfg.resolve("backbone.layer1.conv.weight", &keys).lr, 0.0);
        assert_eq!(cfg.resolve("backbone.layer2.conv.weight", &keys).lr, 0.1);
        assert_eq!(cfg.resolve("head.fc.weight", &keys).lr, 1.0);
    }

    #[test]
    fn equal_length_keys_resolve_alphabetically() {
        let cfg = paramwise(json!({
            "custom_keys": {"head": {"lr_mult": 2.0}, "cls_": {"lr_mult": 3.0}}
        }));
        assert_eq!(cfg.sorted_keys(), vec!["cls_", "head"]);
        assert_eq!(cfg.resolve("head.cls_fc.weight", &cfg.sorted_keys()).lr, 3.0);
    }

    #[test]
    fn bias_and_norm_multipliers() {
        let cfg = paramwise(json!({
            "bias_lr_mult": 2.0,
            "bias_decay_mult": 0.0,
            "norm_decay_mult": 0.5,
        }));
        let keys = cfg.sorted_keys();
        assert_eq!(
            cfg.resolve("conv1.bias", &keys),
            Multipliers { lr: 2.0, decay: 0.0 }
        );
        assert_eq!(
            cfg.resolve("bn1.bias", &keys),
            Multipliers { lr: 1.0, decay: 0.5 }
        );
        assert_eq!(
            cfg.resolve("layer.norm.weight", &keys),
            Multipliers { lr: 1.0, decay: 0.5 }
        );
        assert_eq!(
            cfg.resolve("conv1.weight", &keys),
            Multipliers { lr: 1.0, decay: 1.0 }
        );
    }

    #[test]
    fn bias_is_matched_on_the_leaf_name() {
        let cfg = paramwise(json!({"bias_lr_mult": 2.0, "bias_decay_mult": 0.0}));
        let keys = cfg.sorted_keys();
        assert_eq!(
            cfg.resolve("blocks.0.attn.q_bias", &keys),
            Multipliers { lr: 1.0, decay: 1.0 }
        );
        assert_eq!(
            cfg.resolve("pos_bias", &keys),
            Multipliers { lr: 1.0, decay: 1.0 }
        );
        assert_eq!(cfg.resolve("bias", &keys), Multipliers { lr: 2.0, decay: 0.0 });
        assert_eq!(
            cfg.resolve("blocks.0.attn.proj.bias", &keys),
            Multipliers { lr: 2.0, decay: 0.0 }
        );
    }

    #[test]
    fn norm_detection_ignores_the_leaf_name() {
        assert!(is_norm_param("encoder.ln_f.weight"));
        assert!(is_norm_param("gn.bias"));
        assert!(!is_norm_param("bnorm"));
        assert!(!is_norm_param("encoder.attention.weight"));
    }

    #[test]
    fn groups_share_identical_settings() {
        let cfg = paramwise(json!({"bias_decay_mult": 0.0}));
        let groups = cfg.group(
            vec![param("fc1.weight"), param("fc1.bias"), param("fc2.weight"), param("fc2.bias")],
            Some(0.1),
            Some(1e-4),
        );
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].names(), vec!["fc1.weight", "fc2.weight"]);
        assert_eq!(groups[0].weight_decay, Some(1e-4));
        assert_eq!(groups[1].names(), vec!["fc1.bias", "fc2.bias"]);
        assert_eq!(groups[1].weight_decay, Some(0.0));
        assert_eq!(groups[1].lr, Some(0.1));
    }

    #[test]
    fn zero_base_lr_keeps_multipliers_apart() {
        let cfg = paramwise(json!({"custom_keys": {"backbone": {"lr_mult": 0.1}}}));
        let groups = cfg.group(
            vec![param("backbone.w"), param("head.w"), param("backbone.b")],
            Some(0.0),
            None,
        );
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].names(), vec!["backbone.w", "backbone.b"]);
        assert_eq!(groups[0].lr_mult, 0.1);
        assert_eq!(groups[1].names(), vec!["head.w"]);
        assert_eq!(groups[1].lr_mult, 1.0);
        assert_eq!(groups[0].lr, groups[1].lr);
    }

    #[test]
    fn learning_rate_updates_scale_each_group() {
        let cfg = paramwise(json!({"custom_keys": {"backbone": {"lr_mult": 0.1}}}));
        let groups = cfg.group(vec![param("backbone.w"), param("head.w")], Some(0.0), None);
        let built: Vec<(f64, Box<dyn Optimizer>)> = groups
            .iter()
            .map(|group| {
                let sgd = FrameworkOptimizer::<SGD>::new("SGD", group.vars(), 0.0).unwrap();
                (group.lr_mult, Box::new(sgd) as Box<dyn Optimizer>)
            })
            .collect();
        let mut optimizer = ParamGroupOptimizer::new(0.0, built);
        assert_eq!(optimizer.num_groups(), 2);

        optimizer.set_learning_rate(1.0);
        assert_eq!(optimizer.learning_rate(), 1.0);
        assert_eq!(optimizer.group_learning_rates(), vec![0.1, 1.0]);
    }

    #[test]
    fn empty_model_yields_a_single_empty_group() {
        let groups = ParamwiseConfig::default().group(Vec::new(), Some(0.1), None);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].params.is_empty());
        assert_eq!(groups[0].lr, Some(0.1));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_value::<ParamwiseConfig>(json!({"bias_lr": 2.0}));
        assert!(result.is_err());
    }
}
