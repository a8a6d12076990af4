use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarMap};
use registry::{BuildArgs, BuildError, ConfigDict};
use serde_json::json;
use training::{
    build_optimizer, optimizer_builders, optimizers, NamedParameters, Optimizer,
    OptimizerConstructor, DEFAULT_OPTIMIZER_CONSTRUCTOR,
};

fn cfg(value: serde_json::Value) -> ConfigDict {
    ConfigDict::from_value(value).unwrap()
}

fn params(names: &[&str]) -> Vec<(String, Var)> {
    names
        .iter()
        .map(|name| {
            let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
            (name.to_string(), var)
        })
        .collect()
}

fn values(model: &[(String, Var)]) -> Vec<f32> {
    model
        .iter()
        .map(|(_, var)| var.as_tensor().to_vec1::<f32>().unwrap()[0])
        .collect()
}

/// Sum of every parameter, so each gradient is one.
fn total(model: &[(String, Var)]) -> Tensor {
    let tensors: Vec<Tensor> = model.iter().map(|(_, var)| var.as_tensor().clone()).collect();
    Tensor::cat(&tensors, 0).unwrap().sum_all().unwrap()
}

#[test]
fn default_constructor_uses_every_parameter() {
    let varmap = VarMap::new();
    varmap
        .get((2, 3), "encoder.weight", Init::Const(0.5), DType::F32, &Device::Cpu)
        .unwrap();
    varmap
        .get(3, "encoder.bias", Init::Const(0.0), DType::F32, &Device::Cpu)
        .unwrap();

    let optimizer = build_optimizer(&varmap, &cfg(json!({"type": "SGD", "lr": 0.01}))).unwrap();
    assert_eq!(optimizer.name(), "SGD");
    assert_eq!(optimizer.learning_rate(), 0.01);
    assert_eq!(optimizer.params().len(), 2);

    let names: Vec<String> = varmap.named_parameters().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["encoder.bias", "encoder.weight"]);
}

#[test]
fn config_is_not_modified_by_building() {
    let original = cfg(json!({
        "type": "AdamW",
        "lr": 0.1,
        "constructor": DEFAULT_OPTIMIZER_CONSTRUCTOR,
        "paramwise_cfg": {"bias_lr_mult": 2.0},
    }));
    let copy = original.clone();
    build_optimizer(&params(&["fc.weight", "fc.bias"]), &original).unwrap();
    assert_eq!(original, copy);
}

#[test]
fn unregistered_optimizer_is_a_lookup_error() {
    let err = build_optimizer(&params(&["w"]), &cfg(json!({"type": "Adagrad", "lr": 0.1})))
        .err()
        .unwrap();
    assert!(err.is_lookup());
    assert_eq!(
        err.to_string(),
        "Adagrad is not registered in the optimizer registry"
    );
}

#[test]
fn unregistered_constructor_is_a_lookup_error() {
    let err = build_optimizer(
        &params(&["w"]),
        &cfg(json!({"type": "SGD", "lr": 0.1, "constructor": "LayerDecayConstructor"})),
    )
    .err()
    .unwrap();
    assert_eq!(
        err.to_string(),
        "LayerDecayConstructor is not registered in the optimizer builder registry"
    );
}

#[test]
fn non_string_constructor_is_rejected() {
    let err = build_optimizer(
        &params(&["w"]),
        &cfg(json!({"type": "SGD", "lr": 0.1, "constructor": 3})),
    )
    .err()
    .unwrap();
    assert!(matches!(err, BuildError::InvalidArgument { ref key, .. } if key == "constructor"));
}

#[test]
fn missing_type_is_reported() {
    let err = build_optimizer(&params(&["w"]), &cfg(json!({"lr": 0.1})))
        .err()
        .unwrap();
    assert!(matches!(err, BuildError::MissingArgument { ref key, .. } if key == "optimizer_cfg.type"));
}

#[test]
fn unexpected_optimizer_arguments_are_rejected() {
    let err = build_optimizer(
        &params(&["w"]),
        &cfg(json!({"type": "SGD", "lr": 0.1, "nesterov": true})),
    )
    .err()
    .unwrap();
    match err {
        BuildError::UnexpectedArguments { type_name, keys } => {
            assert_eq!(type_name, "SGD");
            assert_eq!(keys, vec!["nesterov".to_string()]);
        }
        other => panic!("unexpected error {other}"),
    }
}

struct HeadOnlyConstructor {
    optimizer_cfg: ConfigDict,
}

impl OptimizerConstructor for HeadOnlyConstructor {
    fn construct(
        &self,
        model: &dyn NamedParameters,
    ) -> registry::Result<Box<dyn Optimizer>> {
        let vars = model
            .named_parameters()
            .into_iter()
            .filter(|(name, _)| name.starts_with("head."))
            .map(|(_, var)| var)
            .collect();
        optimizers().build(self.optimizer_cfg.clone(), vars)
    }
}

#[test]
fn custom_constructor_can_be_registered() {
    optimizer_builders()
        .register("HeadOnlyConstructor", |mut args: BuildArgs, _: ()| {
            let optimizer_cfg: ConfigDict = args.require("optimizer_cfg")?;
            // paramwise_cfg is always forwarded, null when absent
            let _: Option<serde_json::Value> = args.take("paramwise_cfg")?;
            args.finish()?;
            Ok(Box::new(HeadOnlyConstructor { optimizer_cfg }) as Box<dyn OptimizerConstructor>)
        })
        .unwrap();

    let model = params(&["backbone.conv.weight", "head.fc.weight", "head.fc.bias"]);
    let optimizer = build_optimizer(
        &model,
        &cfg(json!({"type": "SGD", "lr": 0.5, "constructor": "HeadOnlyConstructor"})),
    )
    .unwrap();
    assert_eq!(optimizer.params().len(), 2);
}

#[test]
fn paramwise_lr_multipliers_reach_each_group() {
    let model = params(&["backbone.conv.weight", "backbone.bn.weight", "head.fc.bias"]);
    let mut optimizer = build_optimizer(
        &model,
        &cfg(json!({
            "type": "AdamW",
            "lr": 0.1,
            "weight_decay": 0.0,
            "paramwise_cfg": {"custom_keys": {"backbone": {"lr_mult": 0.1}}},
        })),
    )
    .unwrap();
    assert_eq!(optimizer.params().len(), 3);
    assert_eq!(optimizer.learning_rate(), 0.1);

    // The first AdamW update moves each parameter by about its group's lr.
    optimizer.backward_step(&total(&model)).unwrap();
    let after = values(&model);
    assert!((after[0] - 0.99).abs() < 1e-5, "{after:?}");
    assert!((after[1] - 0.99).abs() < 1e-5, "{after:?}");
    assert!((after[2] - 0.9).abs() < 1e-5, "{after:?}");

    optimizer.set_learning_rate(0.2);
    assert_eq!(optimizer.learning_rate(), 0.2);
}

#[test]
fn zero_base_lr_keeps_group_multipliers_for_later_updates() {
    let model = params(&["backbone.w", "head.w"]);
    let mut optimizer = build_optimizer(
        &model,
        &cfg(json!({
            "type": "AdamW",
            "lr": 0.0,
            "weight_decay": 0.0,
            "paramwise_cfg": {"custom_keys": {"backbone": {"lr_mult": 0.1}}},
        })),
    )
    .unwrap();

    // A warmup schedule raising the rate from zero.
    optimizer.set_learning_rate(1.0);
    optimizer.backward_step(&total(&model)).unwrap();
    let after = values(&model);
    assert!((after[0] - 0.9).abs() < 1e-5, "{after:?}");
    assert!(after[1].abs() < 1e-5, "{after:?}");
}

#[test]
fn decay_multipliers_need_a_base_weight_decay() {
    let err = build_optimizer(
        &params(&["fc.bias"]),
        &cfg(json!({"type": "SGD", "lr": 0.1, "paramwise_cfg": {"bias_decay_mult": 0.0}})),
    )
    .err()
    .unwrap();
    assert!(matches!(err, BuildError::InvalidArgument { ref key, .. } if key == "paramwise_cfg"));
}

#[test]
fn lr_multipliers_need_a_base_lr() {
    let err = build_optimizer(
        &params(&["fc.bias"]),
        &cfg(json!({"type": "AdamW", "paramwise_cfg": {"bias_lr_mult": 2.0}})),
    )
    .err()
    .unwrap();
    assert!(matches!(err, BuildError::InvalidArgument { ref key, .. } if key == "paramwise_cfg"));
}

#[test]
fn unknown_paramwise_fields_are_rejected() {
    let err = build_optimizer(
        &params(&["fc.bias"]),
        &cfg(json!({"type": "SGD", "lr": 0.1, "paramwise_cfg": {"dwconv_decay_mult": 0.0}})),
    )
    .err()
    .unwrap();
    assert!(matches!(err, BuildError::InvalidArgument { ref key, .. } if key == "paramwise_cfg"));
}

#[test]
fn empty_model_still_builds() {
    let model: Vec<(String, Var)> = Vec::new();
    let optimizer = build_optimizer(
        &model,
        &cfg(json!({"type": "SGD", "lr": 0.1, "paramwise_cfg": {}})),
    )
    .unwrap();
    assert!(optimizer.params().is_empty());
}
