use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use serde_json::Value;

use crate::{
    config::{BuildArgs, ConfigDict, TYPE_KEY},
    error::{value_kind, BuildError, Result},
};

/// Factory stored under a registered name. `C` carries context that cannot
/// live in a configuration mapping, such as parameter handles.
pub type Factory<T, C> = dyn Fn(BuildArgs, C) -> Result<T> + Send + Sync;

/// Process-wide mapping from string identifier to factory.
pub struct Registry<T, C = ()> {
    name: String,
    factories: RwLock<BTreeMap<String, Arc<Factory<T, C>>>>,
}

impl<T, C> Registry<T, C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers `factory` under `name`; an existing entry is an error.
    pub fn register<F>(&self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(BuildArgs, C) -> Result<T> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(&name) {
            return Err(BuildError::AlreadyRegistered {
                name,
                registry: self.name.clone(),
            });
        }
        log::debug!("registered {} in the {} registry", name, self.name);
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Registers `factory` under `name`, replacing any existing entry.
    pub fn register_force<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(BuildArgs, C) -> Result<T> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut factories = self.factories.write().unwrap_or_else(PoisonError::into_inner);
        if factories.insert(name.clone(), Arc::new(factory)).is_some() {
            log::debug!("replaced {} in the {} registry", name, self.name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.factories.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<Arc<Factory<T, C>>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Pops `type` from `cfg`, resolves it and calls the factory with the
    /// remaining keys.
    pub fn build(&self, cfg: ConfigDict, ctx: C) -> Result<T> {
        self.build_with_defaults(cfg, None, ctx)
    }

    /// Like [`Registry::build`], first filling keys missing from `cfg` with
    /// `defaults` (including `type`).
    pub fn build_with_defaults(
        &self,
        mut cfg: ConfigDict,
        defaults: Option<&ConfigDict>,
        ctx: C,
    ) -> Result<T> {
        if let Some(defaults) = defaults {
            cfg.merge_defaults(defaults);
        }

        let type_name = match cfg.remove(TYPE_KEY) {
            Some(Value::String(name)) => name,
            Some(other) => {
                return Err(BuildError::InvalidType {
                    registry: self.name.clone(),
                    found: value_kind(&other),
                })
            }
            None => {
                return Err(BuildError::MissingType {
                    registry: self.name.clone(),
                })
            }
        };

        // The lock is released before the factory runs so factories may
        // consult other registries, or this one.
        let factory = self.get(&type_name).ok_or_else(|| BuildError::NotRegistered {
            name: type_name.clone(),
            registry: self.name.clone(),
        })?;

        log::debug!(
            "building {} `{}` with {} argument(s)",
            self.name,
            type_name,
            cfg.len()
        );
        factory(BuildArgs::new(type_name, cfg), ctx)
    }
}

impl<T, C> fmt::Debug for Registry<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("items", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq)]
    struct Linear {
        in_features: usize,
        out_features: usize,
        bias: bool,
    }

    fn linear_registry() -> Registry<Linear> {
        let registry = Registry::new("layer");
        registry
            .register("Linear", |mut args: BuildArgs, _: ()| {
                let linear = Linear {
                    in_features: args.require("in_features")?,
                    out_features: args.require("out_features")?,
                    bias: args.take_or("bias", true)?,
                };
                args.finish()?;
                Ok(linear)
            })
            .unwrap();
        registry
    }

    fn cfg(value: serde_json::Value) -> ConfigDict {
        ConfigDict::from_value(value).unwrap()
    }

    #[test]
    fn builds_registered_type_with_remaining_keys() {
        let registry = linear_registry();
        let built = registry
            .build(
                cfg(json!({"type": "Linear", "in_features": 4, "out_features": 2})),
                (),
            )
            .unwrap();
        assert_eq!(
            built,
            Linear {
                in_features: 4,
                out_features: 2,
                bias: true
            }
        );
    }

    #[test]
    fn unknown_type_is_a_lookup_error() {
        let registry = linear_registry();
        let err = registry
            .build(cfg(json!({"type": "Conv2d"})), ())
            .unwrap_err();
        assert!(err.is_lookup());
        assert_eq!(err.to_string(), "Conv2d is not registered in the layer registry");
    }

    #[test]
    fn missing_or_non_string_type() {
        let registry = linear_registry();
        let err = registry.build(cfg(json!({"in_features": 1})), ()).unwrap_err();
        assert!(matches!(err, BuildError::MissingType { .. }));

        let err = registry.build(cfg(json!({"type": 7})), ()).unwrap_err();
        assert!(matches!(err, BuildError::InvalidType { found: "a number", .. }));
    }

    #[test]
    fn defaults_fill_missing_keys_only() {
        let registry = linear_registry();
        let defaults = cfg(json!({"type": "Linear", "in_features": 8, "bias": false}));
        let built = registry
            .build_with_defaults(
                cfg(json!({"in_features": 3, "out_features": 1})),
                Some(&defaults),
                (),
            )
            .unwrap();
        assert_eq!(built.in_features, 3);
        assert!(!built.bias);
    }

    #[test]
    fn duplicate_registration_is_rejected_unless_forced() {
        let registry = linear_registry();
        let err = registry
            .register("Linear", |_: BuildArgs, _: ()| {
                Err(BuildError::construction("Linear", "unused"))
            })
            .unwrap_err();
        assert!(matches!(err, BuildError::AlreadyRegistered { .. }));

        registry.register_force("Linear", |_: BuildArgs, _: ()| {
            Ok(Linear {
                in_features: 0,
                out_features: 0,
                bias: false,
            })
        });
        let built = registry.build(cfg(json!({"type": "Linear"})), ()).unwrap();
        assert_eq!(built.in_features, 0);
        assert_eq!(registry.names(), vec!["Linear".to_string()]);
    }
}
