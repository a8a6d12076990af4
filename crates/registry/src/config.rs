//! String-keyed configuration mappings.
//!
//! A [`ConfigDict`] is the unit every builder consumes: a `type` key naming a
//! registered factory plus arbitrary arguments forwarded to it. Files in TOML
//! or JSON load into the same representation so callers can keep optimizer
//! and runner sections next to the rest of their training configuration.

use std::{fs, path::Path};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{value_kind, BuildError, Result};

/// Key holding the registered name of the object to build.
pub const TYPE_KEY: &str = "type";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigDict(Map<String, Value>);

impl ConfigDict {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(BuildError::NotAMapping(value_kind(&other))),
        }
    }

    /// Loads a mapping from a `.toml` or `.json` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            Some("toml") | Some("tml") | None => Self::from_toml_str(&contents),
            Some(other) => Err(BuildError::Parse(format!(
                "unsupported configuration extension '{}'",
                other
            ))),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|err| BuildError::Parse(err.to_string()))
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|err| BuildError::Parse(err.to_string()))
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Removes and returns `key`, like popping from a dictionary.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The `type` entry, when present and a string.
    pub fn type_name(&self) -> Option<&str> {
        self.0.get(TYPE_KEY).and_then(Value::as_str)
    }

    /// Returns the nested mapping stored under `key`.
    pub fn section(&self, key: &str) -> Result<Option<ConfigDict>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Self::from_value(value.clone()).map(Some),
        }
    }

    /// Fills every key missing here from `defaults`; existing keys win.
    pub fn merge_defaults(&mut self, defaults: &ConfigDict) {
        for (key, value) in defaults.iter() {
            if !self.0.contains_key(key) {
                self.0.insert(key.clone(), value.clone());
            }
        }
    }

    /// Assigns `value` at a dot-separated path, creating intermediate
    /// mappings as needed (`optimizer.lr`, `runner.fp16.loss_scale`).
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(BuildError::Parse(format!("invalid override path '{}'", path)));
        }

        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| BuildError::Parse("override path must not be empty".to_string()))?;

        let mut current = &mut self.0;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if entry.is_null() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                other => {
                    return Err(BuildError::Parse(format!(
                        "override path segment '{}' points to {}",
                        segment,
                        value_kind(other)
                    )))
                }
            };
        }
        current.insert(last.to_string(), value);
        Ok(())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for ConfigDict {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<ConfigDict> for Value {
    fn from(config: ConfigDict) -> Self {
        config.into_value()
    }
}

impl TryFrom<Value> for ConfigDict {
    type Error = BuildError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl IntoIterator for ConfigDict {
    type Item = (String, Value);
    type IntoIter = serde_json::map::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Interprets a command-line override value: booleans, `null`, integers,
/// floats and inline JSON arrays/objects; anything else is a string.
pub fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Arguments handed to a factory once `type` has been popped.
///
/// Factories take the keys they understand and call [`BuildArgs::finish`],
/// which rejects anything left over the same way a constructor rejects an
/// unexpected keyword.
#[derive(Debug, Clone)]
pub struct BuildArgs {
    type_name: String,
    values: ConfigDict,
}

impl BuildArgs {
    pub fn new(type_name: impl Into<String>, values: ConfigDict) -> Self {
        Self {
            type_name: type_name.into(),
            values,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Removes `key` and deserializes it. Absent and `null` both yield `None`.
    pub fn take<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        match self.values.remove(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| self.invalid(key, err.to_string())),
        }
    }

    pub fn take_or<T: DeserializeOwned>(&mut self, key: &str, default: T) -> Result<T> {
        Ok(self.take(key)?.unwrap_or(default))
    }

    pub fn require<T: DeserializeOwned>(&mut self, key: &str) -> Result<T> {
        self.take(key)?.ok_or_else(|| BuildError::MissingArgument {
            type_name: self.type_name.clone(),
            key: key.to_string(),
        })
    }

    pub fn invalid(&self, key: &str, reason: impl Into<String>) -> BuildError {
        BuildError::InvalidArgument {
            type_name: self.type_name.clone(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn construction(&self, message: impl Into<String>) -> BuildError {
        BuildError::construction(self.type_name.clone(), message)
    }

    /// Fails if any argument was not consumed.
    pub fn finish(self) -> Result<()> {
        if self.values.is_empty() {
            return Ok(());
        }
        Err(BuildError::UnexpectedArguments {
            type_name: self.type_name,
            keys: self.values.keys().cloned().collect(),
        })
    }
}
