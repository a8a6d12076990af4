use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

/// Failure while loading a configuration or building an object from it.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("config must be a mapping, got {0}")]
    NotAMapping(&'static str),

    #[error("{registry} config is missing the `type` key")]
    MissingType { registry: String },

    #[error("`type` in {registry} config must be a string, got {found}")]
    InvalidType {
        registry: String,
        found: &'static str,
    },

    #[error("{name} is not registered in the {registry} registry")]
    NotRegistered { name: String, registry: String },

    #[error("{name} is already registered in the {registry} registry")]
    AlreadyRegistered { name: String, registry: String },

    #[error("{type_name}: missing required argument `{key}`")]
    MissingArgument { type_name: String, key: String },

    #[error("{type_name}: invalid argument `{key}`: {reason}")]
    InvalidArgument {
        type_name: String,
        key: String,
        reason: String,
    },

    #[error("{type_name}: unexpected argument(s) {}", .keys.join(", "))]
    UnexpectedArguments {
        type_name: String,
        keys: Vec<String>,
    },

    #[error("{type_name}: {message}")]
    Construction { type_name: String, message: String },
}

impl BuildError {
    pub fn construction(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Construction {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// True for lookup failures (unknown or missing type name).
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            Self::NotRegistered { .. } | Self::MissingType { .. } | Self::InvalidType { .. }
        )
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}
