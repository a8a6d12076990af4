use registry::{BuildError, ConfigDict};
use serde_json::Value;

/// Key selecting the constructor used by the top-level builders.
pub const CONSTRUCTOR_KEY: &str = "constructor";

/// Pops `constructor` from `cfg`, falling back to `default` when it is absent
/// or null.
pub(crate) fn take_constructor(
    cfg: &mut ConfigDict,
    kind: &str,
    default: &str,
) -> registry::Result<String> {
    match cfg.remove(CONSTRUCTOR_KEY) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(name)) => Ok(name),
        Some(other) => Err(BuildError::InvalidArgument {
            type_name: kind.to_string(),
            key: CONSTRUCTOR_KEY.to_string(),
            reason: format!("expected a constructor name, found `{}`", other),
        }),
    }
}
