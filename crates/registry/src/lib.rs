//! Configuration-driven object construction.
//!
//! A [`Registry`] maps string identifiers to factories. Builders hand it a
//! [`ConfigDict`] whose `type` key selects the factory; every other key is
//! forwarded to it through [`BuildArgs`].

pub mod config;
pub mod error;
mod table;

pub use config::{parse_override_value, BuildArgs, ConfigDict, TYPE_KEY};
pub use error::{BuildError, Result};
pub use table::{Factory, Registry};
