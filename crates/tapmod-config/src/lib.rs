//! Configuration model for tapmod
//!
//! The daemon has no configuration file: [`Config::default`] holds the
//! built-in remapping tables, and the whole structure is immutable once built.
//! The key state helpers in [`keys`] are shared by the daemon and the CLI.

mod error;
pub mod keys;
mod model;

pub use error::ConfigError;
pub use keys::key_state_changes;
pub use model::*;
