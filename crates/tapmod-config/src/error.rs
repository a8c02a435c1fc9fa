use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Key {key} is declared dual-function more than once")]
    #[diagnostic(
        code(tapmod::config::duplicate_dual_function),
        help("each physical key can have only one tap/hold definition")
    )]
    DuplicateDualFunction { key: String },

    #[error("Dual-function key {key} has a zero hold threshold")]
    #[diagnostic(code(tapmod::config::zero_threshold))]
    ZeroThreshold { key: String },

    #[error("KEY_RESERVED cannot be remapped or emitted ({context})")]
    #[diagnostic(code(tapmod::config::reserved_key))]
    ReservedKey { context: String },
}
