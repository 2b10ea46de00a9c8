use thiserror::Error;

use crate::core::ids::IdError;
use crate::engine::config::ConfigError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid rotamer id: {source}")]
    InvalidRotamerId {
        #[from]
        source: IdError,
    },

    #[error("unsupported rotamer alphabet size {n_rot}")]
    UnsupportedAlphabet { n_rot: u32 },

    #[error(
        "one-body term {index} has {found} elements but the interaction graph addresses {expected}"
    )]
    ShapeMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("configuration error: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("no node type registered under '{0}'")]
    UnknownNodeType(String),

    #[error("internal logic error: {0}")]
    Internal(String),
}
