//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("failed to parse TOML config: {0}")]
    ParseText(#[from] Box<toml::de::Error>),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("connection references unknown node `{0}`")]
    UnknownNode(String),

    #[error(transparent)]
    Spec(#[from] fabline_types::SpecError),

    #[error(transparent)]
    Build(#[from] fabline::SimError),
}
